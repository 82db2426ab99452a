// Integration tests for the session lifecycle
//
// The manager runs against a fake transport whose events the test injects,
// fake audio engines and an in-memory log sink.

mod common;

use anyhow::Result;
use common::{
    content_with_audio, eventually, frame, silence, within, FakeEngines, FakeTransport, MemorySink,
};
use loqa_live::error::VoiceError;
use loqa_live::protocol::{ServerContent, ServerMessage};
use loqa_live::session::{Role, SessionConfig, SessionManager, SessionState, TranscriptionEvent};
use loqa_live::transport::ChannelEvent;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Harness {
    manager: Arc<SessionManager>,
    transport: Arc<FakeTransport>,
    engines: Arc<FakeEngines>,
    sink: Arc<MemorySink>,
    transcripts: Arc<Mutex<Vec<TranscriptionEvent>>>,
}

impl Harness {
    fn new(transport: Arc<FakeTransport>, engines: Arc<FakeEngines>) -> Self {
        Self::with_config(transport, engines, SessionConfig::default())
    }

    fn with_config(
        transport: Arc<FakeTransport>,
        engines: Arc<FakeEngines>,
        config: SessionConfig,
    ) -> Self {
        let sink = MemorySink::new();
        let manager = Arc::new(SessionManager::new(
            config,
            transport.clone(),
            engines.clone(),
            sink.clone(),
        ));
        Self {
            manager,
            transport,
            engines,
            sink,
            transcripts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn connect(&self, extra_context: Option<&str>) -> Result<(), VoiceError> {
        let transcripts = Arc::clone(&self.transcripts);
        self.manager
            .connect(
                move |event| transcripts.lock().unwrap().push(event),
                extra_context.map(str::to_string),
            )
            .await
    }

    fn transcripts(&self) -> Vec<TranscriptionEvent> {
        self.transcripts.lock().unwrap().clone()
    }
}

async fn open_session() -> Result<Harness> {
    let harness = Harness::new(FakeTransport::new(true), FakeEngines::new());
    harness.connect(None).await?;
    assert!(eventually(|| harness.sink.contains("Microphone stream started")).await);
    Ok(harness)
}

#[tokio::test]
async fn test_connect_opens_session_and_starts_capture() -> Result<()> {
    let harness = open_session().await?;

    assert_eq!(harness.manager.state(), SessionState::Open);
    assert!(harness.manager.is_open());
    assert_eq!(harness.transport.opens(), 1);
    assert!(harness.sink.contains("WebSocket connection opened"));

    let stats = harness.manager.stats();
    assert!(stats.session_id.is_some());
    assert_eq!(stats.state, SessionState::Open);

    assert!(harness.engines.push_frame(frame(0.25, 1024)).await);
    assert!(eventually(|| harness.transport.sender().sent().len() == 1).await);
    Ok(())
}

#[tokio::test]
async fn test_second_connect_while_open_is_a_noop() -> Result<()> {
    let harness = open_session().await?;
    let session_id = harness.manager.stats().session_id;

    harness.connect(None).await?;

    assert_eq!(harness.transport.opens(), 1);
    assert_eq!(harness.manager.state(), SessionState::Open);
    assert_eq!(harness.manager.stats().session_id, session_id);
    Ok(())
}

#[tokio::test]
async fn test_connect_while_connecting_is_a_noop() -> Result<()> {
    let harness = Harness::new(FakeTransport::new(false), FakeEngines::new());

    let manager = Arc::clone(&harness.manager);
    let pending = tokio::spawn(async move { manager.connect(|_| {}, None).await });
    assert!(eventually(|| harness.transport.opens() == 1).await);

    harness.connect(None).await?;
    assert_eq!(harness.transport.opens(), 1);
    assert_eq!(harness.manager.state(), SessionState::Connecting);

    harness.transport.emit(ChannelEvent::Opened);
    within(pending).await??;
    assert_eq!(harness.manager.state(), SessionState::Open);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_twice_ends_idle() -> Result<()> {
    let harness = open_session().await?;
    let sender = harness.transport.sender();

    let stats = harness.manager.disconnect().await;
    assert_eq!(stats.state, SessionState::Idle);
    assert!(stats.session_id.is_some());
    assert_eq!(harness.manager.state(), SessionState::Idle);

    let again = harness.manager.disconnect().await;
    assert_eq!(again.state, SessionState::Idle);
    assert!(again.session_id.is_none());

    assert_eq!(sender.close_count(), 1);
    assert_eq!(harness.engines.output.close_count(), 1);
    assert_eq!(harness.engines.mic_stops(), 1);
    assert!(!harness.manager.is_open());
    Ok(())
}

#[tokio::test]
async fn test_disconnect_without_session_is_harmless() -> Result<()> {
    let harness = Harness::new(FakeTransport::new(true), FakeEngines::new());

    let stats = harness.manager.disconnect().await;

    assert_eq!(stats.state, SessionState::Idle);
    assert_eq!(harness.manager.state(), SessionState::Idle);
    assert!(!harness.sink.contains("All services stopped"));
    Ok(())
}

#[tokio::test]
async fn test_disconnect_before_connect_completes_releases_everything() -> Result<()> {
    let harness = Harness::new(FakeTransport::new(false), FakeEngines::new());

    let manager = Arc::clone(&harness.manager);
    let pending = tokio::spawn(async move { manager.connect(|_| {}, None).await });
    assert!(eventually(|| harness.transport.opens() == 1).await);

    harness.manager.disconnect().await;
    let result = within(pending).await?;

    assert!(matches!(result, Err(VoiceError::ChannelClosed { .. })));
    assert_eq!(harness.manager.state(), SessionState::Idle);
    assert!(harness.transport.sender().is_closed());
    assert_eq!(harness.engines.output.close_count(), 1);

    // A late acknowledgement for the abandoned channel changes nothing
    harness.transport.emit(ChannelEvent::Opened);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.manager.state(), SessionState::Idle);
    assert!(!harness.manager.is_open());
    Ok(())
}

#[tokio::test]
async fn test_remote_close_tears_down() -> Result<()> {
    let harness = open_session().await?;

    harness.transport.emit(ChannelEvent::Closed {
        code: Some(1000),
        reason: "bye".to_string(),
    });

    let manager = Arc::clone(&harness.manager);
    assert!(eventually(|| manager.state() == SessionState::Closed).await);
    assert!(eventually(|| harness.engines.output.close_count() == 1).await);
    assert!(harness.transport.sender().is_closed());
    assert_eq!(harness.engines.mic_stops(), 1);
    assert!(harness.sink.contains("WebSocket connection closed"));

    // Disconnect after a remote close still lands in Idle without redoing work
    harness.manager.disconnect().await;
    assert_eq!(harness.manager.state(), SessionState::Idle);
    assert_eq!(harness.engines.output.close_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_reconnect_after_remote_close() -> Result<()> {
    let harness = open_session().await?;
    let first = harness.manager.stats().session_id;

    harness.transport.emit(ChannelEvent::Closed {
        code: None,
        reason: String::new(),
    });
    let manager = Arc::clone(&harness.manager);
    assert!(eventually(|| manager.state() == SessionState::Closed).await);

    harness.connect(None).await?;

    assert_eq!(harness.transport.opens(), 2);
    assert_eq!(harness.manager.state(), SessionState::Open);
    assert_ne!(harness.manager.stats().session_id, first);
    Ok(())
}

#[tokio::test]
async fn test_transport_error_marks_session_not_open() -> Result<()> {
    let harness = open_session().await?;

    harness
        .transport
        .emit(ChannelEvent::Error("connection reset".to_string()));

    let manager = Arc::clone(&harness.manager);
    assert!(eventually(|| manager.state() == SessionState::Failed).await);
    assert!(!harness.manager.is_open());
    assert!(harness.sink.contains("WebSocket Error"));

    // Outbound frames stop immediately
    harness.engines.push_frame(frame(0.1, 256)).await;
    assert!(eventually(|| harness.manager.stats().frames_dropped == 1).await);
    assert!(harness.transport.sender().sent().is_empty());

    harness.transport.emit(ChannelEvent::Closed {
        code: Some(1006),
        reason: "connection reset".to_string(),
    });
    assert!(eventually(|| manager.state() == SessionState::Closed).await);
    assert!(eventually(|| harness.engines.output.close_count() == 1).await);
    Ok(())
}

#[tokio::test]
async fn test_error_before_open_fails_connect() -> Result<()> {
    let harness = Harness::new(FakeTransport::new(false), FakeEngines::new());

    let manager = Arc::clone(&harness.manager);
    let pending = tokio::spawn(async move { manager.connect(|_| {}, None).await });
    assert!(eventually(|| harness.transport.opens() == 1).await);

    harness
        .transport
        .emit(ChannelEvent::Error("handshake rejected".to_string()));

    let result = within(pending).await?;
    assert!(matches!(result, Err(VoiceError::Transport(_))));
    assert_eq!(harness.manager.state(), SessionState::Failed);
    assert!(harness.transport.sender().is_closed());
    assert!(harness.sink.contains("Failed to connect"));
    Ok(())
}

#[tokio::test]
async fn test_microphone_denied_is_fatal() -> Result<()> {
    let harness = Harness::new(FakeTransport::new(true), FakeEngines::without_microphone());

    // connect itself resolves: the failure happens after the acknowledgement
    harness.connect(None).await?;

    let manager = Arc::clone(&harness.manager);
    assert!(eventually(|| manager.state() == SessionState::Failed).await);
    assert!(!harness.manager.is_open());
    assert!(harness.sink.contains("Microphone access denied"));
    assert!(eventually(|| harness.transport.sender().is_closed()).await);
    assert!(eventually(|| harness.engines.output.close_count() == 1).await);
    Ok(())
}

#[tokio::test]
async fn test_missing_speaker_fails_connect_before_channel() -> Result<()> {
    let harness = Harness::new(FakeTransport::new(true), FakeEngines::without_speaker());

    let result = harness.connect(None).await;

    assert!(matches!(result, Err(VoiceError::Device(_))));
    assert_eq!(harness.transport.opens(), 0);
    assert_eq!(harness.manager.state(), SessionState::Failed);
    assert!(harness.sink.contains("Failed to connect"));
    Ok(())
}

#[tokio::test]
async fn test_missing_credential_fails_connect() -> Result<()> {
    let transport = FakeTransport::new(true);
    transport.fail_with(VoiceError::Configuration("GEMINI_API_KEY is not set".to_string()));
    let harness = Harness::new(transport, FakeEngines::new());

    let result = harness.connect(None).await;

    assert!(matches!(result, Err(VoiceError::Configuration(_))));
    assert_eq!(harness.manager.state(), SessionState::Failed);
    assert_eq!(harness.engines.output.close_count(), 1);

    // A failed session can be retried
    assert!(harness.manager.state().can_transition_to(SessionState::Connecting));
    Ok(())
}

#[tokio::test]
async fn test_connect_times_out_without_acknowledgement() -> Result<()> {
    let config = SessionConfig {
        connect_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let harness = Harness::with_config(FakeTransport::new(false), FakeEngines::new(), config);

    let result = harness.connect(None).await;

    assert!(matches!(result, Err(VoiceError::ConnectTimeout(_))));
    assert_eq!(harness.manager.state(), SessionState::Failed);
    assert!(harness.transport.sender().is_closed());
    Ok(())
}

#[tokio::test]
async fn test_extra_context_reaches_setup() -> Result<()> {
    let harness = Harness::new(FakeTransport::new(true), FakeEngines::new());

    harness.connect(Some("The office closes at 5pm.")).await?;

    let setup = harness.transport.last_setup().expect("setup sent");
    assert!(setup.instructions().contains("The office closes at 5pm."));
    assert!(setup.model.starts_with("models/"));
    assert!(harness.sink.contains("Extra context added to instructions"));
    Ok(())
}

#[tokio::test]
async fn test_audio_is_scheduled_back_to_back() -> Result<()> {
    let harness = open_session().await?;

    harness.transport.emit_content(content_with_audio(3, 500));

    let output = Arc::clone(&harness.engines.output);
    assert!(eventually(|| output.scheduled().len() == 3).await);

    let mut starts: Vec<Duration> = output.scheduled().iter().map(|u| u.1).collect();
    starts.sort();
    assert_eq!(
        starts,
        vec![
            Duration::ZERO,
            Duration::from_millis(500),
            Duration::from_millis(1000)
        ]
    );

    output.advance_to(Duration::from_millis(1500));
    let stats = harness.manager.stats();
    assert_eq!(stats.chunks_enqueued, 3);
    assert_eq!(stats.chunks_completed, 3);
    assert_eq!(stats.active_units, 0);
    Ok(())
}

#[tokio::test]
async fn test_interruption_flushes_playback() -> Result<()> {
    let harness = open_session().await?;
    let output = Arc::clone(&harness.engines.output);

    harness.transport.emit_content(content_with_audio(2, 500));
    assert!(eventually(|| output.scheduled().len() == 2).await);

    output.advance_to(Duration::from_millis(300));
    harness.transport.emit_content(ServerContent {
        interrupted: true,
        ..Default::default()
    });

    assert!(eventually(|| output.stopped().len() == 2).await);
    assert!(eventually(|| harness.sink.contains("Audio interrupted by user")).await);
    assert_eq!(harness.manager.stats().interruptions, 1);

    // The next turn starts at the current clock, not after the discarded audio
    harness.transport.emit_content(ServerContent {
        audio: vec![silence(200, 24000)],
        ..Default::default()
    });
    assert!(eventually(|| output.scheduled().len() == 3).await);
    assert_eq!(output.scheduled()[2].1, Duration::from_millis(300));
    Ok(())
}

#[tokio::test]
async fn test_both_transcriptions_finalized_in_one_message() -> Result<()> {
    let harness = open_session().await?;

    harness.transport.emit_content(ServerContent {
        input_transcription: Some("what's the weather".to_string()),
        ..Default::default()
    });
    harness.transport.emit_content(ServerContent {
        input_transcription: Some("?".to_string()),
        output_transcription: Some("Sunny.".to_string()),
        turn_complete: true,
        ..Default::default()
    });

    assert!(eventually(|| harness.transcripts().len() == 3).await);
    let events = harness.transcripts();

    assert_eq!(events[0].role, Role::User);
    assert!(!events[0].is_final);
    assert_eq!(events[1].role, Role::User);
    assert_eq!(events[1].text, "?");
    assert!(events[1].is_final);
    assert_eq!(events[2].role, Role::Model);
    assert_eq!(events[2].text, "Sunny.");
    assert!(events[2].is_final);

    assert_eq!(harness.manager.stats().transcript_events, 3);
    Ok(())
}

#[tokio::test]
async fn test_soft_protocol_errors_keep_session_open() -> Result<()> {
    let harness = open_session().await?;

    harness
        .transport
        .emit(ChannelEvent::Protocol("undecodable server frame".to_string()));
    harness
        .transport
        .emit(ChannelEvent::Message(ServerMessage::GoAway {
            time_left: Some("10s".to_string()),
        }));
    harness.transport.emit_content(ServerContent {
        output_transcription: Some("still here".to_string()),
        ..Default::default()
    });

    assert!(eventually(|| harness.transcripts().len() == 1).await);
    assert_eq!(harness.manager.state(), SessionState::Open);
    assert!(harness.sink.contains("Undecodable message skipped"));
    assert!(harness.sink.contains("Server is closing the connection soon"));
    Ok(())
}

#[tokio::test]
async fn test_state_changes_are_observable() -> Result<()> {
    let harness = Harness::new(FakeTransport::new(true), FakeEngines::new());
    let mut states = harness.manager.subscribe();

    harness.connect(None).await?;
    assert!(eventually(|| *states.borrow_and_update() == SessionState::Open).await);

    harness.manager.disconnect().await;
    assert_eq!(*states.borrow_and_update(), SessionState::Idle);
    Ok(())
}

#[tokio::test]
async fn test_output_open_does_not_stall_the_runtime() -> Result<()> {
    let engines = FakeEngines::new();
    let release = engines.gate_output();
    let harness = Harness::new(FakeTransport::new(true), engines);

    // The device only starts once this task gets to run on the same
    // single-threaded runtime that is executing connect
    let starter = tokio::spawn(async move {
        let _ = release.send(());
    });

    harness.connect(None).await?;
    starter.await?;

    assert_eq!(harness.manager.state(), SessionState::Open);
    assert_eq!(harness.engines.outputs_opened.load(Ordering::SeqCst), 1);
    Ok(())
}
