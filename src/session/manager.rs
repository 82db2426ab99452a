//! Session connection lifecycle
//!
//! `SessionManager` owns at most one [`Session`]. `connect` claims the
//! Connecting state, opens the output engine and the channel, then waits for
//! the open acknowledgement on the session's event task. That task is the
//! only consumer of channel events: it starts capture once the channel is
//! open, routes content through the [`EventDemuxer`] and runs teardown on
//! remote close.
//!
//! Every connect and every disconnect bumps the manager epoch. Work that
//! belongs to an older epoch (an event task outliving its session, a connect
//! overtaken by disconnect) notices and backs off instead of touching state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::config::SessionConfig;
use super::demux::{EventDemuxer, TranscriptionEvent};
use super::session::Session;
use super::state::SessionState;
use super::stats::{SessionCounters, SessionStats};
use crate::audio::AudioEngines;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::PlaybackScheduler;
use crate::protocol::ServerMessage;
use crate::telemetry::{LogEntry, LogSink, Stage};
use crate::transport::{AgentTransport, ChannelEvent};

pub struct SessionManager {
    config: SessionConfig,
    transport: Arc<dyn AgentTransport>,
    engines: Arc<dyn AudioEngines>,
    sink: Arc<dyn LogSink>,
    shared: Arc<Shared>,
}

struct Shared {
    state: watch::Sender<SessionState>,
    epoch: AtomicU64,
    current: Mutex<Option<Arc<Session>>>,
}

impl Shared {
    /// Apply `next` if the state machine allows it from the current state
    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!("Session state {} -> {}", state, next);
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn AgentTransport>,
        engines: Arc<dyn AudioEngines>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            transport,
            engines,
            sink,
            shared: Arc::new(Shared {
                state,
                epoch: AtomicU64::new(0),
                current: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.shared
            .current()
            .as_ref()
            .map(|s| s.is_open())
            .unwrap_or(false)
    }

    /// Statistics of the current session, or of the last one until the next
    /// connect or disconnect
    pub fn stats(&self) -> SessionStats {
        let state = self.state();
        match self.shared.current().as_ref() {
            Some(session) => session.stats(state),
            None => SessionStats::idle(state),
        }
    }

    /// Open a session and resolve once the agent acknowledged it.
    ///
    /// A no-op while a session is connecting or open. Fails only for errors
    /// before the session is open: missing credential, output engine or
    /// channel failure, timeout, or a close/error ahead of the
    /// acknowledgement. Anything after that is reported through state and
    /// log entries.
    pub async fn connect<F>(
        &self,
        on_transcript: F,
        extra_context: Option<String>,
    ) -> VoiceResult<()>
    where
        F: Fn(TranscriptionEvent) + Send + Sync + 'static,
    {
        let claimed = self.shared.state.send_if_modified(|state| {
            if state.can_transition_to(SessionState::Connecting) {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            let state = self.state();
            if state.is_active() {
                debug!("connect ignored, session already {}", state);
                return Ok(());
            }
            return Err(VoiceError::closed(None, format!("session is {}", state)));
        }

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        // A session that ended remotely stays around for its stats until now
        let previous = self.shared.current().take();
        if let Some(previous) = previous {
            previous.teardown(true).await;
        }

        let session = Arc::new(Session::new(
            epoch,
            self.config.transmit_sample_rate,
            Arc::clone(&self.sink),
        ));
        *self.shared.current() = Some(Arc::clone(&session));

        info!("Connecting session {} ({})", session.id, self.config.model);
        self.sink.emit(
            LogEntry::info(Stage::System, "Connecting to agent").with_data(serde_json::json!({
                "session_id": session.id.to_string(),
                "model": self.config.model,
                "voice": self.config.voice,
            })),
        );

        match self
            .open_session(&session, Arc::new(on_transcript), extra_context)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                session.teardown(true).await;
                if self.shared.is_current(epoch) {
                    self.shared.transition(SessionState::Failed);
                }
                self.sink.emit(
                    LogEntry::error(Stage::System, "Failed to connect").with_data(e.to_string()),
                );
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        session: &Arc<Session>,
        on_transcript: Arc<dyn Fn(TranscriptionEvent) + Send + Sync>,
        extra_context: Option<String>,
    ) -> VoiceResult<()> {
        // Opening a device blocks until its stream runs
        let engines = Arc::clone(&self.engines);
        let output = tokio::task::spawn_blocking(move || engines.open_output())
            .await
            .map_err(|e| VoiceError::Device(format!("output engine task failed: {}", e)))??;
        let playback = PlaybackScheduler::new(output, Arc::clone(&self.sink));
        session.playback.acquire(Arc::clone(&playback));

        let context = extra_context
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        if let Some(context) = context {
            self.sink.emit(
                LogEntry::info(Stage::System, "Extra context added to instructions")
                    .with_data(serde_json::json!({ "chars": context.chars().count() })),
            );
        }
        let setup = self.config.setup(context);

        let channel = self.transport.open(setup).await?;
        if !self.shared.is_current(session.epoch) {
            let _ = channel.sender.close();
            return Err(VoiceError::closed(None, "disconnected before the session opened"));
        }
        session.channel.acquire(Arc::clone(&channel.sender));

        let (opened_tx, opened_rx) = oneshot::channel();
        let events = EventLoop {
            shared: Arc::clone(&self.shared),
            session: Arc::clone(session),
            engines: Arc::clone(&self.engines),
            demuxer: EventDemuxer::new(
                playback,
                on_transcript,
                Arc::clone(&session.counters),
                Arc::clone(&self.sink),
            ),
            sink: Arc::clone(&self.sink),
            opened: Some(opened_tx),
        };
        session.events.acquire(tokio::spawn(events.run(channel.events)));

        let opened = match self.config.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, opened_rx).await {
                Ok(opened) => opened,
                Err(_) => return Err(VoiceError::ConnectTimeout(limit)),
            },
            None => opened_rx.await,
        };

        opened.unwrap_or_else(|_| {
            Err(VoiceError::closed(None, "session ended before it opened"))
        })
    }

    /// Tear down whatever exists and return to Idle. Safe from any state and
    /// any number of times. Returns the final statistics of the session that
    /// was torn down.
    pub async fn disconnect(&self) -> SessionStats {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);

        let session = self.shared.current().take();
        if self.state() != SessionState::Idle {
            self.shared.transition(SessionState::Closing);
        }

        let stats = match &session {
            Some(session) => {
                session.teardown(true).await;
                session.stats(SessionState::Idle)
            }
            None => SessionStats::idle(SessionState::Idle),
        };

        self.shared.transition(SessionState::Idle);

        if session.is_some() {
            self.sink
                .emit(LogEntry::success(Stage::System, "All services stopped"));
        }
        stats
    }
}

/// Consumer of one session's channel events
struct EventLoop {
    shared: Arc<Shared>,
    session: Arc<Session>,
    engines: Arc<dyn AudioEngines>,
    demuxer: EventDemuxer,
    sink: Arc<dyn LogSink>,
    /// Resolves the pending `connect`
    opened: Option<oneshot::Sender<VoiceResult<()>>>,
}

enum Flow {
    Continue,
    Stop,
}

impl EventLoop {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        debug!("Event task started for session {}", self.session.id);

        loop {
            let Some(event) = events.recv().await else {
                if self.is_current() {
                    self.on_closed(None, "event stream ended".to_string()).await;
                }
                break;
            };

            if !self.is_current() {
                debug!("Session {} superseded, event task exiting", self.session.id);
                break;
            }

            let flow = match event {
                ChannelEvent::Opened => self.on_opened().await,
                ChannelEvent::Message(message) => self.on_message(message),
                ChannelEvent::Protocol(reason) => {
                    SessionCounters::bump(&self.session.counters.protocol_errors);
                    warn!("Skipping undecodable frame: {}", reason);
                    self.sink.emit(
                        LogEntry::error(Stage::Debug, "Undecodable message skipped")
                            .with_data(reason),
                    );
                    Flow::Continue
                }
                ChannelEvent::Error(reason) => self.on_error(reason),
                ChannelEvent::Closed { code, reason } => {
                    self.on_closed(code, reason).await;
                    Flow::Stop
                }
            };

            if let Flow::Stop = flow {
                break;
            }
        }

        debug!("Event task finished for session {}", self.session.id);
    }

    fn is_current(&self) -> bool {
        self.shared.is_current(self.session.epoch)
    }

    fn resolve_connect(&mut self, result: VoiceResult<()>) {
        if let Some(opened) = self.opened.take() {
            let _ = opened.send(result);
        }
    }

    async fn on_opened(&mut self) -> Flow {
        if !self.shared.transition(SessionState::Open) {
            warn!(
                "Open acknowledgement ignored in state {}",
                *self.shared.state.borrow()
            );
            return Flow::Continue;
        }

        self.session.open.store(true, Ordering::SeqCst);
        self.sink.emit(
            LogEntry::success(Stage::System, "WebSocket connection opened")
                .with_data(self.session.id.to_string()),
        );
        self.resolve_connect(Ok(()));

        match self.start_capture().await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                self.session.open.store(false, Ordering::SeqCst);
                self.shared.transition(SessionState::Failed);
                self.sink.emit(
                    LogEntry::error(Stage::System, "Capture failed, session closed")
                        .with_data(e.to_string()),
                );
                self.session.teardown(false).await;
                Flow::Stop
            }
        }
    }

    async fn start_capture(&self) -> VoiceResult<()> {
        let backend = match self.engines.open_input() {
            Ok(backend) => backend,
            Err(e) => {
                self.sink.emit(
                    LogEntry::error(Stage::Asr, "Microphone access denied")
                        .with_data(e.to_string()),
                );
                return Err(e);
            }
        };
        let sender = self
            .session
            .channel
            .get()
            .ok_or_else(|| VoiceError::closed(None, "channel released before capture started"))?;

        self.session
            .capture
            .start(backend, sender, Arc::clone(&self.session.open))
            .await
    }

    fn on_message(&mut self, message: ServerMessage) -> Flow {
        match message {
            ServerMessage::Content(content) => {
                self.demuxer.dispatch(content);
            }
            ServerMessage::GoAway { time_left } => {
                self.sink.emit(
                    LogEntry::info(Stage::System, "Server is closing the connection soon")
                        .with_data(time_left.unwrap_or_default()),
                );
            }
            ServerMessage::SetupComplete => debug!("Duplicate setup acknowledgement"),
            ServerMessage::Other(kind) => debug!("Ignoring server message: {}", kind),
        }
        Flow::Continue
    }

    fn on_error(&mut self, reason: String) -> Flow {
        self.session.open.store(false, Ordering::SeqCst);
        self.shared.transition(SessionState::Failed);
        self.sink
            .emit(LogEntry::error(Stage::System, "WebSocket Error").with_data(reason.clone()));
        self.resolve_connect(Err(VoiceError::Transport(reason)));
        Flow::Continue
    }

    async fn on_closed(&mut self, code: Option<u16>, reason: String) {
        self.session.open.store(false, Ordering::SeqCst);
        self.shared.transition(SessionState::Closing);
        self.session.teardown(false).await;
        self.shared.transition(SessionState::Closed);

        self.sink.emit(
            LogEntry::info(Stage::System, "WebSocket connection closed")
                .with_data(serde_json::json!({ "code": code, "reason": reason })),
        );
        self.resolve_connect(Err(VoiceError::closed(code, reason)));
    }
}
