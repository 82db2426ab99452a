//! Routing of inbound content to playback and the transcription callback
//!
//! Per message the order is fixed: audio first, then the user delta, then
//! the model delta, then interruption. Both deltas carry the message's
//! turn-complete flag, so a message that finalizes both sides does so in one
//! pass.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::stats::SessionCounters;
use crate::playback::PlaybackScheduler;
use crate::protocol::ServerContent;
use crate::telemetry::{LogEntry, LogSink, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One transcription delta handed to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionEvent {
    pub role: Role,
    pub text: String,
    pub is_final: bool,
}

pub type TranscriptCallback = Arc<dyn Fn(TranscriptionEvent) + Send + Sync>;

/// What one dispatch did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxOutcome {
    pub audio_enqueued: usize,
    pub transcripts: usize,
    /// Units stopped by an interruption, if the message carried one
    pub flushed: Option<usize>,
}

pub struct EventDemuxer {
    playback: Arc<PlaybackScheduler>,
    on_transcript: TranscriptCallback,
    counters: Arc<SessionCounters>,
    sink: Arc<dyn LogSink>,
}

impl EventDemuxer {
    pub fn new(
        playback: Arc<PlaybackScheduler>,
        on_transcript: TranscriptCallback,
        counters: Arc<SessionCounters>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            playback,
            on_transcript,
            counters,
            sink,
        }
    }

    /// Must be called from within a Tokio runtime (audio decodes are spawned).
    pub fn dispatch(&self, content: ServerContent) -> DemuxOutcome {
        let mut outcome = DemuxOutcome::default();
        let ServerContent {
            audio,
            input_transcription,
            output_transcription,
            turn_complete,
            interrupted,
            skipped_parts,
        } = content;

        if skipped_parts > 0 {
            SessionCounters::bump(&self.counters.protocol_errors);
            warn!("Skipped {} unsupported content parts", skipped_parts);
        }

        for payload in audio {
            match self.playback.enqueue(payload) {
                Ok(reservation) => {
                    debug!(
                        "Audio unit {} reserved at {:.3}s",
                        reservation.id,
                        reservation.start.as_secs_f64()
                    );
                    outcome.audio_enqueued += 1;
                }
                Err(e) => {
                    SessionCounters::bump(&self.counters.protocol_errors);
                    self.sink.emit(
                        LogEntry::error(Stage::Tts, "Audio chunk rejected")
                            .with_data(e.to_string()),
                    );
                }
            }
        }

        if let Some(text) = input_transcription {
            self.sink.emit(
                LogEntry::info(Stage::Asr, "User transcription").with_data(text.clone()),
            );
            self.deliver(Role::User, text, turn_complete);
            outcome.transcripts += 1;
        }

        if let Some(text) = output_transcription {
            self.sink.emit(
                LogEntry::info(Stage::Llm, "Model transcription").with_data(text.clone()),
            );
            self.deliver(Role::Model, text, turn_complete);
            outcome.transcripts += 1;
        }

        if interrupted {
            let stopped = self.playback.flush();
            SessionCounters::bump(&self.counters.interruptions);
            self.sink.emit(
                LogEntry::info(Stage::System, "Audio interrupted by user")
                    .with_data(serde_json::json!({ "stopped_units": stopped })),
            );
            outcome.flushed = Some(stopped);
        }

        outcome
    }

    fn deliver(&self, role: Role, text: String, is_final: bool) {
        SessionCounters::bump(&self.counters.transcript_events);
        (self.on_transcript)(TranscriptionEvent {
            role,
            text,
            is_final,
        });
    }
}
