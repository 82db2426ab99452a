//! Live voice session management
//!
//! This module provides the `SessionManager` abstraction that manages:
//! - The connection lifecycle and its state machine
//! - Starting microphone capture once the agent acknowledged the session
//! - Routing inbound audio and transcription through the `EventDemuxer`
//! - Idempotent teardown on disconnect, remote close or failure
//! - Session statistics

mod config;
mod demux;
mod manager;
mod session;
mod state;
mod stats;

pub use config::{SessionConfig, DEFAULT_INSTRUCTIONS, DEFAULT_MODEL, DEFAULT_VOICE};
pub use demux::{DemuxOutcome, EventDemuxer, Role, TranscriptCallback, TranscriptionEvent};
pub use manager::SessionManager;
pub use state::SessionState;
pub use stats::{SessionCounters, SessionStats, TranscriptSegment};
