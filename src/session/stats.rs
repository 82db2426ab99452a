use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::demux::Role;
use super::state::SessionState;

/// Statistics about the current (or most recent) session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub state: SessionState,

    /// Fresh for every connect; `None` before the first one
    pub session_id: Option<Uuid>,

    pub started_at: Option<DateTime<Utc>>,

    /// Seconds since `started_at`, frozen once the session is torn down
    pub duration_secs: f64,

    /// Microphone frames handed to the channel
    pub frames_sent: u64,

    /// Microphone frames dropped (session not open or channel refused them)
    pub frames_dropped: u64,

    pub chunks_enqueued: u64,
    pub chunks_completed: u64,
    pub chunks_discarded: u64,

    /// Units scheduled on the output and still playing
    pub active_units: usize,

    pub interruptions: u64,

    /// Transcription deltas delivered to the callback
    pub transcript_events: u64,
}

impl SessionStats {
    pub fn idle(state: SessionState) -> Self {
        Self {
            state,
            session_id: None,
            started_at: None,
            duration_secs: 0.0,
            frames_sent: 0,
            frames_dropped: 0,
            chunks_enqueued: 0,
            chunks_completed: 0,
            chunks_discarded: 0,
            active_units: 0,
            interruptions: 0,
            transcript_events: 0,
        }
    }
}

/// Counters updated from the event task
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub interruptions: AtomicU64,
    pub transcript_events: AtomicU64,
    pub protocol_errors: AtomicU64,
}

impl SessionCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// A finalized conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub role: Role,

    /// Concatenated deltas of the turn
    pub text: String,

    /// When the turn was finalized
    pub timestamp: DateTime<Utc>,
}
