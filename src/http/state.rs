use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::session::{Role, SessionManager, TranscriptSegment, TranscriptionEvent};

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The one session this service controls
    pub manager: Arc<SessionManager>,

    /// Finalized turns of the current session. Written from the transcript
    /// callback, which is synchronous, hence a std mutex.
    pub transcript: Arc<Mutex<TranscriptLog>>,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            transcript: Arc::new(Mutex::new(TranscriptLog::default())),
        }
    }

    pub fn transcript(&self) -> MutexGuard<'_, TranscriptLog> {
        self.transcript
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Builds turns out of transcription deltas
#[derive(Debug, Default)]
pub struct TranscriptLog {
    user: String,
    model: String,
    turns: Vec<TranscriptSegment>,
}

impl TranscriptLog {
    /// Append a delta. A final delta closes the pending turn of both roles,
    /// user first.
    pub fn record(&mut self, event: TranscriptionEvent) {
        match event.role {
            Role::User => self.user.push_str(&event.text),
            Role::Model => self.model.push_str(&event.text),
        }
        if event.is_final {
            self.finalize(Role::User);
            self.finalize(Role::Model);
        }
    }

    fn finalize(&mut self, role: Role) {
        let pending = match role {
            Role::User => &mut self.user,
            Role::Model => &mut self.model,
        };
        let text = std::mem::take(pending);
        let text = text.trim();
        if !text.is_empty() {
            self.turns.push(TranscriptSegment {
                role,
                text: text.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    pub fn turns(&self) -> Vec<TranscriptSegment> {
        self.turns.clone()
    }

    pub fn clear(&mut self) {
        self.user.clear();
        self.model.clear();
        self.turns.clear();
    }
}
