use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::state::SessionState;
use super::stats::{SessionCounters, SessionStats};
use crate::capture::CapturePipeline;
use crate::lifecycle::Resource;
use crate::playback::{PlaybackScheduler, PlaybackSnapshot};
use crate::telemetry::LogSink;
use crate::transport::ChannelSender;

/// Everything one connect acquires. Created by `connect`, torn down by
/// remote close, failure or `disconnect`, never reused.
pub(crate) struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,

    /// Manager epoch this session belongs to
    pub epoch: u64,

    /// Set on open acknowledgement, cleared before anything is torn down.
    /// Capture sends are gated on it.
    pub open: Arc<AtomicBool>,

    pub channel: Resource<Arc<dyn ChannelSender>>,
    pub playback: Resource<Arc<PlaybackScheduler>>,
    pub capture: CapturePipeline,
    pub events: Resource<JoinHandle<()>>,
    pub counters: Arc<SessionCounters>,

    final_playback: Mutex<PlaybackSnapshot>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
}

impl Session {
    pub fn new(epoch: u64, transmit_rate: u32, sink: Arc<dyn LogSink>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            epoch,
            open: Arc::new(AtomicBool::new(false)),
            channel: Resource::new("agent channel"),
            playback: Resource::new("playback engine"),
            capture: CapturePipeline::new(transmit_rate, sink),
            events: Resource::new("event task"),
            counters: Arc::new(SessionCounters::default()),
            final_playback: Mutex::new(PlaybackSnapshot::default()),
            ended_at: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Release everything the session holds: flush playback, close the
    /// channel, detach the event task, stop capture, then close the output
    /// engine. Every step is a no-op when already done, so this can run from
    /// any teardown path.
    ///
    /// `abort_events` must be false when called from the event task itself.
    pub async fn teardown(&self, abort_events: bool) {
        self.open.store(false, Ordering::SeqCst);

        if let Some(playback) = self.playback.get() {
            playback.flush();
        }

        if let Some(sender) = self.channel.release() {
            if let Err(e) = sender.close() {
                debug!("Ignoring channel close error: {}", e);
            }
        }

        if let Some(task) = self.events.release() {
            if abort_events {
                task.abort();
            }
        }

        self.capture.stop().await;

        if let Some(playback) = self.playback.release() {
            playback.close();
            *lock(&self.final_playback) = playback.snapshot();
        }

        let mut ended_at = lock(&self.ended_at);
        if ended_at.is_none() {
            *ended_at = Some(Utc::now());
            info!("Session {} torn down", self.id);
        }
    }

    pub fn stats(&self, state: SessionState) -> SessionStats {
        let playback = self
            .playback
            .with(|p| p.snapshot())
            .unwrap_or_else(|| *lock(&self.final_playback));
        let capture = self.capture.snapshot();
        let end = lock(&self.ended_at).unwrap_or_else(Utc::now);
        let duration = end.signed_duration_since(self.started_at);

        SessionStats {
            state,
            session_id: Some(self.id),
            started_at: Some(self.started_at),
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            frames_sent: capture.frames_sent,
            frames_dropped: capture.frames_dropped,
            chunks_enqueued: playback.enqueued,
            chunks_completed: playback.completed,
            chunks_discarded: playback.discarded,
            active_units: playback.active,
            interruptions: SessionCounters::read(&self.counters.interruptions),
            transcript_events: SessionCounters::read(&self.counters.transcript_events),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
