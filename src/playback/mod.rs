//! Gapless scheduling of synthesized audio
//!
//! Every inbound payload reserves its slot on the playback clock the moment
//! it arrives: `start = max(cursor, now)` and the cursor advances by the
//! payload's duration, which is known once its base64 text is decoded.
//! Conversion to samples runs afterwards on the blocking pool and the chunk
//! is handed to the output engine at the start it already owns. Arrival
//! order therefore maps to back-to-back, non-overlapping starts no matter
//! how long each conversion takes. Payloads that fail to decode are rejected
//! before they reserve anything.
//!
//! All scheduler state (cursor, active set, flush generation) sits behind
//! one mutex. Lock order is scheduler state, then output engine; output
//! engines fire completions only after releasing their own locks.

pub mod decode;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::AudioPayload;
use crate::telemetry::{LogEntry, LogSink, Stage};

pub type UnitId = u64;

/// Decoded audio with its place on the playback clock
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Normalized samples (-1.0..=1.0), interleaved when `channels > 1`
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Scheduled start offset on the playback clock
    pub start: Duration,
}

impl AudioChunk {
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / self.channels.max(1) as usize;
        decode::samples_duration(frames, self.sample_rate)
    }
}

/// One-shot natural-completion notice for a unit
pub struct Completion(Option<Box<dyn FnOnce() + Send>>);

impl Completion {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    /// Report that the unit played to its end
    pub fn fire(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Completion")
    }
}

/// A chunk handed to the output engine
#[derive(Debug)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub chunk: AudioChunk,
    pub completion: Completion,
}

/// The audio engine playback is scheduled on
pub trait PlaybackOutput: Send + Sync {
    /// Current time on the playback clock
    fn now(&self) -> Duration;

    /// Play `unit` starting at `unit.chunk.start`. The unit's completion
    /// must fire after it finished playing, never from inside this call.
    fn schedule(&self, unit: PlaybackUnit) -> VoiceResult<()>;

    /// Silence the given units immediately; their completions never fire
    fn stop(&self, ids: &[UnitId]);

    /// Release the engine. Safe to call more than once.
    fn close(&self);
}

/// Slot handed out by [`PlaybackScheduler::enqueue`]
#[derive(Debug)]
pub struct Reservation {
    pub id: UnitId,
    pub start: Duration,
    pub duration: Duration,
    /// Resolves once the payload was decoded and scheduled (or discarded)
    pub decoded: JoinHandle<()>,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackSnapshot {
    pub cursor: Duration,
    pub active: usize,
    pub enqueued: u64,
    pub completed: u64,
    /// Decodes that resolved after a flush or close, or failed
    pub discarded: u64,
}

#[derive(Default)]
struct SchedulerState {
    cursor: Duration,
    /// Units handed to the output and not yet finished, with their starts
    active: HashMap<UnitId, Duration>,
    next_id: UnitId,
    /// Bumped by every flush; decodes reserved under an older generation are
    /// discarded
    generation: u64,
    closed: bool,
    enqueued: u64,
    completed: u64,
    discarded: u64,
}

pub struct PlaybackScheduler {
    output: Arc<dyn PlaybackOutput>,
    state: Arc<Mutex<SchedulerState>>,
    sink: Arc<dyn LogSink>,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn PlaybackOutput>, sink: Arc<dyn LogSink>) -> Arc<Self> {
        Arc::new(Self {
            output,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            sink,
        })
    }

    /// Validate `payload`, reserve its slot now and convert it to samples in
    /// the background. A payload that is not valid base64 reserves nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enqueue(self: &Arc<Self>, payload: AudioPayload) -> VoiceResult<Reservation> {
        let arrived = Instant::now();
        let sample_rate = payload.sample_rate;
        let bytes = decode::decode_base64(&payload.data)?;
        let duration = decode::pcm_duration(bytes.len(), sample_rate)?;

        let (id, start, generation) = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(VoiceError::closed(None, "playback is closed"));
            }
            let start = state.cursor.max(self.output.now());
            state.cursor = start + duration;
            let id = state.next_id;
            state.next_id += 1;
            state.enqueued += 1;
            (id, start, state.generation)
        };

        debug!(
            "Reserved unit {} at {:.3}s for {:.3}s",
            id,
            start.as_secs_f64(),
            duration.as_secs_f64()
        );

        let scheduler = Arc::clone(self);
        let decoded = tokio::spawn(async move {
            scheduler
                .resolve(id, start, generation, bytes, sample_rate, arrived)
                .await;
        });

        Ok(Reservation {
            id,
            start,
            duration,
            decoded,
        })
    }

    async fn resolve(
        self: Arc<Self>,
        id: UnitId,
        start: Duration,
        generation: u64,
        bytes: Vec<u8>,
        sample_rate: u32,
        arrived: Instant,
    ) {
        let decoded = tokio::task::spawn_blocking(move || decode::pcm_to_samples(&bytes)).await;

        let samples = match decoded {
            Ok(samples) => samples,
            Err(e) => {
                lock(&self.state).discarded += 1;
                self.sink.emit(
                    LogEntry::error(Stage::Tts, "Audio chunk could not be decoded")
                        .with_data(e.to_string()),
                );
                return;
            }
        };

        let scheduled = {
            let mut state = lock(&self.state);
            if state.closed || state.generation != generation {
                state.discarded += 1;
                debug!("Discarding unit {} decoded after flush", id);
                return;
            }

            state.active.insert(id, start);
            let unit = PlaybackUnit {
                id,
                chunk: AudioChunk {
                    samples,
                    sample_rate,
                    channels: 1,
                    start,
                },
                completion: self.completion_for(id),
            };
            let scheduled = self.output.schedule(unit);
            if scheduled.is_err() {
                state.active.remove(&id);
                state.discarded += 1;
            }
            scheduled
        };

        match scheduled {
            Ok(()) => self.sink.emit(
                LogEntry::success(Stage::Tts, "Audio chunk received")
                    .with_duration(arrived.elapsed()),
            ),
            Err(e) => {
                warn!("Output refused unit {}: {}", id, e);
                self.sink.emit(
                    LogEntry::error(Stage::Tts, "Audio chunk could not be scheduled")
                        .with_data(e.to_string()),
                );
            }
        }
    }

    fn completion_for(&self, id: UnitId) -> Completion {
        let state: Weak<Mutex<SchedulerState>> = Arc::downgrade(&self.state);
        Completion::new(move || {
            if let Some(state) = state.upgrade() {
                let mut state = lock(&state);
                if state.active.remove(&id).is_some() {
                    state.completed += 1;
                }
            }
        })
    }

    /// Stop everything that is playing or pending and snap the cursor back
    /// to the current clock time. Returns the number of units stopped.
    pub fn flush(&self) -> usize {
        let mut state = lock(&self.state);
        state.generation += 1;
        let ids: Vec<UnitId> = state.active.drain().map(|(id, _)| id).collect();
        state.cursor = self.output.now();
        if !ids.is_empty() {
            self.output.stop(&ids);
        }
        debug!("Flushed {} playback units", ids.len());
        ids.len()
    }

    /// Flush, refuse further payloads and release the output engine
    pub fn close(&self) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.flush();
        self.output.close();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let state = lock(&self.state);
        PlaybackSnapshot {
            cursor: state.cursor,
            active: state.active.len(),
            enqueued: state.enqueued,
            completed: state.completed,
            discarded: state.discarded,
        }
    }
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
