//! Outbound microphone pipeline
//!
//! Frames from an [`AudioBackend`] are converted to mono 16-bit PCM at the
//! transmit rate and handed to the channel one by one. A frame is sent only
//! while the session's open flag is set, and a frame the channel refuses is
//! dropped: nothing is queued across the send boundary, so a stall never
//! turns into late audio.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{convert, AudioBackend, AudioFrame};
use crate::error::VoiceResult;
use crate::lifecycle::Resource;
use crate::protocol::ClientMessage;
use crate::telemetry::{LogEntry, LogSink, Stage};
use crate::transport::ChannelSender;

#[derive(Debug, Default)]
struct CaptureCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CaptureSnapshot {
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

pub struct CapturePipeline {
    transmit_rate: u32,
    backend: Resource<Box<dyn AudioBackend>>,
    task: Resource<JoinHandle<()>>,
    counters: Arc<CaptureCounters>,
    stopped: AtomicBool,
    sink: Arc<dyn LogSink>,
}

impl CapturePipeline {
    pub fn new(transmit_rate: u32, sink: Arc<dyn LogSink>) -> Self {
        Self {
            transmit_rate,
            backend: Resource::new("microphone"),
            task: Resource::new("capture task"),
            counters: Arc::new(CaptureCounters::default()),
            stopped: AtomicBool::new(false),
            sink,
        }
    }

    /// Acquire the device behind `backend` and start forwarding frames to
    /// `sender`. Frames are sent only while `open` is set. Device failures
    /// are returned to the caller. Starting twice, or after `stop`, is a
    /// no-op; a device that finishes opening after `stop` is released again.
    pub async fn start(
        &self,
        mut backend: Box<dyn AudioBackend>,
        sender: Arc<dyn ChannelSender>,
        open: Arc<AtomicBool>,
    ) -> VoiceResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            debug!("Capture already stopped");
            return Ok(());
        }
        if self.backend.is_held() {
            debug!("Capture already running");
            return Ok(());
        }

        let frames = match backend.start().await {
            Ok(frames) => frames,
            Err(e) => {
                self.sink.emit(
                    LogEntry::error(Stage::Asr, "Microphone access denied")
                        .with_data(e.to_string()),
                );
                return Err(e);
            }
        };

        let name = backend.name().to_string();
        self.backend.acquire(backend);
        self.task.acquire(tokio::spawn(forward_frames(
            frames,
            sender,
            open,
            self.transmit_rate,
            Arc::clone(&self.counters),
        )));

        if self.stopped.load(Ordering::SeqCst) {
            debug!("Capture stopped while {} was opening", name);
            self.stop().await;
            return Ok(());
        }

        self.sink
            .emit(LogEntry::success(Stage::Asr, "Microphone stream started").with_data(name));
        Ok(())
    }

    /// Detach the frame processor and release the device. Safe to call any
    /// number of times.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.release() {
            task.abort();
        }
        if let Some(mut backend) = self.backend.release() {
            if let Err(e) = backend.stop().await {
                warn!("Failed to stop {}: {}", backend.name(), e);
            }
            info!("Capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.backend.is_held()
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            frames_sent: self.counters.sent.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn forward_frames(
    mut frames: mpsc::Receiver<AudioFrame>,
    sender: Arc<dyn ChannelSender>,
    open: Arc<AtomicBool>,
    transmit_rate: u32,
    counters: Arc<CaptureCounters>,
) {
    debug!("Capture forwarding started");
    let mut resampler = convert::Resampler::new(transmit_rate);

    while let Some(frame) = frames.recv().await {
        if !open.load(Ordering::SeqCst) {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let pcm = convert::to_transmit(&frame, &mut resampler);
        match sender.send(ClientMessage::audio(&pcm, transmit_rate)) {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Capture frame dropped at {}ms: {}", frame.timestamp_ms, e);
            }
        }
    }

    debug!("Capture source ended");
}
