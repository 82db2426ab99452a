// Microphone capture through cpal
//
// cpal streams are not Send on every platform, so the stream lives on its
// own thread for its whole life. The thread reports whether the device could
// be opened, then parks until stop() (or drop) signals it to release the
// device.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame};
use super::convert;
use crate::error::{VoiceError, VoiceResult};

pub struct MicrophoneBackend {
    config: AudioBackendConfig,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicrophoneBackend {
    pub fn new(config: AudioBackendConfig) -> Self {
        Self {
            config,
            shutdown: None,
            thread: None,
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for MicrophoneBackend {
    async fn start(&mut self) -> VoiceResult<mpsc::Receiver<AudioFrame>> {
        if self.shutdown.is_some() {
            return Err(VoiceError::Device("already capturing".to_string()));
        }

        let constraints = self.config.constraints;
        info!(
            "Opening microphone (echo_cancellation={}, noise_suppression={}, auto_gain={})",
            constraints.echo_cancellation,
            constraints.noise_suppression,
            constraints.auto_gain_control
        );

        let (frame_tx, frame_rx) = mpsc::channel(self.config.queue_depth.max(1));
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<String>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let frame_size = self.config.frame_size.max(1);

        let handle = thread::Builder::new()
            .name("loqa-microphone".to_string())
            .spawn(move || {
                let stream = match open_input_stream(frame_size, frame_tx) {
                    Ok((stream, description)) => {
                        let _ = ready_tx.send(Ok(description));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Returns on stop() or when the sender is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Microphone stream released");
            })
            .map_err(|e| VoiceError::Device(format!("failed to spawn capture thread: {}", e)))?;

        let description = ready_rx
            .await
            .map_err(|_| VoiceError::Device("capture thread exited".to_string()))??;

        info!("Microphone capture started: {}", description);

        self.shutdown = Some(shutdown_tx);
        self.thread = Some(handle);

        Ok(frame_rx)
    }

    async fn stop(&mut self) -> VoiceResult<()> {
        let Some(shutdown) = self.shutdown.take() else {
            return Ok(());
        };
        let _ = shutdown.send(());

        if let Some(handle) = self.thread.take() {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| VoiceError::Device(format!("capture thread join failed: {}", e)))?
                .map_err(|_| VoiceError::Device("capture thread panicked".to_string()))?;
        }

        info!("Microphone capture stopped");
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.shutdown.is_some()
    }

    fn name(&self) -> &str {
        "cpal microphone"
    }
}

impl Drop for MicrophoneBackend {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn open_input_stream(
    frame_size: usize,
    frames: mpsc::Sender<AudioFrame>,
) -> VoiceResult<(cpal::Stream, String)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::Device("No input device available".to_string()))?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported = device.default_input_config()?;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.into();
    let sample_rate = stream_config.sample_rate.0;
    let channels = stream_config.channels;

    let mut framer = Framer::new(frame_size, sample_rate, channels, frames);
    let on_error = |err: cpal::StreamError| warn!("Microphone stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| framer.push(data),
            on_error,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                framer.push(&convert::i16_to_f32(data))
            },
            on_error,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                framer.push(&convert::u16_to_f32(data))
            },
            on_error,
            None,
        )?,
        other => {
            return Err(VoiceError::Device(format!(
                "unsupported input sample format {:?}",
                other
            )))
        }
    };

    stream.play()?;

    Ok((
        stream,
        format!("{} ({}Hz, {} channels)", name, sample_rate, channels),
    ))
}

/// Cuts the device callback's variable-size buffers into fixed-size frames
struct Framer {
    block: usize,
    frame_size: usize,
    sample_rate: u32,
    channels: u16,
    buffer: Vec<f32>,
    emitted: u64,
    out: mpsc::Sender<AudioFrame>,
}

impl Framer {
    fn new(
        frame_size: usize,
        sample_rate: u32,
        channels: u16,
        out: mpsc::Sender<AudioFrame>,
    ) -> Self {
        let block = frame_size * channels.max(1) as usize;
        Self {
            block,
            frame_size,
            sample_rate,
            channels,
            buffer: Vec::with_capacity(block),
            emitted: 0,
            out,
        }
    }

    fn push(&mut self, data: &[f32]) {
        for &sample in data {
            self.buffer.push(sample);
            if self.buffer.len() >= self.block {
                let samples = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.block));
                let frame = AudioFrame {
                    samples,
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                    timestamp_ms: self.emitted * self.frame_size as u64 * 1000
                        / self.sample_rate.max(1) as u64,
                };
                self.emitted += 1;
                // Never block the device callback; a full queue drops the frame
                if self.out.try_send(frame).is_err() {
                    debug!("Microphone frame dropped");
                }
            }
        }
    }
}
