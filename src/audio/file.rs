use hound::{SampleFormat, WavReader};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame};
use super::convert;
use crate::error::{VoiceError, VoiceResult};

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Normalized, interleaved
    pub samples: Vec<f32>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> VoiceResult<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path)
            .map_err(|e| VoiceError::Device(format!("failed to open {}: {}", path.display(), e)))?;

        let spec = reader.spec();
        let samples = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Int, 16) => {
                let pcm = reader
                    .into_samples::<i16>()
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| VoiceError::Device(format!("failed to read samples: {}", e)))?;
                convert::i16_to_f32(&pcm)
            }
            (SampleFormat::Float, 32) => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| VoiceError::Device(format!("failed to read samples: {}", e)))?,
            (format, bits) => {
                return Err(VoiceError::Device(format!(
                    "unsupported WAV format: {:?} {}-bit",
                    format, bits
                )))
            }
        };

        let duration_seconds =
            samples.len() as f64 / (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Split into fixed-size frames of `frame_size` samples per channel; the
    /// tail is zero-padded
    pub fn frames(&self, frame_size: usize) -> Vec<AudioFrame> {
        let channels = self.channels.max(1) as usize;
        let block = frame_size.max(1) * channels;

        self.samples
            .chunks(block)
            .enumerate()
            .map(|(i, chunk)| {
                let mut samples = chunk.to_vec();
                samples.resize(block, 0.0);
                AudioFrame {
                    samples,
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                    timestamp_ms: (i * frame_size) as u64 * 1000 / self.sample_rate as u64,
                }
            })
            .collect()
    }
}

/// Replays a WAV file as if it were a capture device
pub struct FileBackend {
    path: String,
    config: AudioBackendConfig,
    paced: bool,
    task: Option<JoinHandle<()>>,
}

impl FileBackend {
    pub fn new(path: impl Into<String>, config: AudioBackendConfig, paced: bool) -> Self {
        Self {
            path: path.into(),
            config,
            paced,
            task: None,
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for FileBackend {
    async fn start(&mut self) -> VoiceResult<mpsc::Receiver<AudioFrame>> {
        if self.task.is_some() {
            return Err(VoiceError::Device("already capturing".to_string()));
        }

        let file = AudioFile::open(&self.path)?;
        let frames = file.frames(self.config.frame_size);
        let frame_period =
            Duration::from_secs_f64(self.config.frame_size as f64 / file.sample_rate.max(1) as f64);
        let paced = self.paced;

        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_period);
            for frame in frames {
                if paced {
                    ticker.tick().await;
                    // Real-time source: a full queue drops the frame
                    if tx.try_send(frame).is_err() {
                        debug!("File frame dropped, consumer behind");
                    }
                } else if tx.send(frame).await.is_err() {
                    break;
                }
            }
            debug!("File replay finished");
        }));

        Ok(rx)
    }

    async fn stop(&mut self) -> VoiceResult<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("File capture stopped");
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn name(&self) -> &str {
        "WAV file"
    }
}
