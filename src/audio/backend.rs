use tokio::sync::mpsc;

use crate::error::{VoiceError, VoiceResult};

/// Block of captured samples at the device's native rate
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Normalized samples (-1.0..=1.0), interleaved
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

/// Processing the capture device is asked for. Hosts apply these on their
/// side where supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Configuration for audio backend
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Samples per channel in each emitted frame
    pub frame_size: usize,
    /// Frames buffered between the device callback and the consumer; when
    /// full, new frames are dropped
    pub queue_depth: usize,
    pub constraints: CaptureConstraints,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            frame_size: 4096,
            queue_depth: 8,
            constraints: CaptureConstraints::default(),
        }
    }
}

/// Audio capture backend trait
///
/// Implementations:
/// - Microphone: cpal default input device
/// - File: WAV replay (headless runs and tests)
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames. Device
    /// acquisition failures (no device, permission denied) are reported here.
    async fn start(&mut self) -> VoiceResult<mpsc::Receiver<AudioFrame>>;

    /// Stop capturing audio and release the device. Safe to call repeatedly.
    async fn stop(&mut self) -> VoiceResult<()>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    pub fn create(
        source: AudioSource,
        config: AudioBackendConfig,
    ) -> VoiceResult<Box<dyn AudioBackend>> {
        match source {
            AudioSource::Microphone => {
                Ok(Box::new(super::microphone::MicrophoneBackend::new(config)))
            }
            AudioSource::File { path, paced } => {
                if !std::path::Path::new(&path).exists() {
                    return Err(VoiceError::Device(format!("input file not found: {}", path)));
                }
                Ok(Box::new(super::file::FileBackend::new(path, config, paced)))
            }
        }
    }
}

/// Audio source type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// Default input device
    Microphone,
    /// WAV file; `paced` replays it in real time
    File { path: String, paced: bool },
}
