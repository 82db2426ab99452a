use std::sync::Arc;

use super::backend::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioSource, CaptureConstraints,
};
use super::speaker::SpeakerOutput;
use crate::config::AudioConfig;
use crate::error::VoiceResult;
use crate::playback::PlaybackOutput;

/// Creates the per-session audio engines
pub trait AudioEngines: Send + Sync {
    /// Output engine playback is scheduled on; opened at connect. May block
    /// while the device starts, so callers run it on the blocking pool.
    fn open_output(&self) -> VoiceResult<Arc<dyn PlaybackOutput>>;

    /// Capture source; the device itself is acquired by `AudioBackend::start`
    fn open_input(&self) -> VoiceResult<Box<dyn AudioBackend>>;
}

/// Local speaker plus microphone (or a WAV file standing in for it)
pub struct DeviceEngines {
    source: AudioSource,
    backend_config: AudioBackendConfig,
}

impl DeviceEngines {
    pub fn new(source: AudioSource, backend_config: AudioBackendConfig) -> Self {
        Self {
            source,
            backend_config,
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        let source = match &config.input_file {
            Some(path) => AudioSource::File {
                path: path.clone(),
                paced: true,
            },
            None => AudioSource::Microphone,
        };
        let backend_config = AudioBackendConfig {
            frame_size: config.frame_size,
            constraints: CaptureConstraints {
                echo_cancellation: config.echo_cancellation,
                noise_suppression: config.noise_suppression,
                auto_gain_control: config.auto_gain_control,
            },
            ..Default::default()
        };
        Self::new(source, backend_config)
    }
}

impl AudioEngines for DeviceEngines {
    fn open_output(&self) -> VoiceResult<Arc<dyn PlaybackOutput>> {
        Ok(Arc::new(SpeakerOutput::open()?))
    }

    fn open_input(&self) -> VoiceResult<Box<dyn AudioBackend>> {
        AudioBackendFactory::create(self.source.clone(), self.backend_config.clone())
    }
}
