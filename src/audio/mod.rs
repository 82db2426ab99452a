pub mod backend;
pub mod convert;
pub mod engines;
pub mod file;
pub mod microphone;
pub mod speaker;

pub use backend::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioSource,
    CaptureConstraints,
};
pub use engines::{AudioEngines, DeviceEngines};
pub use file::{AudioFile, FileBackend};
pub use microphone::MicrophoneBackend;
pub use speaker::SpeakerOutput;
