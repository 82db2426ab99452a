//! Error types for the live voice session

use std::time::Duration;
use thiserror::Error;

/// Result type alias for voice session operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors raised by the session core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// Missing credential or other setup prerequisite
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Microphone or speaker unavailable, or permission denied
    #[error("Audio device error: {0}")]
    Device(String),

    /// Channel-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected inbound data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Remote-initiated (or pre-open) close of the channel
    #[error("Channel closed (code {code:?}): {reason}")]
    ChannelClosed { code: Option<u16>, reason: String },

    #[error("Session did not open within {0:?}")]
    ConnectTimeout(Duration),
}

impl VoiceError {
    pub fn closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        VoiceError::ChannelClosed {
            code,
            reason: reason.into(),
        }
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(err.to_string())
    }
}
