pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use audio::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioEngines, AudioFile, AudioFrame,
    AudioSource, DeviceEngines,
};
pub use capture::{CapturePipeline, CaptureSnapshot};
pub use config::Config;
pub use error::{VoiceError, VoiceResult};
pub use http::{create_router, AppState};
pub use lifecycle::Resource;
pub use playback::{PlaybackOutput, PlaybackScheduler, PlaybackSnapshot, PlaybackUnit, Reservation};
pub use session::{
    Role, SessionConfig, SessionManager, SessionState, SessionStats, TranscriptSegment,
    TranscriptionEvent,
};
pub use telemetry::{LogEntry, LogSink, Stage, Status, TracingSink};
pub use transport::{AgentChannel, AgentTransport, ChannelEvent, ChannelSender, LiveTransport};
