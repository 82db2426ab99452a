use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub agent: AgentConfig,
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// WebSocket endpoint of the live agent (without the key parameter)
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    /// Name of the environment variable holding the credential
    pub api_key_env: String,
    pub instructions: String,
    /// 0 disables the timeout
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub transmit_sample_rate: u32,
    /// Samples per channel in each captured block
    pub frame_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Replay this WAV file instead of opening the microphone
    pub input_file: Option<String>,
}

impl Config {
    /// Load configuration from `path` (extension optional), falling back to
    /// built-in defaults. `LOQA_LIVE__AGENT__VOICE=Puck` style variables
    /// override both.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("service.name", "loqa-live")?
            .set_default("service.http.bind", "127.0.0.1")?
            .set_default("service.http.port", 3010)?
            .set_default("agent.endpoint", crate::transport::DEFAULT_ENDPOINT)?
            .set_default("agent.model", crate::session::DEFAULT_MODEL)?
            .set_default("agent.voice", crate::session::DEFAULT_VOICE)?
            .set_default("agent.api_key_env", "GEMINI_API_KEY")?
            .set_default("agent.instructions", crate::session::DEFAULT_INSTRUCTIONS)?
            .set_default("agent.connect_timeout_secs", 15)?
            .set_default("audio.transmit_sample_rate", 16000)?
            .set_default("audio.frame_size", 4096)?
            .set_default("audio.echo_cancellation", true)?
            .set_default("audio.noise_suppression", true)?
            .set_default("audio.auto_gain_control", true)?
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("LOQA_LIVE").separator("__"))
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        Ok(settings.try_deserialize()?)
    }
}
