use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;
use crate::protocol::Setup;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

pub const DEFAULT_VOICE: &str = "Kore";

pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful voice assistant. \
Keep answers short and conversational, and stop speaking as soon as the user interrupts.";

/// Configuration for one live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Model name without the "models/" prefix
    pub model: String,

    /// Prebuilt voice the agent speaks with
    pub voice: String,

    /// System instruction text
    pub instructions: String,

    /// Rate of outbound PCM (the agent expects 16kHz)
    pub transmit_sample_rate: u32,

    /// How long to wait for the open acknowledgement; `None` waits forever
    pub connect_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            transmit_sample_rate: 16000,
            connect_timeout: Some(Duration::from_secs(15)),
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        let timeout = config.agent.connect_timeout_secs;
        Self {
            model: config.agent.model.clone(),
            voice: config.agent.voice.clone(),
            instructions: config.agent.instructions.clone(),
            transmit_sample_rate: config.audio.transmit_sample_rate,
            connect_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
        }
    }

    /// Instruction text, with `extra_context` appended as a reference block
    pub fn system_instruction(&self, extra_context: Option<&str>) -> String {
        match extra_context.map(str::trim).filter(|c| !c.is_empty()) {
            Some(context) => format!(
                "{}\n\n### REFERENCE CONTEXT ###\n\
                 Use the following material when it is relevant to the user's question. \
                 Do not invent details it does not contain.\n\
                 --- BEGIN CONTEXT ---\n{}\n--- END CONTEXT ---",
                self.instructions, context
            ),
            None => self.instructions.clone(),
        }
    }

    /// The open configuration sent as the channel's first frame
    pub fn setup(&self, extra_context: Option<&str>) -> Setup {
        Setup::new(&self.model, &self.voice, self.system_instruction(extra_context))
    }
}
