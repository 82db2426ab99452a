use base64::Engine;
use serde::{Deserialize, Serialize};

/// Messages sent to the live agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// One-time open configuration, first frame on the channel
    Setup(Setup),
    /// Streaming microphone input
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Wrap 16-bit PCM samples as a realtime input frame
    pub fn audio(samples: &[i16], sample_rate: u32) -> Self {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: pcm_mime(sample_rate),
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            }],
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    /// Fully qualified model name (`models/...`)
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub input_audio_transcription: Enabled,
    pub output_audio_transcription: Enabled,
}

impl Setup {
    /// Audio-only responses in `voice`, transcription on in both directions
    pub fn new(model: &str, voice: &str, instructions: impl Into<String>) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.to_string(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: instructions.into(),
                }],
            },
            input_audio_transcription: Enabled {},
            output_audio_transcription: Enabled {},
        }
    }

    pub fn instructions(&self) -> &str {
        self.system_instruction
            .parts
            .first()
            .map(|p| p.text.as_str())
            .unwrap_or_default()
    }

    pub fn voice(&self) -> &str {
        &self
            .generation_config
            .speech_config
            .voice_config
            .prebuilt_voice_config
            .voice_name
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextPart {
    pub text: String,
}

/// Serializes as `{}`; its presence switches a feature on
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Enabled {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Base64 binary payload with its mime type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

pub fn pcm_mime(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}
