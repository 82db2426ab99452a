//! Inbound messages from the live agent
//!
//! Wire frames are decoded leniently into [`RawServerMessage`] and then
//! turned into the closed [`ServerMessage`] enum. Parts that cannot be
//! understood are skipped and counted instead of failing the whole message.

use serde::Deserialize;
use tracing::debug;

use crate::error::{VoiceError, VoiceResult};

/// Default rate of synthesized audio when the mime type does not say
pub const DEFAULT_PLAYBACK_RATE: u32 = 24000;

/// One inbound message, by kind
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Remote acknowledgement of the open configuration
    SetupComplete,
    Content(ServerContent),
    /// The server will close the channel soon
    GoAway { time_left: Option<String> },
    /// A kind this client does not handle (tool calls, usage metadata, ...)
    Other(String),
}

/// Everything a content message may carry. Each field is independent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerContent {
    pub audio: Vec<AudioPayload>,
    pub input_transcription: Option<String>,
    pub output_transcription: Option<String>,
    pub turn_complete: bool,
    pub interrupted: bool,
    /// Parts dropped because they were malformed or not audio
    pub skipped_parts: usize,
}

/// Base64 PCM16LE mono audio from the agent
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPayload {
    pub data: String,
    pub sample_rate: u32,
}

impl AudioPayload {
    pub fn new(data: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            sample_rate,
        }
    }
}

impl ServerMessage {
    /// Parse one wire frame. Only a frame that is not a JSON object at all is
    /// an error; unknown or malformed members are tolerated.
    pub fn parse(text: &str) -> VoiceResult<Self> {
        let raw: RawServerMessage = serde_json::from_str(text)
            .map_err(|e| VoiceError::Protocol(format!("undecodable server frame: {}", e)))?;
        Ok(raw.into())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<serde_json::Value>,
    go_away: Option<serde_json::Value>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

/// Members are kept as raw values and converted one at a time, so a badly
/// typed member only loses itself.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerContent {
    model_turn: Option<serde_json::Value>,
    input_transcription: Option<serde_json::Value>,
    output_transcription: Option<serde_json::Value>,
    turn_complete: Option<serde_json::Value>,
    interrupted: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTurn {
    #[serde(default)]
    parts: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawTranscription {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGoAway {
    time_left: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    inline_data: Option<RawInlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

impl From<RawServerMessage> for ServerMessage {
    fn from(raw: RawServerMessage) -> Self {
        if let Some(content) = raw.server_content {
            return ServerMessage::Content(content_from_value(content));
        }
        if raw.setup_complete.is_some() {
            return ServerMessage::SetupComplete;
        }
        if let Some(go_away) = raw.go_away {
            let go_away: RawGoAway = serde_json::from_value(go_away).unwrap_or_else(|e| {
                debug!("Malformed goAway notice: {}", e);
                RawGoAway::default()
            });
            return ServerMessage::GoAway {
                time_left: go_away.time_left,
            };
        }
        let kind = raw
            .rest
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "empty".to_string());
        ServerMessage::Other(kind)
    }
}

fn content_from_value(value: serde_json::Value) -> ServerContent {
    let raw: RawServerContent = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => {
            debug!("Skipping malformed server content: {}", e);
            return ServerContent {
                skipped_parts: 1,
                ..Default::default()
            };
        }
    };

    let mut skipped = 0;
    let mut content = ServerContent {
        input_transcription: transcription(raw.input_transcription, &mut skipped),
        output_transcription: transcription(raw.output_transcription, &mut skipped),
        turn_complete: flag(raw.turn_complete, "turnComplete", &mut skipped),
        interrupted: flag(raw.interrupted, "interrupted", &mut skipped),
        skipped_parts: skipped,
        ..Default::default()
    };

    let parts = match raw.model_turn.map(serde_json::from_value::<RawTurn>) {
        None => Vec::new(),
        Some(Ok(turn)) => turn.parts,
        Some(Err(e)) => {
            debug!("Skipping malformed model turn: {}", e);
            content.skipped_parts += 1;
            Vec::new()
        }
    };
    for part in parts {
        match audio_part(part) {
            Some(payload) => content.audio.push(payload),
            None => content.skipped_parts += 1,
        }
    }

    content
}

fn transcription(value: Option<serde_json::Value>, skipped: &mut usize) -> Option<String> {
    match serde_json::from_value::<RawTranscription>(value?) {
        Ok(t) => t.text,
        Err(e) => {
            debug!("Skipping malformed transcription: {}", e);
            *skipped += 1;
            None
        }
    }
}

/// Absent or null reads as false; any other non-boolean is skipped.
fn flag(value: Option<serde_json::Value>, name: &str, skipped: &mut usize) -> bool {
    match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(b)) => b,
        Some(other) => {
            debug!("Skipping malformed {} flag: {}", name, other);
            *skipped += 1;
            false
        }
    }
}

fn audio_part(value: serde_json::Value) -> Option<AudioPayload> {
    let part: RawPart = match serde_json::from_value(value) {
        Ok(part) => part,
        Err(e) => {
            debug!("Skipping malformed content part: {}", e);
            return None;
        }
    };
    let inline = part.inline_data?;
    if !inline.mime_type.starts_with("audio/pcm") {
        debug!("Skipping non-audio part ({})", inline.mime_type);
        return None;
    }
    let sample_rate = mime_rate(&inline.mime_type).unwrap_or(DEFAULT_PLAYBACK_RATE);
    Some(AudioPayload::new(inline.data, sample_rate))
}

/// Extract `rate=N` from a mime type such as `audio/pcm;rate=24000`
pub fn mime_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}
