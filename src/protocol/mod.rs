//! Wire format of the live agent channel
//!
//! Outbound: a one-time `setup` frame, then `realtimeInput` frames carrying
//! base64 PCM16LE microphone audio at 16 kHz.
//! Inbound: `setupComplete`, `serverContent` (audio parts, transcription
//! deltas, turn-complete and interruption flags) and `goAway`.

pub mod client;
pub mod server;

pub use client::{pcm_mime, Blob, ClientMessage, RealtimeInput, Setup};
pub use server::{mime_rate, AudioPayload, ServerContent, ServerMessage, DEFAULT_PLAYBACK_RATE};
