use base64::Engine;
use std::time::Duration;

use crate::audio::convert;
use crate::error::{VoiceError, VoiceResult};

const BYTES_PER_SAMPLE: usize = 2;

/// Decode the base64 text of a payload into raw PCM16LE bytes
pub fn decode_base64(data: &str) -> VoiceResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data.as_bytes())
        .map_err(|e| VoiceError::Protocol(format!("invalid base64 audio: {}", e)))
}

/// Playback length of `byte_len` bytes of mono PCM16
pub fn pcm_duration(byte_len: usize, sample_rate: u32) -> VoiceResult<Duration> {
    if sample_rate == 0 {
        return Err(VoiceError::Protocol(
            "audio payload with zero sample rate".to_string(),
        ));
    }
    Ok(samples_duration(byte_len / BYTES_PER_SAMPLE, sample_rate))
}

pub fn samples_duration(samples: usize, sample_rate: u32) -> Duration {
    Duration::from_nanos(samples as u64 * 1_000_000_000 / sample_rate as u64)
}

/// Convert PCM16LE mono bytes into normalized samples. A trailing odd byte
/// is ignored.
pub fn pcm_to_samples(bytes: &[u8]) -> Vec<f32> {
    let pcm: Vec<i16> = bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    convert::i16_to_f32(&pcm)
}
