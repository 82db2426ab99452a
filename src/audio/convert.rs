//! Sample format conversion between capture, wire and playback

use super::backend::AudioFrame;

/// Average interleaved channels down to mono
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 | 1 => samples.to_vec(),
        n => samples
            .chunks_exact(n as usize)
            .map(|frame| frame.iter().sum::<f32>() / n as f32)
            .collect(),
    }
}

/// Streaming linear-interpolation resampler for mono audio.
///
/// The read position and the last input sample carry over between calls,
/// so consecutive blocks resample as one continuous signal: no output
/// samples are lost at block edges and interpolation never restarts.
#[derive(Debug, Clone)]
pub struct Resampler {
    to_rate: u32,
    from_rate: u32,
    /// Next read position, relative to the start of the next block.
    /// In `[-1, 0)` it falls between the previous block's last sample and
    /// the next block's first.
    position: f64,
    previous: Option<f32>,
}

impl Resampler {
    pub fn new(to_rate: u32) -> Self {
        Self {
            to_rate,
            from_rate: 0,
            position: 0.0,
            previous: None,
        }
    }

    /// Resample one block. A change of input rate starts a new signal.
    pub fn process(&mut self, samples: &[f32], from_rate: u32) -> Vec<f32> {
        if from_rate != self.from_rate {
            self.from_rate = from_rate;
            self.position = 0.0;
            self.previous = None;
        }
        if from_rate == self.to_rate || from_rate == 0 || self.to_rate == 0 {
            return samples.to_vec();
        }
        let Some(&last) = samples.last() else {
            return Vec::new();
        };

        let step = from_rate as f64 / self.to_rate as f64;
        let end = (samples.len() - 1) as f64;
        let mut out = Vec::with_capacity((samples.len() as f64 / step) as usize + 1);

        while self.position < end {
            let idx = self.position.floor();
            let frac = (self.position - idx) as f32;
            let a = if idx < 0.0 {
                self.previous.unwrap_or(samples[0])
            } else {
                samples[idx as usize]
            };
            let b = samples[(idx + 1.0) as usize];
            out.push(a + (b - a) * frac);
            self.position += step;
        }

        self.position -= samples.len() as f64;
        self.previous = Some(last);
        out
    }
}

/// Resample onto exactly `out_len` output samples. Output `i` reads input
/// position `(i + phase) * from_rate / to_rate`, held at the input's ends.
pub fn resample_span(
    samples: &[f32],
    from_rate: u32,
    to_rate: u32,
    phase: f64,
    out_len: usize,
) -> Vec<f32> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return vec![0.0; out_len];
    }

    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = ((i as f64 + phase) * step).max(0.0);
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(last)];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

/// Clamp to [-1, 1] and scale asymmetrically so both extremes are reachable
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

pub fn u16_to_f32(samples: &[u16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| (s as f32 - 32768.0) / 32768.0)
        .collect()
}

/// Device frame to mono 16-bit PCM at the resampler's output rate
pub fn to_transmit(frame: &AudioFrame, resampler: &mut Resampler) -> Vec<i16> {
    let mono = downmix(&frame.samples, frame.channels);
    let resampled = resampler.process(&mono, frame.sample_rate);
    f32_to_i16(&resampled)
}
