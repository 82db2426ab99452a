// Speaker output through cpal
//
// Scheduled units are mixed into the device buffer by absolute frame
// position. The playback clock is the number of frames the device has
// consumed, so `now()` advances exactly as audio is heard. Overlapping units
// are summed with clipping, like the capture-side mixer this grew out of.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::convert;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{Completion, PlaybackOutput, PlaybackUnit, UnitId};

pub struct SpeakerOutput {
    mixer: Arc<Mutex<Mixer>>,
    rendered: Arc<AtomicU64>,
    device_rate: u32,
    shutdown: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl SpeakerOutput {
    /// Open the default output device. Blocks until the device is running.
    pub fn open() -> VoiceResult<Self> {
        let rendered = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) =
            std_mpsc::sync_channel::<VoiceResult<(u32, Arc<Mutex<Mixer>>)>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let clock = Arc::clone(&rendered);
        thread::Builder::new()
            .name("loqa-speaker".to_string())
            .spawn(move || {
                let (stream, rate, mixer) = match open_output_stream(clock) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((rate, mixer)));
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Speaker stream released");
            })
            .map_err(|e| VoiceError::Device(format!("failed to spawn output thread: {}", e)))?;

        let (device_rate, mixer) = ready_rx
            .recv()
            .map_err(|_| VoiceError::Device("output thread exited".to_string()))??;

        Ok(Self {
            mixer,
            rendered,
            device_rate,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    fn mixer(&self) -> MutexGuard<'_, Mixer> {
        lock(&self.mixer)
    }
}

impl PlaybackOutput for SpeakerOutput {
    fn now(&self) -> Duration {
        Duration::from_secs_f64(
            self.rendered.load(Ordering::Acquire) as f64 / self.device_rate as f64,
        )
    }

    fn schedule(&self, unit: PlaybackUnit) -> VoiceResult<()> {
        let PlaybackUnit {
            id,
            chunk,
            completion,
        } = unit;
        let mono = convert::downmix(&chunk.samples, chunk.channels);
        let span = FrameSpan::of(chunk.start, chunk.duration(), self.device_rate);
        let samples = convert::resample_span(
            &mono,
            chunk.sample_rate,
            self.device_rate,
            span.phase,
            span.len,
        );
        let start_frame = span.start_frame;

        self.mixer().units.push(MixUnit {
            id,
            samples,
            start_frame,
            completion,
        });
        Ok(())
    }

    fn stop(&self, ids: &[UnitId]) {
        self.mixer().units.retain(|u| !ids.contains(&u.id));
    }

    fn close(&self) {
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(shutdown) = shutdown {
            self.mixer().units.clear();
            let _ = shutdown.send(());
            info!("Speaker output closed");
        }
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Where a unit lands on the device clock. Boundaries are rounded from
/// absolute times, so units that are contiguous on the playback clock tile
/// the device frames with no gap and no overlap.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FrameSpan {
    start_frame: u64,
    len: usize,
    /// Offset of `start_frame` from the exact start, in device frames
    phase: f64,
}

impl FrameSpan {
    fn of(start: Duration, duration: Duration, device_rate: u32) -> Self {
        let rate = device_rate as f64;
        let exact_start = start.as_secs_f64() * rate;
        let start_frame = exact_start.round() as u64;
        let end_frame = ((start + duration).as_secs_f64() * rate).round() as u64;
        Self {
            start_frame,
            len: end_frame.saturating_sub(start_frame) as usize,
            phase: start_frame as f64 - exact_start,
        }
    }
}

struct MixUnit {
    id: UnitId,
    /// Mono at the device rate
    samples: Vec<f32>,
    start_frame: u64,
    completion: Completion,
}

#[derive(Default)]
struct Mixer {
    units: Vec<MixUnit>,
    rendered: u64,
}

impl Mixer {
    /// Fill `out` (interleaved, `channels` wide) and return completions of
    /// units that finished. Completions are fired by the caller after the
    /// mixer lock is released.
    fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<Completion> {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        for f in 0..frames {
            let t = self.rendered + f as u64;
            let sum: f32 = self
                .units
                .iter()
                .filter_map(|u| {
                    t.checked_sub(u.start_frame)
                        .and_then(|i| u.samples.get(i as usize))
                })
                .sum();
            let value = sum.clamp(-1.0, 1.0);
            out[f * channels..(f + 1) * channels].fill(value);
        }
        self.rendered += frames as u64;

        let rendered = self.rendered;
        let mut finished = Vec::new();
        let mut i = 0;
        while i < self.units.len() {
            let unit = &self.units[i];
            if unit.start_frame + unit.samples.len() as u64 <= rendered {
                finished.push(self.units.swap_remove(i).completion);
            } else {
                i += 1;
            }
        }
        finished
    }
}

fn open_output_stream(
    clock: Arc<AtomicU64>,
) -> VoiceResult<(cpal::Stream, u32, Arc<Mutex<Mixer>>)> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| VoiceError::Device("No output device available".to_string()))?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported = device.default_output_config()?;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.into();
    let rate = stream_config.sample_rate.0;
    let channels = stream_config.channels as usize;

    let mixer = Arc::new(Mutex::new(Mixer::default()));
    let on_error = |err: cpal::StreamError| warn!("Speaker stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::F32 => {
            let mixer = Arc::clone(&mixer);
            device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let finished = render_into(&mixer, &clock, data, channels);
                    finished.into_iter().for_each(Completion::fire);
                },
                on_error,
                None,
            )?
        }
        SampleFormat::I16 => {
            let mixer = Arc::clone(&mixer);
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    let finished = render_into(&mixer, &clock, &mut scratch, channels);
                    data.copy_from_slice(&convert::f32_to_i16(&scratch));
                    finished.into_iter().for_each(Completion::fire);
                },
                on_error,
                None,
            )?
        }
        other => {
            return Err(VoiceError::Device(format!(
                "unsupported output sample format {:?}",
                other
            )))
        }
    };

    stream.play()?;
    info!("Speaker output started: {} ({}Hz, {} channels)", name, rate, channels);

    Ok((stream, rate, mixer))
}

fn render_into(
    mixer: &Mutex<Mixer>,
    clock: &AtomicU64,
    data: &mut [f32],
    channels: usize,
) -> Vec<Completion> {
    let mut mixer = lock(mixer);
    let finished = mixer.render(data, channels);
    clock.store(mixer.rendered, Ordering::Release);
    finished
}

fn lock(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    mixer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
