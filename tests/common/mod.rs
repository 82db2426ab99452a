// In-memory stand-ins for the transport, audio engines and log sink
//
// The playback clock of FakeOutput only moves when a test advances it, and
// units complete only when the clock passes their end.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use loqa_live::audio::{AudioBackend, AudioEngines, AudioFrame};
use loqa_live::error::{VoiceError, VoiceResult};
use loqa_live::playback::{Completion, PlaybackOutput, PlaybackUnit, UnitId};
use loqa_live::protocol::{AudioPayload, ClientMessage, ServerContent, ServerMessage, Setup};
use loqa_live::telemetry::{LogEntry, LogSink};
use loqa_live::transport::{AgentChannel, AgentTransport, ChannelEvent, ChannelSender};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// Helpers
// ============================================================================

/// Base64 PCM16 silence lasting `ms` at `sample_rate`
pub fn silence(ms: u64, sample_rate: u32) -> AudioPayload {
    let samples = (sample_rate as u64 * ms / 1000) as usize;
    let bytes = vec![0u8; samples * 2];
    AudioPayload::new(
        base64::engine::general_purpose::STANDARD.encode(bytes),
        sample_rate,
    )
}

pub fn content_with_audio(chunks: usize, ms: u64) -> ServerContent {
    ServerContent {
        audio: (0..chunks).map(|_| silence(ms, 24000)).collect(),
        ..Default::default()
    }
}

pub fn frame(value: f32, samples: usize) -> AudioFrame {
    AudioFrame {
        samples: vec![value; samples],
        sample_rate: 16000,
        channels: 1,
        timestamp_ms: 0,
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(Duration::from_secs(2), future).await {
        Ok(value) => value,
        Err(_) => panic!("future did not complete in time"),
    }
}

// ============================================================================
// Log sink
// ============================================================================

#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn contains(&self, message: &str) -> bool {
        self.messages().iter().any(|m| m == message)
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, entry: LogEntry) {
        self.entries.lock().unwrap().push(entry);
    }
}

// ============================================================================
// Playback output
// ============================================================================

pub struct ScheduledUnit {
    pub id: UnitId,
    pub start: Duration,
    pub duration: Duration,
    completion: Option<Completion>,
}

#[derive(Default)]
pub struct FakeOutput {
    now: Mutex<Duration>,
    units: Mutex<Vec<ScheduledUnit>>,
    stopped: Mutex<Vec<UnitId>>,
    closed: AtomicUsize,
    refuse: AtomicBool,
}

impl FakeOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Move the clock and complete every unit that has finished
    pub fn advance_to(&self, now: Duration) {
        *self.now.lock().unwrap() = now;
        let finished: Vec<Completion> = self
            .units
            .lock()
            .unwrap()
            .iter_mut()
            .filter(|u| u.start + u.duration <= now)
            .filter_map(|u| u.completion.take())
            .collect();
        finished.into_iter().for_each(Completion::fire);
    }

    /// (id, start, duration) of everything scheduled so far, in schedule order
    pub fn scheduled(&self) -> Vec<(UnitId, Duration, Duration)> {
        self.units
            .lock()
            .unwrap()
            .iter()
            .map(|u| (u.id, u.start, u.duration))
            .collect()
    }

    pub fn stopped(&self) -> Vec<UnitId> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn refuse_units(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

impl PlaybackOutput for FakeOutput {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    fn schedule(&self, unit: PlaybackUnit) -> VoiceResult<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(VoiceError::Device("output refused".to_string()));
        }
        let duration = unit.chunk.duration();
        self.units.lock().unwrap().push(ScheduledUnit {
            id: unit.id,
            start: unit.chunk.start,
            duration,
            completion: Some(unit.completion),
        });
        Ok(())
    }

    fn stop(&self, ids: &[UnitId]) {
        self.stopped.lock().unwrap().extend_from_slice(ids);
        for unit in self.units.lock().unwrap().iter_mut() {
            if ids.contains(&unit.id) {
                unit.completion = None;
            }
        }
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Channel
// ============================================================================

#[derive(Default)]
pub struct FakeSender {
    sent: Mutex<Vec<ClientMessage>>,
    refuse: AtomicBool,
    closes: AtomicUsize,
}

impl FakeSender {
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn refuse_frames(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

impl ChannelSender for FakeSender {
    fn send(&self, message: ClientMessage) -> VoiceResult<()> {
        if self.refuse.load(Ordering::SeqCst) || self.is_closed() {
            return Err(VoiceError::Transport("outbound queue full".to_string()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn close(&self) -> VoiceResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        // Closing twice is reported but must be swallowed by the caller
        if self.close_count() > 1 {
            return Err(VoiceError::Transport("already closed".to_string()));
        }
        Ok(())
    }
}

/// Hands out channels whose events the test injects
pub struct FakeTransport {
    /// Send `Opened` as soon as the channel exists
    auto_open: bool,
    fail: Mutex<Option<VoiceError>>,
    opens: AtomicUsize,
    setups: Mutex<Vec<Setup>>,
    senders: Mutex<Vec<Arc<FakeSender>>>,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl FakeTransport {
    pub fn new(auto_open: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_open,
            fail: Mutex::new(None),
            opens: AtomicUsize::new(0),
            setups: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        })
    }

    pub fn fail_with(&self, error: VoiceError) {
        *self.fail.lock().unwrap() = Some(error);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn last_setup(&self) -> Option<Setup> {
        self.setups.lock().unwrap().last().cloned()
    }

    pub fn sender(&self) -> Arc<FakeSender> {
        self.senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no channel opened")
    }

    pub fn emit(&self, event: ChannelEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn emit_content(&self, content: ServerContent) {
        self.emit(ChannelEvent::Message(ServerMessage::Content(content)));
    }
}

#[async_trait]
impl AgentTransport for FakeTransport {
    async fn open(&self, setup: Setup) -> VoiceResult<AgentChannel> {
        if let Some(error) = self.fail.lock().unwrap().clone() {
            return Err(error);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.setups.lock().unwrap().push(setup);

        let sender = Arc::new(FakeSender::default());
        self.senders.lock().unwrap().push(Arc::clone(&sender));

        let (tx, rx) = mpsc::unbounded_channel();
        if self.auto_open {
            let _ = tx.send(ChannelEvent::Opened);
        }
        *self.events.lock().unwrap() = Some(tx);

        Ok(AgentChannel {
            sender,
            events: rx,
        })
    }
}

// ============================================================================
// Audio engines
// ============================================================================

/// Capture backend fed by the test through `FakeEngines::push_frame`
pub struct ScriptedBackend {
    frames: Option<mpsc::Receiver<AudioFrame>>,
    deny: bool,
    gate: Option<oneshot::Receiver<()>>,
    stops: Arc<AtomicUsize>,
    capturing: bool,
}

impl ScriptedBackend {
    pub fn new(frames: mpsc::Receiver<AudioFrame>, stops: Arc<AtomicUsize>) -> Self {
        Self {
            frames: Some(frames),
            deny: false,
            gate: None,
            stops,
            capturing: false,
        }
    }

    /// A backend whose `start` does not finish until the returned sender fires
    pub fn gated(
        frames: mpsc::Receiver<AudioFrame>,
        stops: Arc<AtomicUsize>,
    ) -> (Self, oneshot::Sender<()>) {
        let (release, gate) = oneshot::channel();
        let mut backend = Self::new(frames, stops);
        backend.gate = Some(gate);
        (backend, release)
    }

    pub fn denied(stops: Arc<AtomicUsize>) -> Self {
        Self {
            frames: None,
            deny: true,
            gate: None,
            stops,
            capturing: false,
        }
    }
}

#[async_trait]
impl AudioBackend for ScriptedBackend {
    async fn start(&mut self) -> VoiceResult<mpsc::Receiver<AudioFrame>> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.await;
        }
        if self.deny {
            return Err(VoiceError::Device("permission denied".to_string()));
        }
        let frames = self
            .frames
            .take()
            .ok_or_else(|| VoiceError::Device("already capturing".to_string()))?;
        self.capturing = true;
        Ok(frames)
    }

    async fn stop(&mut self) -> VoiceResult<()> {
        self.capturing = false;
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub struct FakeEngines {
    pub output: Arc<FakeOutput>,
    deny_microphone: bool,
    fail_output: bool,
    output_gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    frames: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    pub mic_stops: Arc<AtomicUsize>,
    pub outputs_opened: AtomicUsize,
}

impl FakeEngines {
    pub fn new() -> Arc<Self> {
        Self::build(false, false)
    }

    pub fn without_microphone() -> Arc<Self> {
        Self::build(true, false)
    }

    pub fn without_speaker() -> Arc<Self> {
        Self::build(false, true)
    }

    fn build(deny_microphone: bool, fail_output: bool) -> Arc<Self> {
        Arc::new(Self {
            output: FakeOutput::new(),
            deny_microphone,
            fail_output,
            output_gate: Mutex::new(None),
            frames: Mutex::new(None),
            mic_stops: Arc::new(AtomicUsize::new(0)),
            outputs_opened: AtomicUsize::new(0),
        })
    }

    /// Feed one frame to the capture backend of the current session
    pub async fn push_frame(&self, frame: AudioFrame) -> bool {
        let tx = self.frames.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }

    /// Make the next `open_output` block its thread until the returned
    /// sender fires, failing after two seconds
    pub fn gate_output(&self) -> std::sync::mpsc::Sender<()> {
        let (release, gate) = std::sync::mpsc::channel();
        *self.output_gate.lock().unwrap() = Some(gate);
        release
    }

    pub fn mic_stops(&self) -> usize {
        self.mic_stops.load(Ordering::SeqCst)
    }
}

impl AudioEngines for FakeEngines {
    fn open_output(&self) -> VoiceResult<Arc<dyn PlaybackOutput>> {
        if self.fail_output {
            return Err(VoiceError::Device("No output device available".to_string()));
        }
        let gate = self.output_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.recv_timeout(Duration::from_secs(2))
                .map_err(|_| VoiceError::Device("output device never started".to_string()))?;
        }
        self.outputs_opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }

    fn open_input(&self) -> VoiceResult<Box<dyn AudioBackend>> {
        if self.deny_microphone {
            return Ok(Box::new(ScriptedBackend::denied(Arc::clone(&self.mic_stops))));
        }
        let (tx, rx) = mpsc::channel(16);
        *self.frames.lock().unwrap() = Some(tx);
        Ok(Box::new(ScriptedBackend::new(rx, Arc::clone(&self.mic_stops))))
    }
}
