//! Audio device seam.
//!
//! [`AudioBackend`] hands out one input ([`FrameSource`]) and one output ([`AudioOutput`])
//! per session. Both are scoped: dropping the returned value releases the device.
//!
//! [`CpalBackend`] is the bare-metal implementation (cpal capture, rodio playback).
//! [`ScriptedBackend`] drives sessions without hardware.

use crate::codec::AudioFrame;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{AudioOutput, PlaybackSlot};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, Stream, StreamConfig};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Pull-based capture: blocks of mono samples at the rate the input was opened with.
#[async_trait]
pub trait FrameSource: Send {
    /// Next block of samples. `Some(Err(_))` reports a stream fault; `None` means the
    /// device has stopped delivering.
    async fn next_block(&mut self) -> Option<VoiceResult<Vec<f32>>>;
}

/// Opens the devices for one session.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone, delivering mono samples at `sample_rate`.
    async fn open_input(&self, sample_rate: u32) -> VoiceResult<Box<dyn FrameSource>>;

    /// Acquire the speaker. Called on the playback thread.
    fn open_output(&self, sample_rate: u32) -> VoiceResult<Box<dyn AudioOutput>>;
}

// ---------------------------------------------------------------------------
// cpal + rodio
// ---------------------------------------------------------------------------

/// Default devices of the host: cpal for capture, rodio for playback.
#[derive(Debug, Clone)]
pub struct CpalBackend {
    /// Input device name; the host default when `None`.
    pub input_device: Option<String>,
    /// Captured blocks buffered before the oldest callbacks are dropped.
    pub block_queue_capacity: usize,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self {
            input_device: None,
            block_queue_capacity: 64,
        }
    }
}

impl CpalBackend {
    pub fn new(input_device: Option<String>) -> Self {
        Self {
            input_device,
            ..Default::default()
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        Ok(host
            .input_devices()?
            .filter_map(|device| device.name().ok())
            .collect())
    }
}

#[async_trait]
impl AudioBackend for CpalBackend {
    async fn open_input(&self, sample_rate: u32) -> VoiceResult<Box<dyn FrameSource>> {
        let (block_tx, block_rx) = mpsc::channel(self.block_queue_capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let device_name = self.input_device.clone();

        // cpal streams are !Send; the stream lives and dies on this thread.
        thread::Builder::new()
            .name("live-voice-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(device_name.as_deref(), sample_rate, block_tx)
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Parked until the CpalInput is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                info!("Input device released");
            })?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(CpalInput {
                blocks: block_rx,
                _stop: stop_tx,
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::AudioDevice(
                "capture thread exited before the input opened".to_string(),
            )),
        }
    }

    fn open_output(&self, sample_rate: u32) -> VoiceResult<Box<dyn AudioOutput>> {
        Ok(Box::new(RodioOutput::new(sample_rate)?))
    }
}

/// Live microphone. Dropping it stops the stream and releases the device.
pub struct CpalInput {
    blocks: mpsc::Receiver<VoiceResult<Vec<f32>>>,
    _stop: std::sync::mpsc::Sender<()>,
}

#[async_trait]
impl FrameSource for CpalInput {
    async fn next_block(&mut self) -> Option<VoiceResult<Vec<f32>>> {
        self.blocks.recv().await
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    blocks: mpsc::Sender<VoiceResult<Vec<f32>>>,
) -> VoiceResult<Stream> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| VoiceError::AudioDevice(format!("input device not found: {}", name)))?,
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?,
    };

    let supported = device.default_input_config()?;
    let stream_config: StreamConfig = supported.config();
    info!(
        device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
        device_rate = stream_config.sample_rate.0,
        channels = stream_config.channels,
        target_rate = sample_rate,
        "Opening input stream"
    );

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => {
            build_typed_input::<f32>(&device, &stream_config, sample_rate, blocks)?
        }
        cpal::SampleFormat::I16 => {
            build_typed_input::<i16>(&device, &stream_config, sample_rate, blocks)?
        }
        cpal::SampleFormat::U16 => {
            build_typed_input::<u16>(&device, &stream_config, sample_rate, blocks)?
        }
        other => {
            return Err(VoiceError::AudioStream(format!(
                "unsupported input sample format: {:?}",
                other
            )))
        }
    };
    stream.play()?;
    Ok(stream)
}

fn build_typed_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    target_rate: u32,
    blocks: mpsc::Sender<VoiceResult<Vec<f32>>>,
) -> VoiceResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut resampler = MonoResampler::new(config.sample_rate.0, target_rate);
    let error_blocks = blocks.clone();
    let mut mono = Vec::new();

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mono.clear();
            mono.extend(data.chunks(channels).map(|frame| {
                frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / frame.len() as f32
            }));
            let mut block = Vec::with_capacity(mono.len());
            resampler.process(&mono, &mut block);
            if block.is_empty() {
                return;
            }
            // Never block the device callback.
            if blocks.try_send(Ok(block)).is_err() {
                trace!("Capture block dropped (consumer behind or gone)");
            }
        },
        move |err| {
            warn!(error = %err, "Audio input stream error");
            let _ = error_blocks.try_send(Err(VoiceError::AudioStream(err.to_string())));
        },
        None,
    )?;
    Ok(stream)
}

/// Linear-interpolating rate converter for a mono stream delivered in blocks.
#[derive(Debug, Clone)]
pub struct MonoResampler {
    step: f64,
    /// Read position; index 0 is the last sample of the previous block.
    pos: f64,
    prev: f32,
}

impl MonoResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate.max(1) as f64,
            pos: 1.0,
            prev: 0.0,
        }
    }

    /// Append the converted samples of `input` to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if input.is_empty() {
            return;
        }
        if self.step == 1.0 {
            out.extend_from_slice(input);
            return;
        }

        let len = input.len();
        let at = |i: usize| if i == 0 { self.prev } else { input[i - 1] };
        while self.pos < len as f64 {
            let i = self.pos.floor() as usize;
            let frac = (self.pos - i as f64) as f32;
            let a = at(i);
            let b = at(i + 1);
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }
        self.pos -= len as f64;
        self.prev = input[len - 1];
    }
}

/// Speaker output on a rodio sink, clocked from the moment it was opened.
///
/// The sink plays appended sources back-to-back, so a frame scheduled after a gap is
/// preceded by the matching amount of silence.
pub struct RodioOutput {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Sink,
    sample_rate: u32,
    epoch: Instant,
    /// Output time at which everything appended so far finishes.
    queued_until: f64,
}

impl RodioOutput {
    /// Open the default output device.
    pub fn new(sample_rate: u32) -> VoiceResult<Self> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
        let sink = Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        info!(sample_rate, "Output sink ready");
        Ok(Self {
            _stream: stream,
            handle,
            sink,
            sample_rate,
            epoch: Instant::now(),
            queued_until: 0.0,
        })
    }
}

impl AudioOutput for RodioOutput {
    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn play_at(&mut self, frame: AudioFrame, start: f64) -> VoiceResult<()> {
        let now = self.current_time();
        let tail = self.queued_until.max(now);
        let gap = start - tail;
        if gap > 0.001 {
            self.sink.append(
                rodio::source::Zero::<f32>::new(1, self.sample_rate)
                    .take_duration(Duration::from_secs_f64(gap)),
            );
        }
        let duration = frame.duration_secs();
        self.sink
            .append(SamplesBuffer::new(1, frame.sample_rate, frame.samples));
        self.queued_until = start.max(tail) + duration;
        Ok(())
    }

    fn stop_all(&mut self) -> VoiceResult<()> {
        self.sink.stop();
        // A stopped sink stays stopped; start a fresh one for the next turn.
        self.sink = Sink::try_new(&self.handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        self.queued_until = self.current_time();
        debug!("Output sink cleared");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hardware-free devices
// ---------------------------------------------------------------------------

/// Hand-driven output clock.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }

    pub fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    played: Vec<PlaybackSlot>,
    stops: usize,
    fail_next: Option<String>,
}

/// Output that records what would have played. Clones share the same record.
#[derive(Debug, Clone)]
pub struct RecordingOutput {
    clock: ManualClock,
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingOutput {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(RecordingState::default())),
        }
    }

    /// Every frame started so far, in call order.
    pub fn played(&self) -> Vec<PlaybackSlot> {
        self.lock().played.clone()
    }

    /// Number of `stop_all` calls.
    pub fn stop_count(&self) -> usize {
        self.lock().stops
    }

    /// Make the next `play_at` fail as if the device vanished.
    pub fn fail_next_play(&self, reason: impl Into<String>) {
        self.lock().fail_next = Some(reason.into());
    }

    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AudioOutput for RecordingOutput {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn play_at(&mut self, frame: AudioFrame, start: f64) -> VoiceResult<()> {
        let mut state = self.lock();
        if let Some(reason) = state.fail_next.take() {
            return Err(VoiceError::Playback(reason));
        }
        let seq = state.played.len() as u64;
        state.played.push(PlaybackSlot {
            seq,
            start,
            duration: frame.duration_secs(),
        });
        Ok(())
    }

    fn stop_all(&mut self) -> VoiceResult<()> {
        self.lock().stops += 1;
        Ok(())
    }
}

/// Pushes capture blocks into a [`ScriptedBackend`]'s input.
#[derive(Debug, Clone)]
pub struct InputFeed {
    tx: mpsc::Sender<VoiceResult<Vec<f32>>>,
}

impl InputFeed {
    /// Deliver one block of samples. Returns false once the input has been released.
    pub async fn push(&self, samples: Vec<f32>) -> bool {
        self.tx.send(Ok(samples)).await.is_ok()
    }

    /// Report a stream fault, as a device callback would.
    pub async fn fail(&self, reason: impl Into<String>) -> bool {
        self.tx
            .send(Err(VoiceError::AudioStream(reason.into())))
            .await
            .is_ok()
    }
}

/// Backend with a fed input and a recording output on a manual clock.
#[derive(Clone)]
pub struct ScriptedBackend {
    blocks: Arc<Mutex<Option<mpsc::Receiver<VoiceResult<Vec<f32>>>>>>,
    clock: ManualClock,
    output: RecordingOutput,
    input_open: Arc<AtomicBool>,
    input_opened: Arc<AtomicBool>,
    deny_input: Option<String>,
    fail_output: Option<String>,
}

impl ScriptedBackend {
    pub fn new() -> (Self, InputFeed) {
        let (tx, rx) = mpsc::channel(64);
        let clock = ManualClock::new();
        let backend = Self {
            blocks: Arc::new(Mutex::new(Some(rx))),
            output: RecordingOutput::new(clock.clone()),
            clock,
            input_open: Arc::new(AtomicBool::new(false)),
            input_opened: Arc::new(AtomicBool::new(false)),
            deny_input: None,
            fail_output: None,
        };
        (backend, InputFeed { tx })
    }

    /// Refuse microphone access, as a denied permission prompt would.
    pub fn denying_input(mut self, reason: impl Into<String>) -> Self {
        self.deny_input = Some(reason.into());
        self
    }

    /// Fail to open the speaker.
    pub fn failing_output(mut self, reason: impl Into<String>) -> Self {
        self.fail_output = Some(reason.into());
        self
    }

    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    pub fn output(&self) -> RecordingOutput {
        self.output.clone()
    }

    /// Whether the input is currently held by a session.
    pub fn input_open(&self) -> bool {
        self.input_open.load(Ordering::SeqCst)
    }

    /// Whether the input was ever acquired.
    pub fn input_was_opened(&self) -> bool {
        self.input_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioBackend for ScriptedBackend {
    async fn open_input(&self, _sample_rate: u32) -> VoiceResult<Box<dyn FrameSource>> {
        if let Some(reason) = &self.deny_input {
            return Err(VoiceError::PermissionDenied(reason.clone()));
        }
        let blocks = self
            .blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| VoiceError::AudioDevice("input already in use".to_string()))?;
        self.input_open.store(true, Ordering::SeqCst);
        self.input_opened.store(true, Ordering::SeqCst);
        Ok(Box::new(ScriptedInput {
            blocks,
            open: self.input_open.clone(),
        }))
    }

    fn open_output(&self, _sample_rate: u32) -> VoiceResult<Box<dyn AudioOutput>> {
        if let Some(reason) = &self.fail_output {
            return Err(VoiceError::Playback(reason.clone()));
        }
        Ok(Box::new(self.output.clone()))
    }
}

struct ScriptedInput {
    blocks: mpsc::Receiver<VoiceResult<Vec<f32>>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSource for ScriptedInput {
    async fn next_block(&mut self) -> Option<VoiceResult<Vec<f32>>> {
        self.blocks.recv().await
    }
}

impl Drop for ScriptedInput {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
