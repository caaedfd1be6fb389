//! Microphone capture: fixed-size windows, mute, level meter, and the outbound queue.
//!
//! Capture never waits on the network. Encoded windows go into an [`OutboundQueue`] that
//! holds at most `capacity` chunks and evicts the oldest on overflow, so a stalled
//! transport costs stale speech rather than stalling the device.

use crate::codec::{AudioFrameCodec, EncodedChunk};
use crate::config::AudioConfig;
use crate::devices::FrameSource;
use crate::error::{VoiceError, VoiceResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Latest input level in `0.0..=1.0`, readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct AudioLevel(Arc<AtomicU32>);

impl AudioLevel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, level: f32) {
        self.0.store(level.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.set(0.0);
    }
}

/// Shared mute switch. Writes are visible to the capture task on its next window.
#[derive(Debug, Clone, Default)]
pub struct MuteFlag(Arc<AtomicBool>);

impl MuteFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, muted: bool) {
        self.0.store(muted, Ordering::SeqCst);
    }

    /// Flip the flag and return the new value.
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::SeqCst)
    }
}

/// `min(1, mean(|s|) * gain)`; zero for an empty window.
pub fn window_level(samples: &[f32], gain: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean = samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32;
    (mean * gain).min(1.0)
}

/// Bounded FIFO between capture and the transport sender. Overflow drops the oldest chunk.
#[derive(Debug)]
pub struct OutboundQueue {
    chunks: Mutex<VecDeque<EncodedChunk>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue without waiting. Returns the evicted chunk when the queue was full.
    pub fn push(&self, chunk: EncodedChunk) -> Option<EncodedChunk> {
        if self.closed.load(Ordering::SeqCst) {
            return Some(chunk);
        }
        let evicted = {
            let mut chunks = self.lock();
            let evicted = if chunks.len() >= self.capacity {
                chunks.pop_front()
            } else {
                None
            };
            chunks.push_back(chunk);
            evicted
        };
        if evicted.is_some() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "Outbound queue full; dropped oldest audio window");
        }
        self.notify.notify_one();
        evicted
    }

    /// Next chunk in FIFO order; `None` once closed and drained.
    pub async fn pop(&self) -> Option<EncodedChunk> {
        loop {
            let notified = self.notify.notified();
            if let Some(chunk) = self.lock().pop_front() {
                return Some(chunk);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Refuse further pushes and wake the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Chunks evicted by overflow so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<EncodedChunk>> {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Windows captured samples, applies mute, meters level, and queues encoded chunks.
pub struct CaptureStage {
    codec: AudioFrameCodec,
    window_size: usize,
    level_gain: f32,
    mute: MuteFlag,
    level: AudioLevel,
    queue: Arc<OutboundQueue>,
    pending: Vec<f32>,
    windows_sent: u64,
    windows_muted: u64,
}

impl CaptureStage {
    pub fn new(
        config: &AudioConfig,
        mute: MuteFlag,
        level: AudioLevel,
        queue: Arc<OutboundQueue>,
    ) -> Self {
        Self {
            codec: AudioFrameCodec::new(config.input_sample_rate),
            window_size: config.window_size.max(1),
            level_gain: config.level_gain,
            mute,
            level,
            queue,
            pending: Vec::with_capacity(config.window_size),
            windows_sent: 0,
            windows_muted: 0,
        }
    }

    /// Feed device samples; every completed window is processed. Returns how many
    /// windows were queued for the transport.
    pub fn push_samples(&mut self, samples: &[f32]) -> usize {
        let mut queued = 0;
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.window_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.window_size {
                let window = std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.window_size),
                );
                if self.process_window(&window) {
                    queued += 1;
                }
            }
        }
        queued
    }

    fn process_window(&mut self, window: &[f32]) -> bool {
        if self.mute.is_muted() {
            self.level.reset();
            self.windows_muted += 1;
            trace!("Muted; capture window discarded");
            return false;
        }

        self.level.set(window_level(window, self.level_gain));
        // A mute that landed after the first check must not leave a level behind.
        if self.mute.is_muted() {
            self.level.reset();
            self.windows_muted += 1;
            return false;
        }
        self.queue.push(self.codec.encode(window));
        self.windows_sent += 1;
        trace!(window = self.windows_sent, level = self.level.get(), "Capture window queued");
        true
    }

    pub fn windows_sent(&self) -> u64 {
        self.windows_sent
    }

    pub fn windows_muted(&self) -> u64 {
        self.windows_muted
    }

    /// Pull from `source` until cancelled. The source is dropped (releasing the device)
    /// before this returns. A stream fault or an input that stops on its own is an error.
    pub async fn run(
        mut self,
        mut source: Box<dyn FrameSource>,
        cancel: CancellationToken,
    ) -> VoiceResult<()> {
        info!(window_size = self.window_size, "Capture started");
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                block = source.next_block() => match block {
                    Some(Ok(samples)) => {
                        self.push_samples(&samples);
                    }
                    Some(Err(e)) => break Err(e),
                    None => {
                        break Err(VoiceError::AudioStream(
                            "input stream ended unexpectedly".to_string(),
                        ))
                    }
                },
            }
        };

        drop(source);
        self.level.reset();
        debug!(
            sent = self.windows_sent,
            muted = self.windows_muted,
            "Capture stopped; input released"
        );
        result
    }
}
