//! Gapless, interruption-aware playback of inbound speech.
//!
//! Frames are laid on a virtual output timeline: each one starts at
//! `max(next_available, clock.now())` and pushes `next_available` forward by its
//! duration, so bursts queue back-to-back instead of overlapping. `interrupt()` silences
//! everything and pulls `next_available` back to the clock.
//!
//! The scheduler runs on its own thread (output streams are `!Send` on some platforms)
//! and is fed through a bounded channel; it is the only owner of the timeline.

use crate::codec::{AudioFrame, AudioFrameCodec, EncodedChunk};
use crate::error::{VoiceError, VoiceResult};
use std::collections::VecDeque;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// An output device: a clock plus a sink that starts frames at absolute clock times.
pub trait AudioOutput {
    /// Current output clock time in seconds.
    fn current_time(&self) -> f64;

    /// Start `frame` at output time `start` (never earlier than `current_time()`).
    fn play_at(&mut self, frame: AudioFrame, start: f64) -> VoiceResult<()>;

    /// Silence every started or queued frame immediately.
    fn stop_all(&mut self) -> VoiceResult<()>;
}

impl AudioOutput for Box<dyn AudioOutput> {
    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn play_at(&mut self, frame: AudioFrame, start: f64) -> VoiceResult<()> {
        (**self).play_at(frame, start)
    }

    fn stop_all(&mut self) -> VoiceResult<()> {
        (**self).stop_all()
    }
}

/// A frame's place on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSlot {
    /// Enqueue order within the session.
    pub seq: u64,
    pub start: f64,
    pub duration: f64,
}

impl PlaybackSlot {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Owns the output timeline for one session.
pub struct PlaybackScheduler<O: AudioOutput = Box<dyn AudioOutput>> {
    output: O,
    codec: AudioFrameCodec,
    next_available: f64,
    slots: VecDeque<PlaybackSlot>,
    next_seq: u64,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O, output_sample_rate: u32) -> Self {
        Self {
            output,
            codec: AudioFrameCodec::new(output_sample_rate),
            next_available: 0.0,
            slots: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Decode and schedule a chunk. Decode faults come back as [`VoiceError::Codec`] and
    /// leave the timeline untouched; an empty chunk schedules nothing.
    pub fn enqueue(&mut self, chunk: &EncodedChunk) -> VoiceResult<Option<PlaybackSlot>> {
        let frame = self.codec.decode(chunk)?;
        if frame.is_empty() {
            return Ok(None);
        }
        self.enqueue_frame(frame).map(Some)
    }

    /// Schedule an already-decoded frame.
    pub fn enqueue_frame(&mut self, frame: AudioFrame) -> VoiceResult<PlaybackSlot> {
        let now = self.output.current_time();
        self.retire_finished(now);

        let start = self.next_available.max(now);
        let slot = PlaybackSlot {
            seq: self.next_seq,
            start,
            duration: frame.duration_secs(),
        };
        self.output.play_at(frame, start)?;

        self.next_seq += 1;
        self.next_available = slot.end();
        self.slots.push_back(slot);
        trace!(seq = slot.seq, start = slot.start, duration = slot.duration, "Scheduled frame");
        Ok(slot)
    }

    /// Stop everything scheduled or playing and reset the timeline to the clock.
    /// Returns how many pending slots were cancelled.
    pub fn interrupt(&mut self) -> VoiceResult<usize> {
        let now = self.output.current_time();
        self.retire_finished(now);
        let cancelled = self.slots.len();

        self.output.stop_all()?;
        self.slots.clear();
        self.next_available = now;

        debug!(cancelled, now, "Playback interrupted");
        Ok(cancelled)
    }

    /// Earliest time the next frame can start (before clamping to the clock).
    pub fn next_available_time(&self) -> f64 {
        self.next_available
    }

    /// Slots scheduled and not yet known to have finished.
    pub fn pending_slots(&self) -> Vec<PlaybackSlot> {
        self.slots.iter().copied().collect()
    }

    /// Whether any scheduled audio is still audible or queued.
    pub fn is_playing(&self) -> bool {
        let now = self.output.current_time();
        self.slots.iter().any(|s| s.end() > now)
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    fn retire_finished(&mut self, now: f64) {
        while self.slots.front().map_or(false, |s| s.end() <= now) {
            self.slots.pop_front();
        }
    }
}

/// Work for the playback thread.
#[derive(Debug)]
pub enum PlaybackCommand {
    Enqueue(EncodedChunk),
    Interrupt,
    Shutdown,
}

/// Handle to a running playback thread.
pub struct PlaybackHandle {
    commands: mpsc::Sender<PlaybackCommand>,
    stop: CancellationToken,
}

impl PlaybackHandle {
    /// Open the output on a dedicated thread and run a scheduler there.
    ///
    /// `open_output` runs on the playback thread, so the device it returns never has to be
    /// `Send`. Resolves once the device is open, or with its error. Fatal output faults after
    /// that are reported on `faults`; the thread then exits and releases the device.
    pub async fn spawn<F>(
        open_output: F,
        output_sample_rate: u32,
        capacity: usize,
        faults: mpsc::UnboundedSender<VoiceError>,
    ) -> VoiceResult<Self>
    where
        F: FnOnce() -> VoiceResult<Box<dyn AudioOutput>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<PlaybackCommand>(capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<()>>();
        let stop = CancellationToken::new();
        let stop_thread = stop.clone();

        let thread = thread::Builder::new()
            .name("live-voice-playback".to_string())
            .spawn(move || {
                let output = match open_output() {
                    Ok(output) => {
                        let _ = ready_tx.send(Ok(()));
                        output
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let mut scheduler = PlaybackScheduler::new(output, output_sample_rate);
                info!(output_sample_rate, "Playback thread started");

                while let Some(command) = rx.blocking_recv() {
                    // Shutdown jumps the queue: pending chunks are never scheduled.
                    if stop_thread.is_cancelled() || matches!(command, PlaybackCommand::Shutdown) {
                        if let Err(e) = scheduler.interrupt() {
                            warn!(error = %e, "Failed to silence output on shutdown");
                        }
                        break;
                    }
                    let result = match command {
                        PlaybackCommand::Enqueue(chunk) => match scheduler.enqueue(&chunk) {
                            Err(VoiceError::Codec(e)) => {
                                warn!(error = %e, "Dropping undecodable audio chunk");
                                Ok(())
                            }
                            other => other.map(|_| ()),
                        },
                        PlaybackCommand::Interrupt => scheduler.interrupt().map(|_| ()),
                        PlaybackCommand::Shutdown => Ok(()),
                    };
                    if let Err(e) = result {
                        warn!(error = %e, "Playback fault");
                        let fatal = e.is_fatal();
                        let _ = faults.send(e);
                        if fatal {
                            break;
                        }
                    }
                }

                info!("Playback thread ended; output released");
            })
            .map_err(VoiceError::Io)?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self { commands: tx, stop }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::Playback(
                    "playback thread exited before the output opened".to_string(),
                ))
            }
        }
    }

    /// A sender for enqueue/interrupt commands.
    pub fn commands(&self) -> mpsc::Sender<PlaybackCommand> {
        self.commands.clone()
    }

    /// Silence output and stop the thread. Does not wait for the thread to exit.
    pub fn shutdown(&self) {
        self.stop.cancel();
        // Wakes the thread if it is idle; if the queue is full it sees `stop` on its next command.
        let _ = self.commands.try_send(PlaybackCommand::Shutdown);
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
