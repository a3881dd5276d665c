use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::audio::error::AudioError;
use crate::audio::ring_buffer::RingBuffer;
use crate::audio::sample_convert;
use crate::audio::speaker::Speaker;
use crate::config::PipelineConfig;

const LOG_TARGET: &str = "mixstream::audio::mixer";

/// Unity gain in Q15.
const UNITY_Q15: u32 = 32768;

/// Deepest supported steady-state attenuation.
const MAX_DUCK_DB: u16 = 50;

/// Bounded wait for the sink to drain its device buffer during teardown.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Q15 linear scale factors for 0..=50 dB attenuation.
/// `round(32768 / 10^(db/20))`, with 0 dB pinned to exact unity.
static DUCK_SCALE_Q15: [u16; MAX_DUCK_DB as usize + 1] = [
    32768, 29205, 26029, 23198, 20675, 18427, 16423, 14637, 13045, 11627, 10362, 9235, 8231, 7336,
    6538, 5827, 5193, 4629, 4125, 3677, 3277, 2920, 2603, 2320, 2068, 1843, 1642, 1464, 1305,
    1163, 1036, 924, 823, 734, 654, 583, 519, 463, 413, 368, 328, 292, 260, 232, 207, 184, 164,
    146, 130, 116, 104,
];

/// The mixer's two input lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerLane {
    Media,
    Announcement,
}

/// Out-of-band control commands for the mixer worker. Delivered on a
/// bounded queue; the worker never shares mutable state with callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerCommand {
    Stop,
    /// Fade the media lane to `target_db` attenuation over roughly
    /// `transition_samples` emitted samples (1 dB per step).
    Duck {
        target_db: u16,
        transition_samples: u32,
    },
    PauseMedia,
    ResumeMedia,
    ClearMedia,
    ClearAnnouncement,
}

/// Combines the media and announcement lanes into the final output stream
/// and drives the speaker sink from a dedicated worker thread. Each lane's
/// input ring is written by exactly one resampler and read only by the
/// mixer worker.
pub struct AudioMixer {
    media_in: Arc<RingBuffer>,
    announcement_in: Arc<RingBuffer>,
    commands: SyncSender<MixerCommand>,
    worker: Option<JoinHandle<()>>,
}

impl AudioMixer {
    /// Starts the speaker and launches the mixer worker. The worker runs
    /// until [`stop`](Self::stop) or drop.
    pub fn start(mut speaker: Box<dyn Speaker>, config: &PipelineConfig) -> Result<Self, AudioError> {
        speaker.start()?;

        let media_in = Arc::new(RingBuffer::new(config.mixer_ring_capacity));
        let announcement_in = Arc::new(RingBuffer::new(config.mixer_ring_capacity));
        let (tx, rx) = sync_channel(config.command_queue_depth);

        let worker_state = MixerWorker {
            speaker,
            media_in: Arc::clone(&media_in),
            announcement_in: Arc::clone(&announcement_in),
            commands: rx,
            pending: Vec::new(),
            media_scratch: vec![0u8; config.mixer_block_size],
            announcement_scratch: vec![0u8; config.mixer_block_size],
            media_paused: false,
            duck: DuckState::new(),
            idle_sleep: config.idle_sleep(),
        };
        let worker = std::thread::Builder::new()
            .name("mixer".to_string())
            .spawn(move || worker_state.run())?;

        info!(target: LOG_TARGET, "Mixer worker started");
        Ok(Self {
            media_in,
            announcement_in,
            commands: tx,
            worker: Some(worker),
        })
    }

    /// The ring a lane's resampler writes into.
    pub fn lane_input(&self, lane: MixerLane) -> Arc<RingBuffer> {
        match lane {
            MixerLane::Media => Arc::clone(&self.media_in),
            MixerLane::Announcement => Arc::clone(&self.announcement_in),
        }
    }

    /// Queues a control command. Lossy under backpressure like every other
    /// bounded queue in the pipeline.
    pub fn send_command(&self, command: MixerCommand) {
        self.controller().send_command(command);
    }

    /// Cloneable handle for queueing commands without holding the mixer.
    pub fn controller(&self) -> MixerController {
        MixerController {
            commands: self.commands.clone(),
        }
    }

    /// Tears down the worker and resets both lane rings so stale audio
    /// never bleeds into the next start. Idempotent.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(MixerCommand::Stop);
            if worker.join().is_err() {
                warn!(target: LOG_TARGET, "Mixer worker panicked during stop");
            }
        }
        self.media_in.reset();
        self.announcement_in.reset();
    }
}

impl Drop for AudioMixer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
pub struct MixerController {
    commands: SyncSender<MixerCommand>,
}

impl MixerController {
    pub fn send_command(&self, command: MixerCommand) {
        if self.commands.try_send(command).is_err() {
            debug!(target: LOG_TARGET, "Command queue full, dropped {:?}", command);
        }
    }
}

/// Ducking bookkeeping for the media lane. The transition walks the dB
/// level one step at a time; the countdown is decremented per sample
/// actually scaled, so sink backpressure stretches wall-clock time but
/// never sample count.
struct DuckState {
    current_db: u16,
    target_db: u16,
    step_len: u32,
    step_remaining: u32,
}

impl DuckState {
    fn new() -> Self {
        Self {
            current_db: 0,
            target_db: 0,
            step_len: 0,
            step_remaining: 0,
        }
    }

    fn set_target(&mut self, target_db: u16, transition_samples: u32) {
        let target = target_db.min(MAX_DUCK_DB);
        self.target_db = target;
        let delta = (target as i32 - self.current_db as i32).unsigned_abs();
        if delta == 0 {
            self.step_len = 0;
            self.step_remaining = 0;
            return;
        }
        self.step_len = (transition_samples / delta).max(1);
        self.step_remaining = self.step_len;
    }
}

/// Applies the current ducking level to a media block, advancing the
/// transition per sample. Steady state is a single table lookup per block.
fn apply_duck(samples: &mut [i16], duck: &mut DuckState) {
    if duck.current_db == duck.target_db {
        if duck.current_db == 0 {
            return;
        }
        let factor = DUCK_SCALE_Q15[duck.current_db as usize] as i32;
        for s in samples.iter_mut() {
            *s = ((*s as i32 * factor) >> 15) as i16;
        }
        return;
    }
    for s in samples.iter_mut() {
        let factor = DUCK_SCALE_Q15[duck.current_db as usize] as i32;
        *s = ((*s as i32 * factor) >> 15) as i16;
        duck.step_remaining = duck.step_remaining.saturating_sub(1);
        if duck.step_remaining == 0 && duck.current_db != duck.target_db {
            if duck.target_db > duck.current_db {
                duck.current_db += 1;
            } else {
                duck.current_db -= 1;
            }
            duck.step_remaining = duck.step_len;
        }
    }
}

/// The single worst-case Q15 factor that keeps `media + announcement`
/// inside the 16-bit range everywhere in the block. Unity when no sample
/// would clip.
fn anti_clip_scale_q15(media: &[i16], announcement: &[i16]) -> u32 {
    let mut scale = UNITY_Q15;
    for (&m, &a) in media.iter().zip(announcement) {
        let sum = m as i32 + a as i32;
        if sum > i16::MAX as i32 {
            // m >= 1 here since a alone cannot exceed the range.
            let allowed = i16::MAX as i32 - a as i32;
            scale = scale.min(((allowed << 15) / m as i32) as u32);
        } else if sum < i16::MIN as i32 {
            let allowed = i16::MIN as i32 - a as i32;
            scale = scale.min(((allowed << 15) / m as i32) as u32);
        }
    }
    scale
}

/// Mixes the announcement block into the media block in place. One shared
/// scale factor for the whole block keeps announcement loudness constant
/// and avoids the distortion of per-sample clamping. Returns the factor
/// that was applied.
fn mix_block(media: &mut [i16], announcement: &[i16]) -> u32 {
    let scale = anti_clip_scale_q15(media, announcement);
    for (m, &a) in media.iter_mut().zip(announcement) {
        let scaled = if scale < UNITY_Q15 {
            (*m as i32 * scale as i32) >> 15
        } else {
            *m as i32
        };
        *m = (scaled + a as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
    scale
}

struct MixerWorker {
    speaker: Box<dyn Speaker>,
    media_in: Arc<RingBuffer>,
    announcement_in: Arc<RingBuffer>,
    commands: Receiver<MixerCommand>,
    pending: Vec<u8>,
    media_scratch: Vec<u8>,
    announcement_scratch: Vec<u8>,
    media_paused: bool,
    duck: DuckState,
    idle_sleep: Duration,
}

impl MixerWorker {
    fn run(mut self) {
        loop {
            loop {
                match self.commands.try_recv() {
                    Ok(MixerCommand::Stop) | Err(TryRecvError::Disconnected) => {
                        return self.finish();
                    }
                    Ok(command) => self.handle(command),
                    Err(TryRecvError::Empty) => break,
                }
            }

            if !self.pending.is_empty() {
                self.push_pending();
                continue;
            }

            if !self.mix_once() {
                // Both lanes empty: park on the command queue instead of
                // busy-spinning.
                match self.commands.recv_timeout(self.idle_sleep) {
                    Ok(MixerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => {
                        return self.finish();
                    }
                    Ok(command) => self.handle(command),
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }

    fn handle(&mut self, command: MixerCommand) {
        info!(target: LOG_TARGET, "Command: {:?}", command);
        match command {
            MixerCommand::Duck {
                target_db,
                transition_samples,
            } => self.duck.set_target(target_db, transition_samples),
            MixerCommand::PauseMedia => self.media_paused = true,
            MixerCommand::ResumeMedia => self.media_paused = false,
            MixerCommand::ClearMedia => self.media_in.reset(),
            MixerCommand::ClearAnnouncement => self.announcement_in.reset(),
            MixerCommand::Stop => {}
        }
    }

    /// Pulls one block from each lane, applies ducking and anti-clip
    /// mixing, and stages the result for the sink. Returns false when
    /// neither lane had data.
    fn mix_once(&mut self) -> bool {
        // Whole frames only, capped by what the device can take.
        let space = self.speaker.available_space() & !3;
        if space == 0 {
            return false;
        }
        let cap = self.media_scratch.len().min(space);

        let media_bytes = if self.media_paused {
            0
        } else {
            self.media_in.read(&mut self.media_scratch[..cap], Duration::ZERO) & !3
        };
        let announcement_bytes = self
            .announcement_in
            .read(&mut self.announcement_scratch[..cap], Duration::ZERO)
            & !3;
        if media_bytes == 0 && announcement_bytes == 0 {
            return false;
        }

        let mut media = sample_convert::bytes_to_s16(&self.media_scratch[..media_bytes]);
        apply_duck(&mut media, &mut self.duck);

        let out = if media_bytes > 0 && announcement_bytes > 0 {
            let announcement =
                sample_convert::bytes_to_s16(&self.announcement_scratch[..announcement_bytes]);
            let overlap = media.len().min(announcement.len());
            let scale = mix_block(&mut media[..overlap], &announcement[..overlap]);
            if scale < UNITY_Q15 {
                trace!(target: LOG_TARGET, "Anti-clip scale {} applied to media block", scale);
            }
            if announcement.len() > overlap {
                media.extend_from_slice(&announcement[overlap..]);
            }
            media
        } else if media_bytes > 0 {
            media
        } else {
            sample_convert::bytes_to_s16(&self.announcement_scratch[..announcement_bytes])
        };

        self.pending = sample_convert::s16_to_bytes(&out);
        true
    }

    fn push_pending(&mut self) {
        match self.speaker.play(&self.pending) {
            Ok(accepted) => {
                self.pending.drain(..accepted);
                trace!(target: LOG_TARGET, "Sink accepted {} bytes, {} pending", accepted, self.pending.len());
                if accepted == 0 {
                    std::thread::sleep(self.idle_sleep);
                }
            }
            Err(e) => {
                warn!(target: LOG_TARGET, "Sink rejected block: {}", e);
                std::thread::sleep(self.idle_sleep);
            }
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.speaker.flush() {
            warn!(target: LOG_TARGET, "Sink flush failed: {}", e);
        }
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.speaker.has_buffered_data() && Instant::now() < deadline {
            std::thread::sleep(self.idle_sleep);
        }
        if let Err(e) = self.speaker.stop() {
            warn!(target: LOG_TARGET, "Sink stop failed: {}", e);
        }
        info!(target: LOG_TARGET, "Mixer worker stopped");
    }
}
