use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::audio::decoder::AudioDecoder;
use crate::audio::error::AudioError;
use crate::audio::mixer::{AudioMixer, MixerCommand, MixerController, MixerLane};
use crate::audio::reader::{self, AudioReader, PipelineSource};
use crate::audio::resampler::AudioResampler;
use crate::audio::ring_buffer::RingBuffer;
use crate::audio::types::{
    AudioStreamInfo, EventPayload, EventSender, FileType, InfoErrorEvent, PipelineState, StageKind,
    StepOutcome,
};
use crate::config::PipelineConfig;

const LOG_TARGET: &str = "mixstream::audio::pipeline";

/// Poll interval while waiting for stage acknowledgement during stop.
const STOP_POLL: Duration = Duration::from_millis(2);

/// One-way control and status flags shared by the orchestrator and the
/// three stage workers. Error flags are one-shot: `get_state` consumes
/// them; everything else is level-triggered.
pub struct EventFlags {
    stop: AtomicBool,
    suspend: AtomicBool,
    /// Session counter, bumped by every `start`. Stages belong to the
    /// epoch they were built under and must exit once it moves on, even
    /// if they never observed the stop edge in between.
    epoch: AtomicU64,
    finished: [AtomicBool; 3],
    failed: [AtomicBool; 3],
}

impl EventFlags {
    pub fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            suspend: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            finished: [
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
            ],
            failed: [
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
            ],
        }
    }

    fn idx(stage: StageKind) -> usize {
        match stage {
            StageKind::Reader => 0,
            StageKind::Decoder => 1,
            StageKind::Resampler => 2,
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspend.store(suspended, Ordering::SeqCst);
    }

    pub fn suspended(&self) -> bool {
        self.suspend.load(Ordering::SeqCst)
    }

    pub fn set_finished(&self, stage: StageKind, finished: bool) {
        self.finished[Self::idx(stage)].store(finished, Ordering::SeqCst);
    }

    pub fn is_finished(&self, stage: StageKind) -> bool {
        self.finished[Self::idx(stage)].load(Ordering::SeqCst)
    }

    pub fn all_finished(&self) -> bool {
        self.finished.iter().all(|f| f.load(Ordering::SeqCst))
    }

    pub fn set_failed(&self, stage: StageKind) {
        self.failed[Self::idx(stage)].store(true, Ordering::SeqCst);
    }

    /// Consumes the stage's error flag, returning whether it was set.
    pub fn take_failed(&self, stage: StageKind) -> bool {
        self.failed[Self::idx(stage)].swap(false, Ordering::SeqCst)
    }

    fn clear_failed(&self) {
        for flag in &self.failed {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Generation-counted start signal the workers park on between tracks. A
/// worker that re-checks after missing a notify still observes the bumped
/// generation, so starts are never lost.
struct StartGate {
    state: Mutex<GateState>,
    condvar: Condvar,
}

struct GateState {
    generation: u64,
    shutdown: bool,
}

impl StartGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                generation: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Blocks until the generation moves past `last_seen`. `None` means the
    /// pipeline is being dropped and the worker should exit.
    fn wait(&self, last_seen: u64) -> Option<u64> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if state.shutdown {
                return None;
            }
            if state.generation != last_seen {
                return Some(state.generation);
            }
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    fn open(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.generation += 1;
        self.condvar.notify_all();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.shutdown = true;
        self.condvar.notify_all();
    }
}

#[derive(Clone)]
struct Session {
    source: PipelineSource,
    target_rate: u32,
}

struct PipelineShared {
    config: PipelineConfig,
    flags: Arc<EventFlags>,
    gate: StartGate,
    session: Mutex<Option<Session>>,
    stream_info: Mutex<Option<AudioStreamInfo>>,
    raw_ring: OnceLock<Arc<RingBuffer>>,
    pcm_ring: OnceLock<Arc<RingBuffer>>,
    out_ring: Arc<RingBuffer>,
}

impl PipelineShared {
    fn raw_ring(&self) -> Arc<RingBuffer> {
        Arc::clone(
            self.raw_ring
                .get_or_init(|| Arc::new(RingBuffer::new(self.config.raw_ring_capacity))),
        )
    }

    fn pcm_ring(&self) -> Arc<RingBuffer> {
        Arc::clone(
            self.pcm_ring
                .get_or_init(|| Arc::new(RingBuffer::new(self.config.pcm_ring_capacity))),
        )
    }

    fn session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Supervises one Reader→Decoder→Resampler lane feeding the shared mixer.
///
/// The three workers are spawned once and parked on the start gate between
/// tracks; `start` only rebuilds the transient stage objects. A failed
/// stage terminates alone and surfaces through `get_state`.
pub struct AudioPipeline {
    shared: Arc<PipelineShared>,
    workers: Vec<JoinHandle<()>>,
    events: Receiver<InfoErrorEvent>,
    mixer: MixerController,
    lane: MixerLane,
}

impl AudioPipeline {
    /// Spawns the lane's three persistent workers, idle until the first
    /// `start`. The lane's output feeds the given mixer input.
    pub fn new(
        lane: MixerLane,
        mixer: &AudioMixer,
        config: PipelineConfig,
    ) -> Result<Self, AudioError> {
        config
            .validate()
            .map_err(|e| AudioError::InitializationError(e.to_string()))?;

        let (tx, rx) = sync_channel(config.event_queue_depth);
        let events = EventSender::new(tx);
        let shared = Arc::new(PipelineShared {
            config,
            flags: Arc::new(EventFlags::new()),
            gate: StartGate::new(),
            session: Mutex::new(None),
            stream_info: Mutex::new(None),
            raw_ring: OnceLock::new(),
            pcm_ring: OnceLock::new(),
            out_ring: mixer.lane_input(lane),
        });

        let label = match lane {
            MixerLane::Media => "media",
            MixerLane::Announcement => "announcement",
        };
        let mut workers = Vec::with_capacity(3);
        for (name, body) in [
            ("reader", reader_worker as fn(Arc<PipelineShared>, EventSender)),
            ("decoder", decoder_worker),
            ("resampler", resampler_worker),
        ] {
            let shared = Arc::clone(&shared);
            let events = events.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", label, name))
                .spawn(move || body(shared, events))?;
            workers.push(handle);
        }

        info!(target: LOG_TARGET, "Pipeline workers spawned for {:?} lane", lane);
        Ok(Self {
            shared,
            workers,
            events: rx,
            mixer: mixer.controller(),
            lane,
        })
    }

    /// Begins playback of `source`, stopping any previous track first.
    /// Source validation failures are returned here; no worker is signalled.
    pub fn start(&mut self, source: PipelineSource, target_rate: u32) -> Result<(), AudioError> {
        if target_rate == 0 {
            return Err(AudioError::UnsupportedFormat(
                "target sample rate must be non-zero".to_string(),
            ));
        }
        if let PipelineSource::Url(url) = &source {
            FileType::from_url(url).ok_or_else(|| {
                AudioError::UnsupportedSource(format!(
                    "cannot infer container type from URL: {}",
                    url
                ))
            })?;
        }

        self.stop()?;

        info!(target: LOG_TARGET, "Starting {:?} lane, target rate {} Hz", self.lane, target_rate);
        let flags = &self.shared.flags;
        // Advanced before the stop flag drops so a straggler from the
        // previous session always observes one of the two exit signals.
        flags.advance_epoch();
        flags.clear_stop();
        flags.clear_failed();
        for stage in [StageKind::Reader, StageKind::Decoder, StageKind::Resampler] {
            flags.set_finished(stage, false);
        }
        *self
            .shared
            .stream_info
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = None;
        *self
            .shared
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Session {
            source,
            target_rate,
        });

        self.shared.gate.open();
        Ok(())
    }

    /// Raises the stop flag and waits, bounded, for all three stages to
    /// acknowledge. A stage that misses the deadline is force-marked failed
    /// on its behalf; the worker self-corrects on its next slice. Both
    /// inter-stage rings are reset and the lane's mixer input cleared so a
    /// stale tail never bleeds into the next track. Idempotent.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        let flags = &self.shared.flags;
        flags.request_stop();

        let deadline = Instant::now() + self.shared.config.stop_timeout();
        while !flags.all_finished() && Instant::now() < deadline {
            std::thread::sleep(STOP_POLL);
        }
        for stage in [StageKind::Reader, StageKind::Decoder, StageKind::Resampler] {
            if !flags.is_finished(stage) {
                warn!(
                    target: LOG_TARGET,
                    "{:?} did not acknowledge stop in time, marking failed",
                    stage
                );
                flags.set_failed(stage);
            }
        }

        if let Some(ring) = self.shared.raw_ring.get() {
            ring.reset();
        }
        if let Some(ring) = self.shared.pcm_ring.get() {
            ring.reset();
        }
        self.mixer.send_command(match self.lane {
            MixerLane::Media => MixerCommand::ClearMedia,
            MixerLane::Announcement => MixerCommand::ClearAnnouncement,
        });
        debug!(target: LOG_TARGET, "{:?} lane stopped", self.lane);
        Ok(())
    }

    /// Drains and logs pending info/error events, then derives the
    /// aggregate state: an unconsumed stage error wins over everything,
    /// all-finished means stopped, anything else is playing.
    pub fn get_state(&self) -> PipelineState {
        while let Ok(event) = self.events.try_recv() {
            log_event(&event);
        }

        let flags = &self.shared.flags;
        if flags.take_failed(StageKind::Reader) {
            return PipelineState::ErrorReading;
        }
        if flags.take_failed(StageKind::Decoder) {
            return PipelineState::ErrorDecoding;
        }
        if flags.take_failed(StageKind::Resampler) {
            return PipelineState::ErrorResampling;
        }
        if flags.all_finished() {
            PipelineState::Stopped
        } else {
            PipelineState::Playing
        }
    }

    /// Pauses all three workers at their next scheduling slice. Buffers
    /// and stage state are preserved.
    pub fn suspend(&self) {
        info!(target: LOG_TARGET, "Suspending {:?} lane workers", self.lane);
        self.shared.flags.set_suspended(true);
    }

    pub fn resume(&self) {
        info!(target: LOG_TARGET, "Resuming {:?} lane workers", self.lane);
        self.shared.flags.set_suspended(false);
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.shared.flags.request_stop();
        self.shared.gate.shutdown();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!(target: LOG_TARGET, "Pipeline worker panicked during shutdown");
            }
        }
    }
}

fn log_event(event: &InfoErrorEvent) {
    match event.payload {
        EventPayload::ReaderError(code) => {
            warn!(target: LOG_TARGET, "{:?} reported transport error, code {}", event.source, code)
        }
        EventPayload::DecoderError(kind) => {
            warn!(target: LOG_TARGET, "{:?} reported decode error: {:?}", event.source, kind)
        }
        EventPayload::ResamplerError => {
            warn!(target: LOG_TARGET, "{:?} reported resampling error", event.source)
        }
        EventPayload::FileTypeDetected(file_type) => {
            info!(target: LOG_TARGET, "Detected container type {:?}", file_type)
        }
        EventPayload::StreamInfo(info) => {
            info!(target: LOG_TARGET, "Negotiated stream format {:?}", info)
        }
        EventPayload::ResampleDecision(info) => {
            info!(target: LOG_TARGET, "Resample decision {:?}", info)
        }
    }
}

/// Runs one constructed stage until it reports a terminal outcome, the
/// stop flag is raised or the session epoch moves past `epoch`. The
/// suspend flag pauses stepping without touching stage state.
fn run_stage<F>(shared: &PipelineShared, stage: StageKind, epoch: u64, mut step: F)
where
    F: FnMut() -> StepOutcome,
{
    loop {
        if shared.flags.stop_requested() {
            debug!(target: LOG_TARGET, "{:?} observed stop", stage);
            return;
        }
        if shared.flags.epoch() != epoch {
            debug!(target: LOG_TARGET, "{:?} superseded by a newer session", stage);
            return;
        }
        if shared.flags.suspended() {
            std::thread::sleep(shared.config.idle_sleep());
            continue;
        }
        match step() {
            StepOutcome::Continue => {}
            StepOutcome::Idle => std::thread::sleep(shared.config.idle_sleep()),
            StepOutcome::Finished => {
                debug!(target: LOG_TARGET, "{:?} finished", stage);
                return;
            }
            StepOutcome::Failed => {
                shared.flags.set_failed(stage);
                return;
            }
        }
    }
}

/// Worker loop shape shared by all three stages: mark finished, park on
/// the gate, clear finished, build the stage object, step it to a terminal
/// state, repeat. The thread itself is never torn down per track.
macro_rules! worker_loop {
    ($shared:ident, $stage:expr, $build_and_run:block) => {
        let mut seen = 0u64;
        loop {
            $shared.flags.set_finished($stage, true);
            seen = match $shared.gate.wait(seen) {
                Some(generation) => generation,
                None => return,
            };
            $shared.flags.set_finished($stage, false);
            $build_and_run
        }
    };
}

fn reader_worker(shared: Arc<PipelineShared>, events: EventSender) {
    worker_loop!(shared, StageKind::Reader, {
        let epoch = shared.flags.epoch();
        let Some(session) = shared.session() else {
            continue;
        };
        let started = AudioReader::start(
            &session.source,
            &shared.config,
            shared.raw_ring(),
            events.clone(),
        );
        let mut stage = match started {
            Ok((stage, _)) => stage,
            Err(e) => {
                warn!(target: LOG_TARGET, "Reader setup failed: {}", e);
                if !shared.flags.stop_requested() {
                    events.send(
                        StageKind::Reader,
                        EventPayload::ReaderError(reader::transport_error_code(&e)),
                    );
                    shared.flags.set_failed(StageKind::Reader);
                }
                continue;
            }
        };
        run_stage(&shared, StageKind::Reader, epoch, || stage.step());
    });
}

fn decoder_worker(shared: Arc<PipelineShared>, events: EventSender) {
    worker_loop!(shared, StageKind::Decoder, {
        let epoch = shared.flags.epoch();
        let Some(session) = shared.session() else {
            continue;
        };
        let file_type = match &session.source {
            PipelineSource::Url(url) => match FileType::from_url(url) {
                Some(file_type) => file_type,
                // Already rejected by the orchestrator; the reader failed too.
                None => continue,
            },
            PipelineSource::MemoryFile(file) => file.file_type,
        };
        let flags = Arc::clone(&shared.flags);
        let started = AudioDecoder::start(
            file_type,
            shared.raw_ring(),
            shared.pcm_ring(),
            flags,
            &shared.config,
            events.clone(),
        );
        let mut stage = match started {
            Ok(stage) => {
                *shared
                    .stream_info
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) = Some(stage.stream_info());
                stage
            }
            Err(e) => {
                warn!(target: LOG_TARGET, "Decoder setup failed: {}", e);
                if !shared.flags.stop_requested() {
                    shared.flags.set_failed(StageKind::Decoder);
                }
                continue;
            }
        };
        run_stage(&shared, StageKind::Decoder, epoch, || stage.step());
    });
}

fn resampler_worker(shared: Arc<PipelineShared>, events: EventSender) {
    worker_loop!(shared, StageKind::Resampler, {
        let epoch = shared.flags.epoch();
        let Some(session) = shared.session() else {
            continue;
        };
        // The stream format is known only after the decoder parses the
        // header; wait for it, bailing out if the decoder never gets there.
        let stream_info = loop {
            if shared.flags.stop_requested() || shared.flags.epoch() != epoch {
                break None;
            }
            let published = shared
                .stream_info
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .as_ref()
                .copied();
            if let Some(info) = published {
                break Some(info);
            }
            if shared.flags.is_finished(StageKind::Decoder) {
                break None;
            }
            std::thread::sleep(shared.config.idle_sleep());
        };
        let Some(stream_info) = stream_info else {
            continue;
        };
        let flags = Arc::clone(&shared.flags);
        let started = AudioResampler::start(
            stream_info,
            session.target_rate,
            &shared.config,
            shared.pcm_ring(),
            Arc::clone(&shared.out_ring),
            flags,
            events.clone(),
        );
        let mut stage = match started {
            Ok(stage) => stage,
            Err(e) => {
                warn!(target: LOG_TARGET, "Resampler setup failed: {}", e);
                if !shared.flags.stop_requested() {
                    shared.flags.set_failed(StageKind::Resampler);
                }
                continue;
            }
        };
        run_stage(&shared, StageKind::Resampler, epoch, || stage.step());
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_shared() -> PipelineShared {
        PipelineShared {
            config: PipelineConfig::default(),
            flags: Arc::new(EventFlags::new()),
            gate: StartGate::new(),
            session: Mutex::new(None),
            stream_info: Mutex::new(None),
            raw_ring: OnceLock::new(),
            pcm_ring: OnceLock::new(),
            out_ring: Arc::new(RingBuffer::new(4096)),
        }
    }

    #[test]
    fn stage_exits_when_session_moves_on() {
        // A straggler that missed the stop edge entirely must still exit
        // once a newer session has begun, without stepping and without
        // marking itself failed.
        let shared = bare_shared();
        let epoch = shared.flags.epoch();
        shared.flags.advance_epoch();

        let mut steps = 0;
        run_stage(&shared, StageKind::Reader, epoch, || {
            steps += 1;
            StepOutcome::Continue
        });
        assert_eq!(steps, 0);
        assert!(!shared.flags.take_failed(StageKind::Reader));
    }

    #[test]
    fn stage_runs_while_epoch_is_current() {
        let shared = bare_shared();
        let epoch = shared.flags.epoch();

        let mut steps = 0;
        run_stage(&shared, StageKind::Decoder, epoch, || {
            steps += 1;
            if steps < 3 {
                StepOutcome::Continue
            } else {
                StepOutcome::Finished
            }
        });
        assert_eq!(steps, 3);
    }

    #[test]
    fn stage_exits_on_stop_without_failing() {
        let shared = bare_shared();
        shared.flags.request_stop();

        let mut steps = 0;
        run_stage(&shared, StageKind::Resampler, shared.flags.epoch(), || {
            steps += 1;
            StepOutcome::Continue
        });
        assert_eq!(steps, 0);
        assert!(!shared.flags.take_failed(StageKind::Resampler));
    }
}
