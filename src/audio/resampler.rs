use std::sync::Arc;
use std::time::Duration;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::{info, trace, warn};

use crate::audio::error::AudioError;
use crate::audio::pipeline::EventFlags;
use crate::audio::ring_buffer::RingBuffer;
use crate::audio::sample_convert;
use crate::audio::types::{
    AudioStreamInfo, EventPayload, EventSender, ResampleInfo, StageKind, StepOutcome,
};
use crate::config::PipelineConfig;

const LOG_TARGET: &str = "mixstream::audio::resampler";

/// Frames per kernel invocation.
const KERNEL_CHUNK_FRAMES: usize = 512;

/// Bytes moved per slice on the straight-copy and mono-duplication paths.
const COPY_BLOCK_BYTES: usize = 4096;

/// Anti-alias cutoff relative to the lower of the two Nyquist frequencies.
/// rubato scales this by the rate ratio itself, so a single slightly-tight
/// constant gives the right passband for every conversion.
const SINC_CUTOFF: f32 = 0.95;

/// Normalizes decoded PCM to the pipeline's output format: target sample
/// rate and stereo. Reads S16LE from the decoded ring and writes S16LE
/// stereo directly into one of the mixer's input rings.
pub struct AudioResampler {
    info: ResampleInfo,
    channels: usize,
    kernel: Option<SincFixedIn<f32>>,
    input: Arc<RingBuffer>,
    out: Arc<RingBuffer>,
    in_scratch: Vec<i16>,
    pending: Vec<u8>,
    out_scratch_cap: usize,
    io_timeout: Duration,
    kernel_flushed: bool,
    flags: Arc<EventFlags>,
}

impl AudioResampler {
    /// Derives the conversion decisions for this stream and, when rate
    /// conversion is needed, constructs the sinc kernel. Channel counts
    /// beyond stereo are a setup failure.
    pub fn start(
        stream_info: AudioStreamInfo,
        target_rate: u32,
        config: &PipelineConfig,
        input: Arc<RingBuffer>,
        out: Arc<RingBuffer>,
        flags: Arc<EventFlags>,
        events: EventSender,
    ) -> Result<Self, AudioError> {
        let channels = stream_info.channels as usize;
        if channels == 0 || channels > 2 {
            events.send(StageKind::Resampler, EventPayload::ResamplerError);
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels not supported",
                channels
            )));
        }

        let info = ResampleInfo {
            resample: stream_info.sample_rate != target_rate,
            mono_to_stereo: channels != 2,
        };
        info!(
            target: LOG_TARGET,
            "Stream {} Hz/{}ch, target {} Hz: {:?}",
            stream_info.sample_rate,
            channels,
            target_rate,
            info
        );

        let kernel = if info.resample {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: SINC_CUTOFF,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let kernel = SincFixedIn::<f32>::new(
                target_rate as f64 / stream_info.sample_rate as f64,
                2.0,
                params,
                KERNEL_CHUNK_FRAMES,
                channels,
            )
            .map_err(|e| {
                warn!(target: LOG_TARGET, "Kernel construction failed: {}", e);
                events.send(StageKind::Resampler, EventPayload::ResamplerError);
                AudioError::from(e)
            })?;
            Some(kernel)
        } else {
            None
        };

        // Worst case for one slice: a full kernel output block expanded to
        // stereo, or a copy block doubled by mono duplication.
        let out_scratch_cap = match &kernel {
            Some(k) => k.output_frames_max() * 2 * 2,
            None => COPY_BLOCK_BYTES * 2,
        };

        events.send(StageKind::Resampler, EventPayload::ResampleDecision(info));

        Ok(Self {
            info,
            channels,
            kernel,
            input,
            out,
            in_scratch: Vec::new(),
            pending: Vec::new(),
            out_scratch_cap,
            io_timeout: config.io_timeout(),
            kernel_flushed: false,
            flags,
        })
    }

    pub fn resample_info(&self) -> ResampleInfo {
        self.info
    }

    /// One scheduling slice. Finishes only once the upstream stage is done
    /// and the input ring, internal input and internal output are all
    /// drained (kernel flushed).
    pub fn step(&mut self) -> StepOutcome {
        if !self.pending.is_empty() {
            let written = self
                .out
                .write_without_replacement(&self.pending, self.io_timeout);
            self.pending.drain(..written);
            trace!(target: LOG_TARGET, "Pushed {} bytes, {} pending", written, self.pending.len());
            return if written == 0 {
                StepOutcome::Idle
            } else {
                StepOutcome::Continue
            };
        }

        if self.kernel.is_some() {
            self.step_kernel()
        } else {
            self.step_copy()
        }
    }

    /// Fast path: straight block copy, with in-place mono duplication when
    /// the channel layout needs widening.
    fn step_copy(&mut self) -> StepOutcome {
        let mut buf = [0u8; COPY_BLOCK_BYTES];
        // Keep reads sample-group aligned so duplication never splits a
        // sample across slices.
        let n = self.input.read(&mut buf, self.io_timeout) & !1;
        if n == 0 {
            return if self.upstream_drained() {
                info!(target: LOG_TARGET, "Copy path drained, finishing");
                StepOutcome::Finished
            } else {
                StepOutcome::Idle
            };
        }
        if self.info.mono_to_stereo {
            let mut samples = sample_convert::bytes_to_s16(&buf[..n]);
            duplicate_mono_in_place(&mut samples);
            self.pending = sample_convert::s16_to_bytes(&samples);
        } else {
            self.pending = buf[..n].to_vec();
        }
        debug_assert!(self.pending.len() <= self.out_scratch_cap);
        StepOutcome::Continue
    }

    /// Rate-conversion path: accumulate one kernel chunk of integer PCM,
    /// convert to float planes, run the kernel, convert back and widen.
    fn step_kernel(&mut self) -> StepOutcome {
        let Some(kernel) = self.kernel.as_mut() else {
            return StepOutcome::Finished;
        };
        let needed_samples = kernel.input_frames_next() * self.channels;

        if self.in_scratch.len() < needed_samples {
            let missing_bytes = (needed_samples - self.in_scratch.len()) * 2;
            let mut buf = vec![0u8; missing_bytes];
            let n = self.input.read(&mut buf, self.io_timeout) & !1;
            if n > 0 {
                self.in_scratch
                    .extend_from_slice(&sample_convert::bytes_to_s16(&buf[..n]));
            }
        }

        if self.in_scratch.len() >= needed_samples {
            let take: Vec<i16> = self.in_scratch.drain(..needed_samples).collect();
            let planes = sample_convert::deinterleave_to_f32(&take, self.channels);
            let output = match kernel.process(&planes, None) {
                Ok(output) => output,
                Err(e) => {
                    warn!(target: LOG_TARGET, "Kernel process failed: {}", e);
                    return StepOutcome::Failed;
                }
            };
            self.emit(&output);
            return StepOutcome::Continue;
        }

        // Checked on the fields directly so the active kernel borrow can
        // carry into the drain branches below.
        if !(self.flags.is_finished(StageKind::Decoder) && self.input.available() == 0) {
            return StepOutcome::Idle;
        }

        // Upstream is done: push the partial tail through, then flush the
        // kernel's internal delay line exactly once.
        if !self.in_scratch.is_empty() {
            let tail: Vec<i16> = std::mem::take(&mut self.in_scratch);
            let planes = sample_convert::deinterleave_to_f32(&tail, self.channels);
            let output = match kernel.process_partial(Some(&planes), None) {
                Ok(output) => output,
                Err(e) => {
                    warn!(target: LOG_TARGET, "Kernel tail process failed: {}", e);
                    return StepOutcome::Failed;
                }
            };
            self.emit(&output);
            return StepOutcome::Continue;
        }
        if !self.kernel_flushed {
            self.kernel_flushed = true;
            let output = match kernel.process_partial::<Vec<f32>>(None, None) {
                Ok(output) => output,
                Err(e) => {
                    warn!(target: LOG_TARGET, "Kernel flush failed: {}", e);
                    return StepOutcome::Failed;
                }
            };
            self.emit(&output);
            return StepOutcome::Continue;
        }

        info!(target: LOG_TARGET, "Kernel path drained, finishing");
        StepOutcome::Finished
    }

    fn emit(&mut self, planes: &[Vec<f32>]) {
        let mut samples = sample_convert::interleave_f32_to_s16(planes);
        if samples.is_empty() {
            return;
        }
        if self.info.mono_to_stereo {
            duplicate_mono_in_place(&mut samples);
        }
        debug_assert!(
            samples.len() * 2 <= self.out_scratch_cap,
            "resampler output exceeded scratch capacity"
        );
        self.pending = sample_convert::s16_to_bytes(&samples);
    }

    fn upstream_drained(&self) -> bool {
        self.flags.is_finished(StageKind::Decoder) && self.input.available() == 0
    }
}

/// Widens a mono block to interleaved stereo in place. Iterates from the
/// end backward so unread mono samples are never overwritten before they
/// are duplicated.
fn duplicate_mono_in_place(samples: &mut Vec<i16>) {
    let n = samples.len();
    samples.resize(n * 2, 0);
    for i in (0..n).rev() {
        let s = samples[i];
        samples[2 * i] = s;
        samples[2 * i + 1] = s;
    }
}
