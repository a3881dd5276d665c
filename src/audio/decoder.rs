use std::io;
use std::sync::Arc;
use std::time::Duration;

use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info, trace, warn};

use crate::audio::error::AudioError;
use crate::audio::pipeline::EventFlags;
use crate::audio::ring_buffer::RingBuffer;
use crate::audio::sample_convert;
use crate::audio::types::{
    AudioStreamInfo, DecodeErrorKind, EventPayload, EventSender, FileType, StageKind, StepOutcome,
};
use crate::config::PipelineConfig;

const LOG_TARGET: &str = "mixstream::audio::decoder";

/// Consecutive recoverable decode failures before the stream is declared
/// unrecoverable.
const FAILURE_LIMIT: u32 = 10;

/// Wait slice for encoded bytes; the blocking source re-checks the stop and
/// reader-finished flags between slices.
const SOURCE_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Consumes encoded bytes from the raw ring and produces interleaved S16LE
/// PCM into the decoded ring. Container and frame math are symphonia's; this
/// stage owns framing state, the negotiated stream format and the failure
/// budget.
pub struct AudioDecoder {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    stream_info: AudioStreamInfo,
    out: Arc<RingBuffer>,
    pending: Vec<u8>,
    io_timeout: Duration,
    consecutive_failures: u32,
    events: EventSender,
}

impl AudioDecoder {
    /// Probes the container header (blocking on the raw ring until enough
    /// bytes arrive or the stream ends), negotiates the stream format and
    /// publishes it. Header-parse and format-contract violations are decode
    /// errors with distinct kinds.
    pub fn start(
        file_type: FileType,
        raw: Arc<RingBuffer>,
        out: Arc<RingBuffer>,
        flags: Arc<EventFlags>,
        config: &PipelineConfig,
        events: EventSender,
    ) -> Result<Self, AudioError> {
        debug!(target: LOG_TARGET, "Probing container ({:?})", file_type);

        let source = RingMediaSource::new(raw, flags);
        let mss = MediaSourceStream::new(Box::new(source), Default::default());
        let mut hint = Hint::new();
        hint.with_extension(file_type.extension());

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                warn!(target: LOG_TARGET, "Container probe failed: {}", e);
                events.send(
                    StageKind::Decoder,
                    EventPayload::DecoderError(DecodeErrorKind::HeaderParse),
                );
                AudioError::DecodeError(DecodeErrorKind::HeaderParse)
            })?;
        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| {
                events.send(
                    StageKind::Decoder,
                    EventPayload::DecoderError(DecodeErrorKind::HeaderParse),
                );
                AudioError::DecodeError(DecodeErrorKind::HeaderParse)
            })?
            .clone();

        let sample_rate = track.codec_params.sample_rate.ok_or_else(|| {
            events.send(
                StageKind::Decoder,
                EventPayload::DecoderError(DecodeErrorKind::HeaderParse),
            );
            AudioError::DecodeError(DecodeErrorKind::HeaderParse)
        })?;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(0);
        // Codecs that do not declare a bit depth (e.g. MP3) decode to the
        // pipeline's 16-bit format anyway.
        let bits_per_sample = track.codec_params.bits_per_sample.unwrap_or(16) as u16;

        let stream_info = AudioStreamInfo {
            channels,
            bits_per_sample,
            sample_rate,
        };
        info!(target: LOG_TARGET, "Negotiated stream format: {:?}", stream_info);

        if bits_per_sample != 16 {
            events.send(
                StageKind::Decoder,
                EventPayload::DecoderError(DecodeErrorKind::IncompatibleBitDepth),
            );
            return Err(AudioError::DecodeError(DecodeErrorKind::IncompatibleBitDepth));
        }
        if channels == 0 || channels > 2 {
            events.send(
                StageKind::Decoder,
                EventPayload::DecoderError(DecodeErrorKind::IncompatibleChannels),
            );
            return Err(AudioError::DecodeError(DecodeErrorKind::IncompatibleChannels));
        }

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| {
                warn!(target: LOG_TARGET, "No decoder for track: {}", e);
                events.send(
                    StageKind::Decoder,
                    EventPayload::DecoderError(DecodeErrorKind::HeaderParse),
                );
                AudioError::DecodeError(DecodeErrorKind::HeaderParse)
            })?;

        events.send(StageKind::Decoder, EventPayload::StreamInfo(stream_info));

        Ok(Self {
            format_reader,
            decoder,
            track_id: track.id,
            stream_info,
            out,
            pending: Vec::new(),
            io_timeout: config.io_timeout(),
            consecutive_failures: 0,
            events,
        })
    }

    pub fn stream_info(&self) -> AudioStreamInfo {
        self.stream_info
    }

    /// One scheduling slice: flush pending PCM first (partial writes are
    /// retried on later calls; the caller is never blocked indefinitely),
    /// otherwise decode the next packet.
    pub fn step(&mut self) -> StepOutcome {
        if !self.pending.is_empty() {
            let written = self
                .out
                .write_without_replacement(&self.pending, self.io_timeout);
            self.pending.drain(..written);
            trace!(target: LOG_TARGET, "Flushed {} PCM bytes, {} pending", written, self.pending.len());
            if !self.pending.is_empty() {
                // Downstream full; let the worker observe the stop flag.
                return if written == 0 {
                    StepOutcome::Idle
                } else {
                    StepOutcome::Continue
                };
            }
            return StepOutcome::Continue;
        }

        let packet = match self.format_reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                // The ring source reports EOF only on stop or once the
                // reader has finished and the ring is drained.
                info!(target: LOG_TARGET, "End of encoded stream");
                return StepOutcome::Finished;
            }
            Err(SymphoniaError::ResetRequired) => {
                warn!(target: LOG_TARGET, "Stream discontinuity (reset required)");
                return self.fail(DecodeErrorKind::CorruptStream);
            }
            Err(e) => {
                warn!(target: LOG_TARGET, "Error reading next packet: {}", e);
                return self.fail(DecodeErrorKind::CorruptStream);
            }
        };

        if packet.track_id() != self.track_id {
            trace!(target: LOG_TARGET, "Skipping packet for track {}", packet.track_id());
            return StepOutcome::Continue;
        }

        match self.decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = decoded.spec();
                if spec.rate != self.stream_info.sample_rate
                    || spec.channels.count() != self.stream_info.channels as usize
                {
                    warn!(
                        target: LOG_TARGET,
                        "Stream format changed mid-stream (rate {}, {} channels)",
                        spec.rate,
                        spec.channels.count()
                    );
                    return self.fail(DecodeErrorKind::CorruptStream);
                }
                self.consecutive_failures = 0;
                let samples = sample_convert::interleave_to_s16(&decoded);
                self.pending = sample_convert::s16_to_bytes(&samples);
                StepOutcome::Continue
            }
            Err(SymphoniaError::DecodeError(e)) => {
                // Recoverable: the input cursor has advanced past the bad
                // frame, so more bytes may resynchronize the stream.
                self.consecutive_failures += 1;
                warn!(
                    target: LOG_TARGET,
                    "Recoverable decode error ({} consecutive): {}",
                    self.consecutive_failures,
                    e
                );
                if self.consecutive_failures >= FAILURE_LIMIT {
                    return self.fail(DecodeErrorKind::CorruptStream);
                }
                StepOutcome::Continue
            }
            Err(e) => {
                warn!(target: LOG_TARGET, "Unexpected decoder error: {}", e);
                self.fail(DecodeErrorKind::CorruptStream)
            }
        }
    }

    fn fail(&self, kind: DecodeErrorKind) -> StepOutcome {
        self.events
            .send(StageKind::Decoder, EventPayload::DecoderError(kind));
        StepOutcome::Failed
    }
}

/// Blocking byte source feeding symphonia from the raw ring.
///
/// `read` waits in short slices for at least one byte, returning EOF (0)
/// once the stop flag is raised, the session epoch has moved past the one
/// this source was built under, or the reader stage has finished and the
/// ring is drained. "Header not yet parseable" therefore retries inside the
/// read rather than surfacing as a transient probe failure.
struct RingMediaSource {
    ring: Arc<RingBuffer>,
    flags: Arc<EventFlags>,
    epoch: u64,
}

impl RingMediaSource {
    fn new(ring: Arc<RingBuffer>, flags: Arc<EventFlags>) -> Self {
        let epoch = flags.epoch();
        Self { ring, flags, epoch }
    }
}

impl io::Read for RingMediaSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            // A superseded source must not consume bytes that now belong
            // to the next session.
            if self.flags.epoch() != self.epoch {
                return Ok(0);
            }
            if self.flags.stop_requested() {
                return Ok(0);
            }
            if self.flags.is_finished(StageKind::Reader) && self.ring.available() == 0 {
                return Ok(0);
            }
            let n = self.ring.read(buf, SOURCE_WAIT_SLICE);
            if n > 0 {
                return Ok(n);
            }
        }
    }
}

impl io::Seek for RingMediaSource {
    fn seek(&mut self, _pos: io::SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "ring-backed stream is not seekable",
        ))
    }
}

impl MediaSource for RingMediaSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::mpsc::sync_channel;

    fn harness() -> (Arc<RingBuffer>, Arc<RingBuffer>, Arc<EventFlags>, EventSender) {
        let (tx, _rx) = sync_channel(8);
        (
            Arc::new(RingBuffer::new(64 * 1024)),
            Arc::new(RingBuffer::new(128 * 1024)),
            Arc::new(EventFlags::new()),
            EventSender::new(tx),
        )
    }

    #[test]
    fn ring_source_reads_available_bytes() {
        let (raw, _out, flags, _events) = harness();
        raw.write_without_replacement(b"abcd", Duration::from_secs(1));
        let mut source = RingMediaSource::new(Arc::clone(&raw), flags);
        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
    }

    #[test]
    fn superseded_ring_source_reports_eof() {
        // Bytes written after a new session begins belong to that session;
        // a source built under the old one must see end-of-stream instead.
        let (raw, _out, flags, _events) = harness();
        let mut source = RingMediaSource::new(Arc::clone(&raw), Arc::clone(&flags));
        flags.advance_epoch();
        raw.write_without_replacement(b"next-track-bytes", Duration::from_secs(1));

        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        assert_eq!(raw.available(), 16);
    }

    #[test]
    fn stopped_ring_source_reports_eof() {
        let (raw, _out, flags, _events) = harness();
        let mut source = RingMediaSource::new(Arc::clone(&raw), Arc::clone(&flags));
        flags.request_stop();
        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn flac_stream_decodes_to_expected_pcm() {
        // 48 kHz stereo 16-bit FLAC, 4800 frames, right channel the exact
        // negation of the left.
        let encoded = include_bytes!("testdata/pcm-48k-stereo.flac");
        let (raw, out, flags, events) = harness();
        raw.write_without_replacement(encoded, Duration::from_secs(1));
        flags.set_finished(StageKind::Reader, true);

        let config = PipelineConfig::default();
        let mut decoder = AudioDecoder::start(
            FileType::Flac,
            Arc::clone(&raw),
            Arc::clone(&out),
            Arc::clone(&flags),
            &config,
            events,
        )
        .unwrap();

        assert_eq!(
            decoder.stream_info(),
            AudioStreamInfo {
                channels: 2,
                bits_per_sample: 16,
                sample_rate: 48000,
            }
        );

        let mut finished = false;
        for _ in 0..10_000 {
            match decoder.step() {
                StepOutcome::Finished => {
                    finished = true;
                    break;
                }
                StepOutcome::Failed => panic!("decoder failed"),
                _ => {}
            }
        }
        assert!(finished, "decoder did not reach end of stream");

        let mut pcm = vec![0u8; out.available()];
        out.read(&mut pcm, Duration::from_millis(10));
        assert_eq!(pcm.len(), 4800 * 2 * 2);
        let samples = sample_convert::bytes_to_s16(&pcm);
        for (i, frame) in samples.chunks_exact(2).enumerate() {
            let expected = ((i as i32 * 37) % 20000 - 10000) as i16;
            assert_eq!(frame[0], expected, "left sample {}", i);
            assert_eq!(frame[1], -expected, "right sample {}", i);
        }
    }
}
