//! Cross-stage tests running the full reader→decoder→resampler→mixer chain
//! against in-memory WAV sources and a capture sink.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::audio::mixer::{AudioMixer, MixerLane};
use crate::audio::reader::PipelineSource;
use crate::audio::sample_convert;
use crate::audio::speaker::CaptureSpeaker;
use crate::audio::types::{FileType, MediaFile, PipelineState};
use crate::audio::AudioPipeline;
use crate::config::PipelineConfig;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Encodes `samples` as a 16-bit WAV in memory.
fn wav_bytes(sample_rate: u32, channels: u16, samples: &[i16]) -> Bytes {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
    for &s in samples {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
    Bytes::from(cursor.into_inner())
}

fn wav_bytes_8bit(sample_rate: u32, samples: &[i8]) -> Bytes {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 8,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
    for &s in samples {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
    Bytes::from(cursor.into_inner())
}

fn setup() -> (AudioMixer, AudioPipeline, Arc<Mutex<Vec<u8>>>) {
    init_logging();
    let config = PipelineConfig::default();
    let (speaker, captured) = CaptureSpeaker::new();
    let mixer = AudioMixer::start(Box::new(speaker), &config).unwrap();
    let pipeline = AudioPipeline::new(MixerLane::Media, &mixer, config).unwrap();
    (mixer, pipeline, captured)
}

/// Polls `get_state` until it leaves `Playing` or the deadline passes.
fn wait_for_terminal(pipeline: &AudioPipeline, timeout: Duration) -> PipelineState {
    let deadline = Instant::now() + timeout;
    loop {
        let state = pipeline.get_state();
        if state != PipelineState::Playing || Instant::now() >= deadline {
            return state;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Waits until the captured byte count stops growing.
fn wait_for_settled(captured: &Arc<Mutex<Vec<u8>>>, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut last = usize::MAX;
    loop {
        let len = captured.lock().unwrap().len();
        if (len == last && len > 0) || Instant::now() >= deadline {
            return captured.lock().unwrap().clone();
        }
        last = len;
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn mono_wav_at_target_rate_plays_out_duplicated() {
    let (mut mixer, mut pipeline, captured) = setup();

    let samples: Vec<i16> = (0..8820).map(|i| ((i * 13) % 12000) as i16 - 6000).collect();
    let wav = wav_bytes(44100, 1, &samples);
    let source = PipelineSource::MemoryFile(MediaFile::new(wav, FileType::Wav));

    pipeline.start(source, 44100).unwrap();
    assert_eq!(
        wait_for_terminal(&pipeline, Duration::from_secs(10)),
        PipelineState::Stopped
    );

    let out = wait_for_settled(&captured, Duration::from_secs(5));
    mixer.stop();

    // Mono widened to stereo: exactly double the PCM byte length, each
    // frame a duplicated source sample.
    assert_eq!(out.len(), samples.len() * 4);
    let stereo = sample_convert::bytes_to_s16(&out);
    for (i, pair) in stereo.chunks_exact(2).enumerate() {
        assert_eq!(pair[0], samples[i]);
        assert_eq!(pair[1], samples[i]);
    }
}

#[test]
fn mono_wav_upsamples_to_target_rate() {
    let (mut mixer, mut pipeline, captured) = setup();

    // 0.25 s at 16 kHz, target 48 kHz.
    let samples: Vec<i16> = (0..4000)
        .map(|i| ((i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16000.0).sin() * 12000.0) as i16)
        .collect();
    let wav = wav_bytes(16000, 1, &samples);
    let source = PipelineSource::MemoryFile(MediaFile::new(wav, FileType::Wav));

    pipeline.start(source, 48000).unwrap();
    assert_eq!(
        wait_for_terminal(&pipeline, Duration::from_secs(10)),
        PipelineState::Stopped
    );

    let out = wait_for_settled(&captured, Duration::from_secs(5));
    mixer.stop();

    let out_frames = out.len() / 4;
    let expected = samples.len() * 3;
    assert!(
        (out_frames as i64 - expected as i64).unsigned_abs() < 2000,
        "got {} frames, expected about {}",
        out_frames,
        expected
    );
}

#[test]
fn flac_stream_plays_out_bit_exact() {
    let (mut mixer, mut pipeline, captured) = setup();

    // 48 kHz stereo 16-bit FLAC fixture, 4800 frames, right channel the
    // negation of the left. At a 48 kHz target the lane neither resamples
    // nor widens, so the sink receives the decoded PCM verbatim.
    let flac = Bytes::from_static(include_bytes!("testdata/pcm-48k-stereo.flac"));
    let source = PipelineSource::MemoryFile(MediaFile::new(flac, FileType::Flac));

    pipeline.start(source, 48000).unwrap();
    assert_eq!(
        wait_for_terminal(&pipeline, Duration::from_secs(10)),
        PipelineState::Stopped
    );

    let out = wait_for_settled(&captured, Duration::from_secs(5));
    mixer.stop();

    assert_eq!(out.len(), 4800 * 4);
    let stereo = sample_convert::bytes_to_s16(&out);
    for (i, frame) in stereo.chunks_exact(2).enumerate() {
        let expected = ((i as i32 * 37) % 20000 - 10000) as i16;
        assert_eq!(frame[0], expected, "left sample {}", i);
        assert_eq!(frame[1], -expected, "right sample {}", i);
    }
}

#[test]
fn eight_bit_wav_fails_decoding_without_playing_audio() {
    let (mut mixer, mut pipeline, captured) = setup();

    let samples: Vec<i8> = (0..2000).map(|i| (i % 100) as i8).collect();
    let wav = wav_bytes_8bit(44100, &samples);
    let source = PipelineSource::MemoryFile(MediaFile::new(wav, FileType::Wav));

    pipeline.start(source, 44100).unwrap();
    assert_eq!(
        wait_for_terminal(&pipeline, Duration::from_secs(10)),
        PipelineState::ErrorDecoding
    );
    // The error flag is one-shot; once consumed the lane settles to
    // stopped with all three workers parked.
    assert_eq!(
        wait_for_terminal(&pipeline, Duration::from_secs(5)),
        PipelineState::Stopped
    );

    std::thread::sleep(Duration::from_millis(50));
    mixer.stop();
    assert!(captured.lock().unwrap().is_empty());
}

#[test]
fn corrupt_stream_fails_and_all_stages_terminate() {
    let (mut mixer, mut pipeline, _captured) = setup();

    // No valid sync word anywhere in the payload. The payload fits the
    // raw ring, so the reader drains it and finishes on its own even
    // after the decoder has bailed out.
    let garbage = Bytes::from(vec![0x55u8; 16 * 1024]);
    let source = PipelineSource::MemoryFile(MediaFile::new(garbage, FileType::Mp3));

    pipeline.start(source, 44100).unwrap();
    assert_eq!(
        wait_for_terminal(&pipeline, Duration::from_secs(10)),
        PipelineState::ErrorDecoding
    );
    // Reader and resampler reach their own terminal states; nothing hangs.
    assert_eq!(
        wait_for_terminal(&pipeline, Duration::from_secs(5)),
        PipelineState::Stopped
    );
    mixer.stop();
}

#[test]
fn oversized_corrupt_stream_recovers_via_stop() {
    let (mut mixer, mut pipeline, _captured) = setup();

    // Larger than the raw ring: once the decoder bails out, nothing
    // drains the ring and the reader sits on a full ring indefinitely.
    // The error still surfaces, and `stop` is the documented way to
    // return the lane to a parked state.
    let garbage = Bytes::from(vec![0x55u8; 256 * 1024]);
    let source = PipelineSource::MemoryFile(MediaFile::new(garbage, FileType::Mp3));

    pipeline.start(source, 44100).unwrap();
    assert_eq!(
        wait_for_terminal(&pipeline, Duration::from_secs(10)),
        PipelineState::ErrorDecoding
    );

    pipeline.stop().unwrap();
    assert_eq!(pipeline.get_state(), PipelineState::Stopped);
    mixer.stop();
}

#[test]
fn stop_is_idempotent_and_bounded() {
    let (mut mixer, mut pipeline, _captured) = setup();

    // Stopping a never-started pipeline succeeds.
    pipeline.stop().unwrap();

    let samples: Vec<i16> = vec![1000; 44100];
    let wav = wav_bytes(44100, 1, &samples);
    let source = PipelineSource::MemoryFile(MediaFile::new(wav, FileType::Wav));
    pipeline.start(source, 44100).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    pipeline.stop().unwrap();
    assert!(start.elapsed() < Duration::from_secs(3));
    pipeline.stop().unwrap();
    assert_eq!(pipeline.get_state(), PipelineState::Stopped);
    mixer.stop();
}

#[test]
fn unsupported_url_extension_is_rejected_synchronously() {
    let (mut mixer, mut pipeline, _captured) = setup();
    let result = pipeline.start(
        PipelineSource::Url("http://host/stream.ogg".to_string()),
        44100,
    );
    assert!(result.is_err());
    // No worker was signalled; the lane parks without producing anything.
    assert_eq!(
        wait_for_terminal(&pipeline, Duration::from_secs(2)),
        PipelineState::Stopped
    );
    mixer.stop();
}

#[test]
fn restart_plays_second_track_cleanly() {
    let (mut mixer, mut pipeline, captured) = setup();

    let first: Vec<i16> = vec![2000; 4410];
    let wav = wav_bytes(44100, 1, &first);
    pipeline
        .start(
            PipelineSource::MemoryFile(MediaFile::new(wav, FileType::Wav)),
            44100,
        )
        .unwrap();
    assert_eq!(
        wait_for_terminal(&pipeline, Duration::from_secs(10)),
        PipelineState::Stopped
    );
    wait_for_settled(&captured, Duration::from_secs(5));
    captured.lock().unwrap().clear();

    let second: Vec<i16> = vec![-3000; 4410];
    let wav = wav_bytes(44100, 1, &second);
    pipeline
        .start(
            PipelineSource::MemoryFile(MediaFile::new(wav, FileType::Wav)),
            44100,
        )
        .unwrap();
    assert_eq!(
        wait_for_terminal(&pipeline, Duration::from_secs(10)),
        PipelineState::Stopped
    );
    let out = wait_for_settled(&captured, Duration::from_secs(5));
    mixer.stop();

    assert_eq!(out.len(), second.len() * 4);
    let stereo = sample_convert::bytes_to_s16(&out);
    assert!(stereo.iter().all(|&s| s == -3000));
}
