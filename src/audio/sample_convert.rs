//! Sample layout and width conversions between the decoder, the resampler
//! kernel and the S16LE byte streams carried by the ring buffers.

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::conv::IntoSample;
use symphonia::core::sample::Sample;

/// Converts any decoded symphonia buffer into interleaved S16 samples.
pub fn interleave_to_s16(buf: &AudioBufferRef<'_>) -> Vec<i16> {
    match buf {
        AudioBufferRef::U8(b) => interleave(b.as_ref()),
        AudioBufferRef::U16(b) => interleave(b.as_ref()),
        AudioBufferRef::U24(b) => interleave(b.as_ref()),
        AudioBufferRef::U32(b) => interleave(b.as_ref()),
        AudioBufferRef::S8(b) => interleave(b.as_ref()),
        AudioBufferRef::S16(b) => interleave(b.as_ref()),
        AudioBufferRef::S24(b) => interleave(b.as_ref()),
        AudioBufferRef::S32(b) => interleave(b.as_ref()),
        AudioBufferRef::F32(b) => interleave(b.as_ref()),
        AudioBufferRef::F64(b) => interleave(b.as_ref()),
    }
}

fn interleave<S>(buf: &AudioBuffer<S>) -> Vec<i16>
where
    S: Sample + IntoSample<i16>,
{
    let channels = buf.spec().channels.count();
    let frames = buf.frames();
    let mut out = vec![0i16; frames * channels];
    for ch in 0..channels {
        let plane = buf.chan(ch);
        for frame in 0..frames {
            out[frame * channels + ch] = plane[frame].into_sample();
        }
    }
    out
}

/// Serializes interleaved S16 samples to little-endian bytes.
pub fn s16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Parses little-endian bytes into S16 samples. A trailing odd byte is
/// ignored; callers keep transfers sample-aligned.
pub fn bytes_to_s16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Splits interleaved S16 samples into per-channel f32 planes using the
/// fixed ±32767/32768 full-scale mapping.
pub fn deinterleave_to_f32(samples: &[i16], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planes = vec![vec![0.0f32; frames]; channels];
    for frame in 0..frames {
        for ch in 0..channels {
            planes[ch][frame] = samples[frame * channels + ch] as f32 / 32768.0;
        }
    }
    planes
}

/// Interleaves f32 planes back to S16 samples, clamping to full scale.
pub fn interleave_f32_to_s16(planes: &[Vec<f32>]) -> Vec<i16> {
    if planes.is_empty() || planes[0].is_empty() {
        return Vec::new();
    }
    let channels = planes.len();
    let frames = planes[0].len();
    let mut out = vec![0i16; frames * channels];
    for frame in 0..frames {
        for ch in 0..channels {
            let s = planes[ch][frame];
            // Same 32768 scale as the forward mapping; only the positive
            // rail needs clamping down to i16::MAX.
            out[frame * channels + ch] = (s * 32768.0).clamp(-32768.0, 32767.0) as i16;
        }
    }
    out
}
