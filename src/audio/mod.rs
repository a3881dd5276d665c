//! Audio pipeline core: ring buffers, reader/decoder/resampler stages, the
//! shared mixer and the per-lane orchestrator.

pub mod decoder;
pub mod error;
pub mod mixer;
pub mod pipeline;
pub mod reader;
pub mod resampler;
pub mod ring_buffer;
pub mod sample_convert;
pub mod speaker;
pub mod types;

#[cfg(test)]
mod tests;

pub use decoder::AudioDecoder;
pub use error::AudioError;
pub use mixer::{AudioMixer, MixerCommand, MixerController, MixerLane};
pub use pipeline::AudioPipeline;
pub use reader::{AudioReader, PipelineSource};
pub use resampler::AudioResampler;
pub use ring_buffer::RingBuffer;
pub use speaker::Speaker;
pub use types::{
    AudioStreamInfo, DecodeErrorKind, EventPayload, FileType, InfoErrorEvent, MediaFile,
    PipelineState, ResampleInfo, StageKind,
};
