//! mixstream: dual-lane real-time audio streaming pipeline.
//!
//! A lane pulls encoded bytes from an HTTP URL or a memory-resident file,
//! decodes them to PCM, normalizes rate and channel layout, and feeds one of
//! the mixer's two inputs. The mixer combines the media and announcement
//! lanes (with ducking and anti-clip scaling) and pushes finished S16LE
//! stereo blocks to a speaker sink.

pub mod audio;
pub mod config;
