use std::error::Error;
use std::io;
use symphonia::core::errors::Error as SymphoniaError;

use crate::audio::types::DecodeErrorKind;

/// Error types specific to the audio pipeline.
#[derive(Debug)]
pub enum AudioError {
    /// Source URL or memory tag names a container we do not handle.
    UnsupportedSource(String),
    /// Stream format violates the pipeline contract (bit depth, channels).
    UnsupportedFormat(String),
    /// Transport-level failure while fetching encoded bytes.
    NetworkError(reqwest::Error),
    IoError(io::Error),
    SymphoniaError(SymphoniaError),
    DecodeError(DecodeErrorKind),
    ResamplingError(String),
    /// A component was used outside its lifecycle (e.g. start before stop).
    InvalidState(String),
    InitializationError(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::UnsupportedSource(s) => write!(f, "Unsupported source: {}", s),
            AudioError::UnsupportedFormat(s) => write!(f, "Unsupported format: {}", s),
            AudioError::NetworkError(e) => write!(f, "Network error: {}", e),
            AudioError::IoError(e) => write!(f, "I/O error: {}", e),
            AudioError::SymphoniaError(e) => write!(f, "Symphonia error: {}", e),
            AudioError::DecodeError(k) => write!(f, "Decode error: {:?}", k),
            AudioError::ResamplingError(s) => write!(f, "Resampling error: {}", s),
            AudioError::InvalidState(s) => write!(f, "Invalid state: {}", s),
            AudioError::InitializationError(s) => write!(f, "Initialization error: {}", s),
        }
    }
}

impl Error for AudioError {}

impl From<SymphoniaError> for AudioError {
    fn from(e: SymphoniaError) -> Self {
        AudioError::SymphoniaError(e)
    }
}

impl From<io::Error> for AudioError {
    fn from(e: io::Error) -> Self {
        AudioError::IoError(e)
    }
}

impl From<reqwest::Error> for AudioError {
    fn from(e: reqwest::Error) -> Self {
        AudioError::NetworkError(e)
    }
}

impl From<rubato::ResamplerConstructionError> for AudioError {
    fn from(e: rubato::ResamplerConstructionError) -> Self {
        AudioError::ResamplingError(e.to_string())
    }
}

impl From<rubato::ResampleError> for AudioError {
    fn from(e: rubato::ResampleError) -> Self {
        AudioError::ResamplingError(e.to_string())
    }
}
