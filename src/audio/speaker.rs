use std::sync::{Arc, Mutex};

use crate::audio::error::AudioError;

/// Boundary to the physical speaker/DMA driver. The mixer only ever calls
/// `play` with already-mixed S16LE stereo PCM at the target sample rate.
///
/// `play` returns how many bytes the device accepted; the mixer retries the
/// remainder on its next iteration (sink backpressure).
pub trait Speaker: Send {
    fn start(&mut self) -> Result<(), AudioError>;
    fn stop(&mut self) -> Result<(), AudioError>;
    fn play(&mut self, data: &[u8]) -> Result<usize, AudioError>;
    fn flush(&mut self) -> Result<(), AudioError>;
    fn has_buffered_data(&self) -> bool;
    fn available_space(&self) -> usize;
}

/// In-memory sink that records everything it accepts. Used by the test
/// suite in place of a device driver; `accept_limit` throttles per-call
/// acceptance to exercise the mixer's backpressure path.
pub struct CaptureSpeaker {
    captured: Arc<Mutex<Vec<u8>>>,
    accept_limit: usize,
    started: bool,
}

impl CaptureSpeaker {
    pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
        Self::with_accept_limit(usize::MAX)
    }

    pub fn with_accept_limit(accept_limit: usize) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                captured: Arc::clone(&captured),
                accept_limit,
                started: false,
            },
            captured,
        )
    }
}

impl Speaker for CaptureSpeaker {
    fn start(&mut self) -> Result<(), AudioError> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.started = false;
        Ok(())
    }

    fn play(&mut self, data: &[u8]) -> Result<usize, AudioError> {
        if !self.started {
            return Err(AudioError::InvalidState("speaker not started".to_string()));
        }
        let n = data.len().min(self.accept_limit);
        self.captured
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn has_buffered_data(&self) -> bool {
        false
    }

    fn available_space(&self) -> usize {
        usize::MAX
    }
}
