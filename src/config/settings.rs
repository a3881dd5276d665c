//! Pipeline tuning knobs: buffer capacities, transfer sizes and timeouts.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Tuning parameters for one audio pipeline and the shared mixer.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Capacity of the encoded-byte ring between reader and decoder.
    #[serde(default = "default_raw_ring_capacity")]
    pub raw_ring_capacity: usize,
    /// Capacity of the decoded-PCM ring between decoder and resampler.
    #[serde(default = "default_pcm_ring_capacity")]
    pub pcm_ring_capacity: usize,
    /// Capacity of each mixer input ring.
    #[serde(default = "default_mixer_ring_capacity")]
    pub mixer_ring_capacity: usize,
    /// Transfer scratch size for one reader fetch.
    #[serde(default = "default_reader_chunk_size")]
    pub reader_chunk_size: usize,
    /// Largest block the mixer pulls from a lane per iteration, in bytes.
    #[serde(default = "default_mixer_block_size")]
    pub mixer_block_size: usize,
    /// Bounded wait for ring reads/writes inside stage loops, in ms.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Sleep between scheduling slices when a stage has nothing to do, in ms.
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    /// How long `stop()` waits for the three stages to acknowledge, in ms.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Capacity of the bounded info/error event queue.
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
    /// Capacity of the mixer's bounded command queue.
    #[serde(default = "default_command_queue_depth")]
    pub command_queue_depth: usize,
    /// HTTP connect timeout, in ms.
    #[serde(default = "default_http_connect_timeout_ms")]
    pub http_connect_timeout_ms: u64,
    /// Bounded wait for one chunk from the HTTP body stream, in ms.
    #[serde(default = "default_http_poll_timeout_ms")]
    pub http_poll_timeout_ms: u64,
}

fn default_raw_ring_capacity() -> usize {
    64 * 1024
}
fn default_pcm_ring_capacity() -> usize {
    128 * 1024
}
fn default_mixer_ring_capacity() -> usize {
    64 * 1024
}
fn default_reader_chunk_size() -> usize {
    8 * 1024
}
fn default_mixer_block_size() -> usize {
    4096
}
fn default_io_timeout_ms() -> u64 {
    20
}
fn default_idle_sleep_ms() -> u64 {
    5
}
fn default_stop_timeout_ms() -> u64 {
    2000
}
fn default_event_queue_depth() -> usize {
    32
}
fn default_command_queue_depth() -> usize {
    16
}
fn default_http_connect_timeout_ms() -> u64 {
    5000
}
fn default_http_poll_timeout_ms() -> u64 {
    50
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            raw_ring_capacity: default_raw_ring_capacity(),
            pcm_ring_capacity: default_pcm_ring_capacity(),
            mixer_ring_capacity: default_mixer_ring_capacity(),
            reader_chunk_size: default_reader_chunk_size(),
            mixer_block_size: default_mixer_block_size(),
            io_timeout_ms: default_io_timeout_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            event_queue_depth: default_event_queue_depth(),
            command_queue_depth: default_command_queue_depth(),
            http_connect_timeout_ms: default_http_connect_timeout_ms(),
            http_poll_timeout_ms: default_http_poll_timeout_ms(),
        }
    }
}

/// Error types for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    ParseError(String),
    ValidationError(String),
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "I/O error: {}", e),
            ConfigError::ParseError(s) => write!(f, "Parse error: {}", s),
            ConfigError::ValidationError(s) => write!(f, "Validation error: {}", s),
        }
    }
}

impl Error for ConfigError {}

impl PipelineConfig {
    /// Load settings from a file, falling back to defaults if it is absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save settings to a file, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(&self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Stage handoffs are S16 samples and stereo S16 frames; ring
        // capacities that are not frame-aligned would let a full ring
        // split a sample group across wrap-around reads.
        for cap in [
            self.raw_ring_capacity,
            self.pcm_ring_capacity,
            self.mixer_ring_capacity,
        ] {
            if cap == 0 || cap % 4 != 0 {
                return Err(ConfigError::ValidationError(
                    "ring capacities must be non-zero multiples of 4 bytes".to_string(),
                ));
            }
        }
        if self.reader_chunk_size == 0 || self.reader_chunk_size > self.raw_ring_capacity {
            return Err(ConfigError::ValidationError(
                "reader chunk size must be non-zero and fit the raw ring".to_string(),
            ));
        }
        // Mixer blocks are stereo S16 frames; anything not frame-aligned
        // would shear the two lanes against each other.
        if self.mixer_block_size == 0 || self.mixer_block_size % 4 != 0 {
            return Err(ConfigError::ValidationError(
                "mixer block size must be a non-zero multiple of 4 bytes".to_string(),
            ));
        }
        if self.event_queue_depth == 0 || self.command_queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "queue depths must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn http_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.http_connect_timeout_ms)
    }

    pub fn http_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.http_poll_timeout_ms)
    }
}
