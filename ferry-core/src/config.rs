//! Protocol configuration: every timer, size and layout constant as a named value.

use serde::{Deserialize, Serialize};

/// Number of chunks a file is split into.
pub const DEFAULT_CHUNK_COUNT: usize = 10;

/// Data elements per chunk.
pub const DEFAULT_CHUNK_LEN: usize = 10;

/// Request/Control retransmission timeout in simulated time units.
pub const DEFAULT_TIME_OUT: f64 = 20.0;

/// Maximum retransmissions of a Request or Control.
pub const DEFAULT_RETRANSMIT_LIMIT: u32 = 3;

/// How long an Ack or RequestAck is kept for replay.
pub const DEFAULT_TIME_WAIT: f64 = 40.0;

/// Chunk keep-alive is `time_free_factor * time_out`.
pub const DEFAULT_TIME_FREE_FACTOR: f64 = 3.5;

/// Registry sweep interval.
pub const DEFAULT_TICK_INTERVAL: f64 = 0.1;

/// Bitmaps are packed into a u64.
pub const MAX_CHUNK_COUNT: usize = 64;

// Absorbs float error when converting lifetimes to whole ticks (20.0 / 0.1 must be 200, not 201).
const TICK_EPSILON: f64 = 1e-9;

/// Send-queue ordering for the outgoing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Shuffled with the node's seeded RNG.
    #[default]
    Random,
    /// Oldest receive time first.
    Fifo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolConfig {
    pub time_out: f64,
    pub retransmit_limit: u32,
    pub time_wait: f64,
    pub time_free_factor: f64,
    pub tick_interval: f64,
    pub chunk_count: usize,
    pub chunk_len: usize,
    /// Creation-time offset between consecutive chunks of one burst.
    pub chunk_stagger: f64,
    /// Creation-time offset of the Control that follows a chunk burst.
    pub control_delay: f64,
    /// Nominal size of one cached file, in bytes.
    pub file_size: u64,
    /// Capacity of the file cache in bytes.
    pub file_buffer_size: u64,
    /// Capacity of the outgoing buffer in bytes. `None` means unbounded.
    pub buffer_size: Option<u64>,
    /// Message time-to-live in simulated time units. `None` means messages never expire.
    pub msg_ttl: Option<f64>,
    pub queue_mode: QueueMode,
    pub request_size: u64,
    pub control_size: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            time_out: DEFAULT_TIME_OUT,
            retransmit_limit: DEFAULT_RETRANSMIT_LIMIT,
            time_wait: DEFAULT_TIME_WAIT,
            time_free_factor: DEFAULT_TIME_FREE_FACTOR,
            tick_interval: DEFAULT_TICK_INTERVAL,
            chunk_count: DEFAULT_CHUNK_COUNT,
            chunk_len: DEFAULT_CHUNK_LEN,
            chunk_stagger: 0.01,
            control_delay: 0.11,
            file_size: 5000,
            file_buffer_size: 50_000,
            buffer_size: None,
            msg_ttl: None,
            queue_mode: QueueMode::Random,
            request_size: 1024,
            control_size: 64,
        }
    }
}

impl ProtocolConfig {
    /// Keep-alive lifetime of a partially received transfer.
    pub fn time_free(&self) -> f64 {
        self.time_free_factor * self.time_out
    }

    /// Length of a complete file's data vector.
    pub fn data_len(&self) -> usize {
        self.chunk_count * self.chunk_len
    }

    /// Size attributed to one chunk message.
    pub fn chunk_size(&self) -> u64 {
        self.file_size / self.chunk_count.max(1) as u64
    }

    /// Whole ticks before a timer of `lifetime` expires: ⌈lifetime / tick_interval⌉, at least 1.
    pub fn ticks_for(&self, lifetime: f64) -> u64 {
        let ticks = (lifetime / self.tick_interval - TICK_EPSILON).ceil();
        if ticks < 1.0 {
            1
        } else {
            ticks as u64
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_count == 0 || self.chunk_count > MAX_CHUNK_COUNT {
            return Err(ConfigError::ChunkCount(self.chunk_count));
        }
        if self.chunk_len == 0 {
            return Err(ConfigError::ChunkLen);
        }
        if !(self.tick_interval > 0.0) {
            return Err(ConfigError::NonPositive("tick_interval"));
        }
        if !(self.time_out > 0.0) {
            return Err(ConfigError::NonPositive("time_out"));
        }
        if !(self.time_wait > 0.0) {
            return Err(ConfigError::NonPositive("time_wait"));
        }
        if !(self.time_free_factor > 0.0) {
            return Err(ConfigError::NonPositive("time_free_factor"));
        }
        if self.file_size > self.file_buffer_size {
            return Err(ConfigError::FileLargerThanCache {
                file_size: self.file_size,
                capacity: self.file_buffer_size,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk_count must be between 1 and {MAX_CHUNK_COUNT}, got {0}")]
    ChunkCount(usize),
    #[error("chunk_len must be non-zero")]
    ChunkLen,
    #[error("{0} must be positive")]
    NonPositive(&'static str),
    #[error("file_size {file_size} exceeds file_buffer_size {capacity}")]
    FileLargerThanCache { file_size: u64, capacity: u64 },
}
