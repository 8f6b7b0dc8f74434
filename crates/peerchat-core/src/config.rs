use std::time::Duration;

use crate::{Error, Result};

/// Chunk size for file transfers (16 KiB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// How many chunk-widths may sit in the outgoing buffer before the sender pauses
pub const HIGH_WATER_CHUNKS: usize = 4;

/// Poll interval while waiting for the outgoing buffer to drain
pub const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Give up waiting for a drain after this long and send anyway
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunables for the file transfer pipeline
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Maximum bytes per binary chunk
    pub chunk_size: usize,

    /// Backpressure threshold, expressed in chunk-widths
    pub high_water_chunks: usize,

    pub drain_poll: Duration,

    pub drain_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            high_water_chunks: HIGH_WATER_CHUNKS,
            drain_poll: DRAIN_POLL,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

impl TransferConfig {
    /// Buffered byte count above which the sender yields before the next chunk
    pub fn high_water_mark(&self) -> usize {
        self.chunk_size * self.high_water_chunks
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk size must be positive".into()));
        }
        if self.high_water_chunks == 0 {
            return Err(Error::Config("high water mark must be positive".into()));
        }
        if self.drain_poll.is_zero() {
            return Err(Error::Config("drain poll interval must be positive".into()));
        }
        Ok(())
    }
}
