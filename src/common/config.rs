use std::time::Duration;

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Default capacity of each of the two log buffers, in bytes.
pub const LOG_BUFFER_SIZE: usize = PAGE_SIZE * 8;

/// Default poll timeout of the background log flush thread.
pub const LOG_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for the log manager
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Capacity of each log buffer in bytes
    pub buffer_size: usize,

    /// How long the flush thread waits before flushing a non-full buffer
    pub flush_timeout: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            buffer_size: LOG_BUFFER_SIZE,
            flush_timeout: LOG_TIMEOUT,
        }
    }
}
