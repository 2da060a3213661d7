use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::NamedTempFile;

use karstdb::common::config::LogConfig;
use karstdb::storage::buffer::BufferPoolManager;
use karstdb::storage::disk::DiskManager;
use karstdb::transaction::wal::LogManager;

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<NamedTempFile> {
    Ok(NamedTempFile::new()?)
}

// Create a buffer pool manager over a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let file = create_temp_db_file()?;
    let disk_manager = Arc::new(DiskManager::new(file.path())?);
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, disk_manager));
    Ok((buffer_pool, file))
}

// Create a WAL-enabled engine: disk manager, running log manager, and a
// buffer pool that enforces write-ahead ordering
#[allow(dead_code)]
pub fn create_wal_engine(
    pool_size: usize,
) -> Result<(
    Arc<DiskManager>,
    Arc<LogManager>,
    Arc<BufferPoolManager>,
    NamedTempFile,
)> {
    let file = create_temp_db_file()?;
    let disk_manager = Arc::new(DiskManager::new(file.path())?);
    let config = LogConfig {
        buffer_size: 4096,
        flush_timeout: Duration::from_millis(20),
    };
    let log_manager = Arc::new(LogManager::new(disk_manager.clone(), config));
    log_manager.run_flush_thread();
    let buffer_pool = Arc::new(BufferPoolManager::new_with_wal(
        pool_size,
        disk_manager.clone(),
        log_manager.clone(),
    ));
    Ok((disk_manager, log_manager, buffer_pool, file))
}
