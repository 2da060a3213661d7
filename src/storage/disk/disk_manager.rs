use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::config::PAGE_SIZE;
use crate::common::types::{Page, PageId, INVALID_PAGE_ID};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager handles the actual file I/O: fixed-size blocks in the data
/// file, append/read of the write-ahead log in a sibling `.wal` file.
pub struct DiskManager {
    db_file: Mutex<File>,
    log_file: Mutex<File>,
}

impl DiskManager {
    /// Open (or create) the database file and its log file. A fresh database
    /// file is seeded with one zeroed page so that page 0 exists as the
    /// header page.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let db_path = db_path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        if file.metadata()?.len() == 0 {
            let mut file = &file;
            file.write_all(&[0u8; PAGE_SIZE])?;
            file.flush()?;
        }

        let log_path = Self::log_path_for(db_path);
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(log_path)?;

        Ok(Self {
            db_file: Mutex::new(file),
            log_file: Mutex::new(log_file),
        })
    }

    fn log_path_for(db_path: &Path) -> PathBuf {
        let mut p = db_path.as_os_str().to_owned();
        p.push(".wal");
        PathBuf::from(p)
    }

    /// Read a page from disk. Reading past the end of the file yields a
    /// zero-filled page, matching a freshly allocated block.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        if offset >= file_size {
            page.data.fill(0);
            page.page_id = page_id;
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut page.data)?;
        page.page_id = page_id;
        Ok(())
    }

    /// Write a page to disk
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = page.page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data)?;
        file.flush()?;
        Ok(())
    }

    /// Allocate a new page on disk and return its ID. Page ids are dense:
    /// the next id is derived from the current file length.
    pub fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        let mut file = self.db_file.lock();
        let file_size = file.metadata()?.len();
        let new_page_id = (file_size / PAGE_SIZE as u64) as PageId;

        file.seek(SeekFrom::End(0))?;
        file.write_all(&[0u8; PAGE_SIZE])?;
        file.flush()?;
        Ok(new_page_id)
    }

    /// Append raw log bytes to the log file and sync them to stable storage.
    pub fn write_log(&self, data: &[u8]) -> Result<(), DiskManagerError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut file = self.log_file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Read up to `buf.len()` log bytes starting at `offset`. Returns the
    /// number of bytes read; 0 means the offset is at or past end-of-log.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<usize, DiskManagerError> {
        let mut file = self.log_file.lock();
        let file_size = file.metadata()?.len();
        if offset >= file_size {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(offset))?;
        let available = (file_size - offset) as usize;
        let to_read = available.min(buf.len());
        file.read_exact(&mut buf[..to_read])?;
        Ok(to_read)
    }

    /// Current size of the log file in bytes.
    pub fn log_size(&self) -> Result<u64, DiskManagerError> {
        Ok(self.log_file.lock().metadata()?.len())
    }
}
