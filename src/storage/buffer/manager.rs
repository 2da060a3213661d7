use std::collections::VecDeque;
use std::sync::Arc;
use parking_lot::Mutex;

use crate::common::types::{
    Frame, FrameId, FrameRef, Lsn, Page, PageId, PageRef, INVALID_LSN, INVALID_PAGE_ID,
};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::page_table::ExtendibleHashTable;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;
use crate::transaction::wal::LogManager;

/// How many entries a page-table bucket holds before splitting.
const PAGE_TABLE_BUCKET_SIZE: usize = 8;

/// The buffer pool: a fixed set of frames, an extendible-hash page table
/// mapping page ids to frames, and an LRU replacer for victim selection.
///
/// Pin discipline: a page is pinned by `fetch_page`/`new_page` and unpinned
/// exactly once per fetch; a frame becomes an eviction candidate only when
/// its pin count returns to zero. Pins and page latches are orthogonal.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<FrameRef>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
    replacer: Mutex<LruReplacer>,
    disk_manager: Arc<DiskManager>,
    log_manager: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::build(pool_size, disk_manager, None)
    }

    /// A pool that enforces write-ahead logging: no dirty page whose LSN is
    /// beyond `persistent_lsn` reaches the data file before the log does.
    pub fn new_with_wal(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Arc<LogManager>,
    ) -> Self {
        Self::build(pool_size, disk_manager, Some(log_manager))
    }

    fn build(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            let frame_id = i as FrameId;
            let page = Arc::new(parking_lot::RwLock::new(Page::new(INVALID_PAGE_ID)));
            frames.push(Arc::new(parking_lot::RwLock::new(Frame::new(frame_id, page))));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            frames,
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
            free_list: Mutex::new(free_list),
            replacer: Mutex::new(LruReplacer::new(pool_size)),
            disk_manager,
            log_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Fetch a pinned page, reading it from disk if it is not resident.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageRef, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot fetch the invalid page id".to_string(),
            ));
        }

        loop {
            if let Some(frame_id) = self.page_table.find(&page_id) {
                let frame = &self.frames[frame_id as usize];
                let mut guard = frame.write();
                // the mapping may have been evicted between lookup and latch
                if self.page_table.find(&page_id) != Some(frame_id) {
                    continue;
                }
                guard.pin_count += 1;
                if guard.pin_count == 1 {
                    self.replacer.lock().remove(frame_id);
                }
                return Ok(guard.page.clone());
            }

            let frame_id = self.allocate_frame()?;
            let frame = &self.frames[frame_id as usize];
            let mut guard = frame.write();

            if self.page_table.find(&page_id).is_some() {
                // lost the race: someone else brought the page in
                self.free_list.lock().push_back(frame_id);
                continue;
            }

            {
                let mut page = guard.page.write();
                self.disk_manager.read_page(page_id, &mut page)?;
                page.lsn = INVALID_LSN;
            }
            guard.pin_count = 1;
            guard.is_dirty = false;
            self.page_table.insert(page_id, frame_id);
            return Ok(guard.page.clone());
        }
    }

    /// Allocate a fresh page: pinned, zero-filled, clean, with no LSN.
    pub fn new_page(&self) -> Result<(PageRef, PageId), BufferPoolError> {
        // claim the frame before touching the disk so that pool exhaustion
        // leaves no allocation behind
        let frame_id = self.allocate_frame()?;
        let page_id = match self.disk_manager.allocate_page() {
            Ok(id) => id,
            Err(e) => {
                self.free_list.lock().push_back(frame_id);
                return Err(e.into());
            }
        };

        let frame = &self.frames[frame_id as usize];
        let mut guard = frame.write();
        {
            let mut page = guard.page.write();
            page.data.fill(0);
            page.page_id = page_id;
            page.lsn = INVALID_LSN;
        }
        guard.pin_count = 1;
        guard.is_dirty = false;
        self.page_table.insert(page_id, frame_id);
        Ok((guard.page.clone(), page_id))
    }

    /// Decrement the pin count and OR in the dirty flag.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let frame_id = self
            .page_table
            .find(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let frame = &self.frames[frame_id as usize];
        let mut guard = frame.write();
        if guard.pin_count > 0 {
            guard.pin_count -= 1;
        }
        if is_dirty {
            guard.is_dirty = true;
        }
        if guard.pin_count == 0 {
            self.replacer.lock().insert(frame_id);
        }
        Ok(())
    }

    /// Drop a page whose pin count has reached zero from the pool.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let frame_id = match self.page_table.find(&page_id) {
            Some(id) => id,
            None => return Ok(()),
        };

        let frame = &self.frames[frame_id as usize];
        let mut guard = frame.write();
        if guard.pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        self.page_table.remove(&page_id);
        {
            let mut page = guard.page.write();
            page.data.fill(0);
            page.page_id = INVALID_PAGE_ID;
            page.lsn = INVALID_LSN;
        }
        guard.is_dirty = false;
        self.replacer.lock().remove(frame_id);
        self.free_list.lock().push_back(frame_id);
        Ok(())
    }

    /// Write a resident page to disk if it is dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let frame_id = self
            .page_table
            .find(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let frame = &self.frames[frame_id as usize];
        let mut guard = frame.write();
        if guard.is_dirty {
            let page = guard.page.read();
            self.enforce_wal(page.lsn);
            self.disk_manager.write_page(&page)?;
            drop(page);
            guard.is_dirty = false;
        }
        Ok(())
    }

    /// Flush every dirty resident page.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        for frame in &self.frames {
            let mut guard = frame.write();
            if guard.is_dirty {
                let page = guard.page.read();
                if page.page_id != INVALID_PAGE_ID {
                    self.enforce_wal(page.lsn);
                    self.disk_manager.write_page(&page)?;
                }
                drop(page);
                guard.is_dirty = false;
            }
        }
        Ok(())
    }

    /// The write-ahead rule: the log must be durable through `page_lsn`
    /// before the page image may hit the data file.
    fn enforce_wal(&self, page_lsn: Lsn) {
        if let Some(log_manager) = &self.log_manager {
            if page_lsn != INVALID_LSN && page_lsn > log_manager.persistent_lsn() {
                log_manager.flush_until(page_lsn);
            }
        }
    }

    /// Claim a frame from the free list, or evict the LRU victim.
    fn allocate_frame(&self) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        loop {
            let victim_id = match self.replacer.lock().victim() {
                Some(id) => id,
                None => return Err(BufferPoolError::BufferPoolFull),
            };

            let frame = &self.frames[victim_id as usize];
            let mut guard = frame.write();
            if guard.pin_count > 0 {
                // re-pinned after being chosen; pick another victim
                continue;
            }

            let page = guard.page.read();
            let old_page_id = page.page_id;
            if guard.is_dirty && old_page_id != INVALID_PAGE_ID {
                self.enforce_wal(page.lsn);
                self.disk_manager.write_page(&page)?;
            }
            drop(page);
            guard.is_dirty = false;
            if old_page_id != INVALID_PAGE_ID {
                self.page_table.remove(&old_page_id);
            }
            return Ok(victim_id);
        }
    }
}
