use std::sync::Arc;
use parking_lot::RwLock;

use crate::common::config::PAGE_SIZE;

/// Page ID type. Page 0 is the header page.
pub type PageId = u32;

/// Sentinel for "no page".
pub const INVALID_PAGE_ID: PageId = u32::MAX;

/// The header page holding (index name, root page id) records.
pub const HEADER_PAGE_ID: PageId = 0;

/// Transaction ID type. Lower ids are older transactions.
pub type TxnId = u32;

/// Log sequence number. LSNs are assigned from 1; 0 means "none".
pub type Lsn = u32;

pub const INVALID_LSN: Lsn = 0;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Record ID: a tuple's physical address as (page, slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

/// In-memory page image. The wrapping `RwLock` is the page latch; pin count
/// and dirty bit live on the buffer pool frame.
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
    /// LSN of the most recent log record that modified this page.
    pub lsn: Lsn,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
            lsn: INVALID_LSN,
        }
    }
}

/// Smart pointer to a page
pub type PageRef = Arc<RwLock<Page>>;

/// Buffer pool frame structure
pub struct Frame {
    pub page: PageRef,
    pub frame_id: FrameId,
    pub is_dirty: bool,
    pub pin_count: u32,
}

impl Frame {
    pub fn new(frame_id: FrameId, page: PageRef) -> Self {
        Self {
            page,
            frame_id,
            is_dirty: false,
            pin_count: 0,
        }
    }
}

/// Smart pointer to a frame
pub type FrameRef = Arc<RwLock<Frame>>;
