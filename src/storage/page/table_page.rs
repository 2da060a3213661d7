use byteorder::{ByteOrder, LittleEndian};

use crate::common::config::PAGE_SIZE;
use crate::common::types::{Page, PageId, INVALID_PAGE_ID};
use crate::storage::page::{PageError, PageKind};

/// Slotted tuple page.
///
/// Layout: a fixed header, tuple data growing up from the header, and a slot
/// array growing down from the page end. Each slot is (offset u32, length
/// u32); the high bit of the length is the mark-delete tombstone, and a slot
/// of (0, 0) is vacated. Vacated data space is not compacted.
///
/// ```text
/// 0        1..4   4           8            12        16        20
/// | kind | pad | slot_count | free_offset | next_id | prev_id | tuples ...
///                                    ... | slot[1] | slot[0] |  <- page end
/// ```
pub struct TablePage;

const SLOT_COUNT_OFFSET: usize = 4;
const FREE_OFFSET_OFFSET: usize = 8;
const NEXT_PAGE_OFFSET: usize = 12;
const PREV_PAGE_OFFSET: usize = 16;
const TABLE_HEADER_SIZE: usize = 20;

const SLOT_SIZE: usize = 8;
const TOMBSTONE_BIT: u32 = 1 << 31;

impl TablePage {
    pub fn init(page: &mut Page, prev_page_id: PageId) {
        page.data.fill(0);
        page.data[super::PAGE_KIND_OFFSET] = PageKind::Table as u8;
        Self::set_slot_count(page, 0);
        Self::set_free_offset(page, TABLE_HEADER_SIZE as u32);
        Self::set_next_page_id(page, INVALID_PAGE_ID);
        Self::set_prev_page_id(page, prev_page_id);
    }

    pub fn is_table_page(page: &Page) -> bool {
        PageKind::from_u8(page.data[super::PAGE_KIND_OFFSET]) == PageKind::Table
    }

    pub fn slot_count(page: &Page) -> u32 {
        LittleEndian::read_u32(&page.data[SLOT_COUNT_OFFSET..])
    }

    fn set_slot_count(page: &mut Page, count: u32) {
        LittleEndian::write_u32(&mut page.data[SLOT_COUNT_OFFSET..], count);
    }

    fn free_offset(page: &Page) -> u32 {
        LittleEndian::read_u32(&page.data[FREE_OFFSET_OFFSET..])
    }

    fn set_free_offset(page: &mut Page, offset: u32) {
        LittleEndian::write_u32(&mut page.data[FREE_OFFSET_OFFSET..], offset);
    }

    pub fn next_page_id(page: &Page) -> PageId {
        LittleEndian::read_u32(&page.data[NEXT_PAGE_OFFSET..])
    }

    pub fn set_next_page_id(page: &mut Page, next: PageId) {
        LittleEndian::write_u32(&mut page.data[NEXT_PAGE_OFFSET..], next);
    }

    pub fn prev_page_id(page: &Page) -> PageId {
        LittleEndian::read_u32(&page.data[PREV_PAGE_OFFSET..])
    }

    pub fn set_prev_page_id(page: &mut Page, prev: PageId) {
        LittleEndian::write_u32(&mut page.data[PREV_PAGE_OFFSET..], prev);
    }

    fn slot_pos(slot: u32) -> usize {
        PAGE_SIZE - SLOT_SIZE * (slot as usize + 1)
    }

    fn read_slot(page: &Page, slot: u32) -> (u32, u32) {
        let pos = Self::slot_pos(slot);
        let offset = LittleEndian::read_u32(&page.data[pos..]);
        let len = LittleEndian::read_u32(&page.data[pos + 4..]);
        (offset, len)
    }

    fn write_slot(page: &mut Page, slot: u32, offset: u32, len: u32) {
        let pos = Self::slot_pos(slot);
        LittleEndian::write_u32(&mut page.data[pos..], offset);
        LittleEndian::write_u32(&mut page.data[pos + 4..], len);
    }

    fn free_space(page: &Page) -> usize {
        let slots_end = PAGE_SIZE - SLOT_SIZE * Self::slot_count(page) as usize;
        slots_end.saturating_sub(Self::free_offset(page) as usize)
    }

    /// Insert a tuple, reusing a vacated slot if one exists. Returns the slot
    /// number, or None if the page cannot hold the tuple.
    pub fn insert_tuple(page: &mut Page, tuple: &[u8]) -> Option<u32> {
        let count = Self::slot_count(page);
        let reuse = (0..count).find(|&s| Self::read_slot(page, s) == (0, 0));

        let needed = tuple.len() + if reuse.is_none() { SLOT_SIZE } else { 0 };
        if Self::free_space(page) < needed {
            return None;
        }

        let slot = match reuse {
            Some(s) => s,
            None => {
                Self::set_slot_count(page, count + 1);
                count
            }
        };

        let offset = Self::free_offset(page);
        let start = offset as usize;
        page.data[start..start + tuple.len()].copy_from_slice(tuple);
        Self::set_free_offset(page, offset + tuple.len() as u32);
        Self::write_slot(page, slot, offset, tuple.len() as u32);
        Some(slot)
    }

    /// Insert a tuple at a specific slot. Used by redo, which must rebuild
    /// tuples at their logged addresses; a zeroed page is initialized on
    /// first use and an already-occupied slot is left untouched.
    pub fn insert_tuple_at(page: &mut Page, slot: u32, tuple: &[u8]) -> Result<(), PageError> {
        if !Self::is_table_page(page) {
            TablePage::init(page, INVALID_PAGE_ID);
        }

        if Self::read_slot(page, slot) != (0, 0) {
            return Ok(());
        }

        let count = Self::slot_count(page);
        let new_count = count.max(slot + 1);
        let extra_slots = (new_count - count) as usize * SLOT_SIZE;
        if Self::free_space(page) < tuple.len() + extra_slots {
            return Err(PageError::InsufficientSpace);
        }

        // grow the slot array; intermediate slots stay vacated
        Self::set_slot_count(page, new_count);

        let offset = Self::free_offset(page);
        let start = offset as usize;
        page.data[start..start + tuple.len()].copy_from_slice(tuple);
        Self::set_free_offset(page, offset + tuple.len() as u32);
        Self::write_slot(page, slot, offset, tuple.len() as u32);
        Ok(())
    }

    /// Read a live tuple. Vacated and tombstoned slots read as absent.
    pub fn get_tuple(page: &Page, slot: u32) -> Option<Vec<u8>> {
        if slot >= Self::slot_count(page) {
            return None;
        }
        let (offset, len) = Self::read_slot(page, slot);
        if (offset, len) == (0, 0) || len & TOMBSTONE_BIT != 0 {
            return None;
        }
        let start = offset as usize;
        Some(page.data[start..start + len as usize].to_vec())
    }

    /// Set the tombstone on a live tuple. Returns false if there is nothing
    /// to mark (already deleted, vacated, or out of range).
    pub fn mark_delete(page: &mut Page, slot: u32) -> bool {
        if slot >= Self::slot_count(page) {
            return false;
        }
        let (offset, len) = Self::read_slot(page, slot);
        if (offset, len) == (0, 0) || len & TOMBSTONE_BIT != 0 {
            return false;
        }
        Self::write_slot(page, slot, offset, len | TOMBSTONE_BIT);
        true
    }

    /// Clear the tombstone. Returns false if the slot is not tombstoned.
    pub fn rollback_delete(page: &mut Page, slot: u32) -> bool {
        if slot >= Self::slot_count(page) {
            return false;
        }
        let (offset, len) = Self::read_slot(page, slot);
        if (offset, len) == (0, 0) || len & TOMBSTONE_BIT == 0 {
            return false;
        }
        Self::write_slot(page, slot, offset, len & !TOMBSTONE_BIT);
        true
    }

    /// Physically vacate a slot, tombstoned or not, leaving a real gap.
    /// Returns the removed bytes, or None if the slot was already empty.
    pub fn apply_delete(page: &mut Page, slot: u32) -> Option<Vec<u8>> {
        if slot >= Self::slot_count(page) {
            return None;
        }
        let (offset, len) = Self::read_slot(page, slot);
        if (offset, len) == (0, 0) {
            return None;
        }
        let real_len = (len & !TOMBSTONE_BIT) as usize;
        let start = offset as usize;
        let old = page.data[start..start + real_len].to_vec();
        Self::write_slot(page, slot, 0, 0);
        Some(old)
    }

    /// Overwrite a live tuple, in place when it fits, otherwise relocated to
    /// fresh space. Returns the before-image.
    pub fn update_tuple(page: &mut Page, slot: u32, tuple: &[u8]) -> Result<Vec<u8>, PageError> {
        if slot >= Self::slot_count(page) {
            return Err(PageError::SlotOutOfRange(slot));
        }
        let (offset, len) = Self::read_slot(page, slot);
        if (offset, len) == (0, 0) || len & TOMBSTONE_BIT != 0 {
            return Err(PageError::TupleNotFound);
        }

        let start = offset as usize;
        let old = page.data[start..start + len as usize].to_vec();

        if tuple.len() <= len as usize {
            page.data[start..start + tuple.len()].copy_from_slice(tuple);
            Self::write_slot(page, slot, offset, tuple.len() as u32);
        } else {
            if Self::free_space(page) < tuple.len() {
                return Err(PageError::InsufficientSpace);
            }
            let new_offset = Self::free_offset(page);
            let new_start = new_offset as usize;
            page.data[new_start..new_start + tuple.len()].copy_from_slice(tuple);
            Self::set_free_offset(page, new_offset + tuple.len() as u32);
            Self::write_slot(page, slot, new_offset, tuple.len() as u32);
        }
        Ok(old)
    }
}
