//! Header shared by both B+ tree node kinds.
//!
//! ```text
//! 0      1..4   4      8          12          16
//! | kind | pad | size | max_size | parent_id | next_id |  entries ...
//! ```
//!
//! `next_id` is meaningful on leaves only (right-sibling link).

use byteorder::{ByteOrder, LittleEndian};

use crate::common::config::PAGE_SIZE;
use crate::common::types::{Page, PageId};
use crate::storage::page::{PageKind, PAGE_KIND_OFFSET};

pub(crate) const NODE_HEADER_SIZE: usize = 20;

const SIZE_OFFSET: usize = 4;
const MAX_SIZE_OFFSET: usize = 8;
const PARENT_OFFSET: usize = 12;
const NEXT_OFFSET: usize = 16;

pub(crate) fn kind(page: &Page) -> PageKind {
    PageKind::from_u8(page.data[PAGE_KIND_OFFSET])
}

pub(crate) fn set_kind(page: &mut Page, page_kind: PageKind) {
    page.data[PAGE_KIND_OFFSET] = page_kind as u8;
}

pub(crate) fn is_leaf(page: &Page) -> bool {
    kind(page) == PageKind::BTreeLeaf
}

pub(crate) fn size(page: &Page) -> usize {
    LittleEndian::read_u32(&page.data[SIZE_OFFSET..]) as usize
}

pub(crate) fn set_size(page: &mut Page, size: usize) {
    LittleEndian::write_u32(&mut page.data[SIZE_OFFSET..], size as u32);
}

pub(crate) fn max_size(page: &Page) -> usize {
    LittleEndian::read_u32(&page.data[MAX_SIZE_OFFSET..]) as usize
}

pub(crate) fn set_max_size(page: &mut Page, max: usize) {
    LittleEndian::write_u32(&mut page.data[MAX_SIZE_OFFSET..], max as u32);
}

/// Minimum occupancy; the root is exempt.
pub(crate) fn min_size(page: &Page) -> usize {
    max_size(page) / 2
}

pub(crate) fn parent_page_id(page: &Page) -> PageId {
    LittleEndian::read_u32(&page.data[PARENT_OFFSET..])
}

pub(crate) fn set_parent_page_id(page: &mut Page, parent: PageId) {
    LittleEndian::write_u32(&mut page.data[PARENT_OFFSET..], parent);
}

pub(crate) fn next_page_id(page: &Page) -> PageId {
    LittleEndian::read_u32(&page.data[NEXT_OFFSET..])
}

pub(crate) fn set_next_page_id(page: &mut Page, next: PageId) {
    LittleEndian::write_u32(&mut page.data[NEXT_OFFSET..], next);
}

/// Fanout from the entry width: fill the page, keep one slot of slack, and
/// round down to even so `min = max/2` splits cleanly.
pub(crate) fn compute_max_size(pair_size: usize) -> usize {
    let slots = (PAGE_SIZE - NODE_HEADER_SIZE) / pair_size - 1;
    slots & !1
}
