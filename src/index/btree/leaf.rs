use std::marker::PhantomData;
use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::{self, NODE_HEADER_SIZE};
use crate::storage::page::PageKind;

/// Layout of a leaf node: the shared header followed by a sorted array of
/// `(key, rid)` pairs. Leaves are chained left-to-right through the
/// header's next pointer for range scans.
pub(crate) struct LeafNode<K>(PhantomData<K>);

const RID_SIZE: usize = 8;

impl<K: IndexKey> LeafNode<K> {
    const PAIR_SIZE: usize = K::ENCODED_LEN + RID_SIZE;

    pub fn init(page: &mut Page, parent: PageId) {
        page.data.fill(0);
        node::set_kind(page, PageKind::BTreeLeaf);
        node::set_size(page, 0);
        node::set_max_size(page, node::compute_max_size(Self::PAIR_SIZE));
        node::set_parent_page_id(page, parent);
        node::set_next_page_id(page, INVALID_PAGE_ID);
    }

    fn entry_offset(index: usize) -> usize {
        NODE_HEADER_SIZE + index * Self::PAIR_SIZE
    }

    pub fn key_at(page: &Page, index: usize) -> K {
        K::decode(&page.data[Self::entry_offset(index)..])
    }

    pub fn value_at(page: &Page, index: usize) -> Rid {
        let pos = Self::entry_offset(index) + K::ENCODED_LEN;
        Rid::new(
            LittleEndian::read_u32(&page.data[pos..]),
            LittleEndian::read_u32(&page.data[pos + 4..]),
        )
    }

    fn set_entry(page: &mut Page, index: usize, key: K, value: Rid) {
        let pos = Self::entry_offset(index);
        key.encode(&mut page.data[pos..]);
        LittleEndian::write_u32(&mut page.data[pos + K::ENCODED_LEN..], value.page_id);
        LittleEndian::write_u32(&mut page.data[pos + K::ENCODED_LEN + 4..], value.slot);
    }

    fn copy_entry(src: &Page, src_index: usize, dst: &mut Page, dst_index: usize) {
        let from = Self::entry_offset(src_index);
        let to = Self::entry_offset(dst_index);
        dst.data[to..to + Self::PAIR_SIZE].copy_from_slice(&src.data[from..from + Self::PAIR_SIZE]);
    }

    fn shift_entries(page: &mut Page, from: usize, to: usize, count: usize) {
        let src = Self::entry_offset(from);
        let dst = Self::entry_offset(to);
        page.data
            .copy_within(src..src + count * Self::PAIR_SIZE, dst);
    }

    /// First index whose key is >= the probe, `size` if all are smaller.
    pub fn key_index(page: &Page, key: &K) -> usize {
        let mut low = 0;
        let mut high = node::size(page);
        while low < high {
            let mid = low + (high - low) / 2;
            if Self::key_at(page, mid) < *key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    pub fn lookup(page: &Page, key: &K) -> Option<Rid> {
        let index = Self::key_index(page, key);
        if index < node::size(page) && Self::key_at(page, index) == *key {
            Some(Self::value_at(page, index))
        } else {
            None
        }
    }

    /// Insert in sorted position, replacing the value on an equal key.
    /// Returns the size after insertion.
    pub fn insert(page: &mut Page, key: K, value: Rid) -> usize {
        let size = node::size(page);
        debug_assert!(size < node::max_size(page));

        let index = Self::key_index(page, &key);
        if index < size && Self::key_at(page, index) == key {
            Self::set_entry(page, index, key, value);
            return size;
        }

        if index < size {
            Self::shift_entries(page, index, index + 1, size - index);
        }
        Self::set_entry(page, index, key, value);
        node::set_size(page, size + 1);
        size + 1
    }

    /// Remove the key if present, compacting the array. Returns the size
    /// after removal.
    pub fn remove(page: &mut Page, key: &K) -> usize {
        let size = node::size(page);
        let index = Self::key_index(page, key);
        if index < size && Self::key_at(page, index) == *key {
            if index + 1 < size {
                Self::shift_entries(page, index + 1, index, size - index - 1);
            }
            node::set_size(page, size - 1);
        }
        node::size(page)
    }

    /// Split support: move the upper half of `src` into the fresh `dst`.
    pub fn move_half_to(src: &mut Page, dst: &mut Page) {
        let size = node::size(src);
        let start = size / 2;
        let dst_start = node::size(dst);
        for i in start..size {
            Self::copy_entry(src, i, dst, dst_start + i - start);
        }
        node::set_size(dst, dst_start + size - start);
        node::set_size(src, start);
    }

    /// Merge support: append everything in `src` to `dst` and splice `src`
    /// out of the sibling chain.
    pub fn move_all_to(src: &mut Page, dst: &mut Page) {
        let src_size = node::size(src);
        let dst_size = node::size(dst);
        for i in 0..src_size {
            Self::copy_entry(src, i, dst, dst_size + i);
        }
        node::set_size(dst, dst_size + src_size);
        node::set_size(src, 0);
        node::set_next_page_id(dst, node::next_page_id(src));
    }

    /// Left rotation: `src`'s first pair moves to the tail of `dst` (its
    /// left sibling). Returns `src`'s new first key, the fresh separator.
    pub fn move_first_to_end_of(src: &mut Page, dst: &mut Page) -> K {
        let dst_size = node::size(dst);
        Self::copy_entry(src, 0, dst, dst_size);
        node::set_size(dst, dst_size + 1);

        let src_size = node::size(src);
        Self::shift_entries(src, 1, 0, src_size - 1);
        node::set_size(src, src_size - 1);

        Self::key_at(src, 0)
    }

    /// Right rotation: `src`'s last pair moves to the front of `dst` (its
    /// right sibling). Returns `dst`'s new first key, the fresh separator.
    pub fn move_last_to_front_of(src: &mut Page, dst: &mut Page) -> K {
        let dst_size = node::size(dst);
        if dst_size > 0 {
            Self::shift_entries(dst, 0, 1, dst_size);
        }
        let src_size = node::size(src);
        Self::copy_entry(src, src_size - 1, dst, 0);
        node::set_size(dst, dst_size + 1);
        node::set_size(src, src_size - 1);

        Self::key_at(dst, 0)
    }
}
