use std::marker::PhantomData;
use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId};
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::{self, NODE_HEADER_SIZE};
use crate::storage::page::PageKind;

/// Layout of an internal node: the shared header followed by an array of
/// `(key, child_page_id)` pairs. The key in slot 0 is an unused
/// placeholder; the separator in slot i > 0 is the smallest key reachable
/// under child i.
pub(crate) struct InternalNode<K>(PhantomData<K>);

const CHILD_SIZE: usize = 4;

impl<K: IndexKey> InternalNode<K> {
    const PAIR_SIZE: usize = K::ENCODED_LEN + CHILD_SIZE;

    pub fn init(page: &mut Page, parent: PageId) {
        page.data.fill(0);
        node::set_kind(page, PageKind::BTreeInternal);
        node::set_size(page, 0);
        node::set_max_size(page, node::compute_max_size(Self::PAIR_SIZE));
        node::set_parent_page_id(page, parent);
    }

    fn entry_offset(index: usize) -> usize {
        NODE_HEADER_SIZE + index * Self::PAIR_SIZE
    }

    pub fn key_at(page: &Page, index: usize) -> K {
        K::decode(&page.data[Self::entry_offset(index)..])
    }

    pub fn set_key_at(page: &mut Page, index: usize, key: &K) {
        key.encode(&mut page.data[Self::entry_offset(index)..]);
    }

    pub fn value_at(page: &Page, index: usize) -> PageId {
        LittleEndian::read_u32(&page.data[Self::entry_offset(index) + K::ENCODED_LEN..])
    }

    fn set_value_at(page: &mut Page, index: usize, child: PageId) {
        LittleEndian::write_u32(
            &mut page.data[Self::entry_offset(index) + K::ENCODED_LEN..],
            child,
        );
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

    /// Slot of the child holding `child_id`, if it is one of ours.
    pub fn value_index(page: &Page, child_id: PageId) -> Option<usize> {
        (0..node::size(page)).find(|&i| Self::value_at(page, i) == child_id)
    }

    /// Child to descend into: the last slot whose separator is <= the key,
    /// or slot 0 when the key sorts before every separator. Search starts
    /// at slot 1; slot 0's key is the placeholder.
    pub fn lookup(page: &Page, key: &K) -> PageId {
        let mut low = 1;
        let mut high = node::size(page);
        while low < high {
            let mid = low + (high - low) / 2;
            if Self::key_at(page, mid) <= *key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Self::value_at(page, low - 1)
    }

    /// Called exactly once, on the internal page that becomes the new root
    /// after a root split.
    pub fn populate_new_root(page: &mut Page, left: PageId, key: K, right: PageId) {
        Self::set_value_at(page, 0, left);
        Self::set_key_at(page, 1, &key);
        Self::set_value_at(page, 1, right);
        node::set_size(page, 2);
    }

    /// Insert `(key, new_child)` immediately after the slot holding
    /// `old_child`. Returns the size after insertion.
    pub fn insert_node_after(page: &mut Page, old_child: PageId, key: K, new_child: PageId) -> usize {
        let size = node::size(page);
        debug_assert!(size < node::max_size(page));

        let index = Self::value_index(page, old_child).map_or(size, |i| i + 1);
        if index < size {
            Self::shift_entries(page, index, index + 1, size - index);
        }
        Self::set_key_at(page, index, &key);
        Self::set_value_at(page, index, new_child);
        node::set_size(page, size + 1);
        size + 1
    }

    /// Remove the pair at `index`, compacting the array.
    pub fn remove_at(page: &mut Page, index: usize) {
        let size = node::size(page);
        if index + 1 < size {
            Self::shift_entries(page, index + 1, index, size - index - 1);
        }
        node::set_size(page, size - 1);
    }

    /// Split support: move the upper half of `src` into the fresh `dst`.
    /// The first moved key becomes `dst`'s slot-0 placeholder and is pushed
    /// up as the separator. Returns the moved children for re-parenting.
    pub fn move_half_to(src: &mut Page, dst: &mut Page) -> Vec<PageId> {
        let size = node::size(src);
        let start = size / 2;
        let dst_start = node::size(dst);
        for i in start..size {
            Self::copy_entry(src, i, dst, dst_start + i - start);
        }
        node::set_size(dst, dst_start + size - start);
        node::set_size(src, start);

        (dst_start..node::size(dst))
            .map(|i| Self::value_at(dst, i))
            .collect()
    }

    /// Merge support: append everything in `src` to `dst`, writing the
    /// parent separator `middle_key` over `src`'s slot-0 placeholder so the
    /// separator chain stays intact. Returns the moved children.
    pub fn move_all_to(src: &mut Page, dst: &mut Page, middle_key: K) -> Vec<PageId> {
        let src_size = node::size(src);
        let dst_size = node::size(dst);
        for i in 0..src_size {
            Self::copy_entry(src, i, dst, dst_size + i);
        }
        Self::set_key_at(dst, dst_size, &middle_key);
        node::set_size(dst, dst_size + src_size);
        node::set_size(src, 0);

        (dst_size..dst_size + src_size)
            .map(|i| Self::value_at(dst, i))
            .collect()
    }

    /// Left rotation through the parent: `src`'s first child moves to the
    /// tail of `dst` under the old separator `middle_key`. Returns the new
    /// separator for `src` and the moved child.
    pub fn move_first_to_end_of(src: &mut Page, dst: &mut Page, middle_key: K) -> (K, PageId) {
        let moved_child = Self::value_at(src, 0);
        let dst_size = node::size(dst);
        Self::set_key_at(dst, dst_size, &middle_key);
        Self::set_value_at(dst, dst_size, moved_child);
        node::set_size(dst, dst_size + 1);

        let new_separator = Self::key_at(src, 1);
        Self::remove_at(src, 0);
        (new_separator, moved_child)
    }

    /// Right rotation through the parent: `src`'s last child moves to the
    /// front of `dst`; the old separator `middle_key` becomes the key of
    /// `dst`'s previous first child. Returns the new separator for `dst`
    /// and the moved child.
    pub fn move_last_to_front_of(src: &mut Page, dst: &mut Page, middle_key: K) -> (K, PageId) {
        let src_size = node::size(src);
        let moved_child = Self::value_at(src, src_size - 1);
        let new_separator = Self::key_at(src, src_size - 1);

        let dst_size = node::size(dst);
        Self::shift_entries(dst, 0, 1, dst_size);
        Self::set_key_at(dst, 1, &middle_key);
        Self::set_value_at(dst, 0, moved_child);
        node::set_size(dst, dst_size + 1);

        node::set_size(src, src_size - 1);
        (new_separator, moved_child)
    }

    pub fn children(page: &Page) -> Vec<PageId> {
        (0..node::size(page)).map(|i| Self::value_at(page, i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    fn internal_with(keys: &[i64], children: &[PageId]) -> Page {
        assert_eq!(keys.len() + 1, children.len());
        let mut page = Page::new(1);
        InternalNode::<i64>::init(&mut page, INVALID_PAGE_ID);
        InternalNode::<i64>::set_value_at(&mut page, 0, children[0]);
        for (i, key) in keys.iter().enumerate() {
            InternalNode::<i64>::set_key_at(&mut page, i + 1, key);
            InternalNode::<i64>::set_value_at(&mut page, i + 1, children[i + 1]);
        }
        node::set_size(&mut page, children.len());
        page
    }

    #[test]
    fn test_lookup_picks_the_bounding_child() {
        let page = internal_with(&[10, 20, 30], &[100, 110, 120, 130]);

        assert_eq!(InternalNode::<i64>::lookup(&page, &5), 100);
        assert_eq!(InternalNode::<i64>::lookup(&page, &10), 110);
        assert_eq!(InternalNode::<i64>::lookup(&page, &15), 110);
        assert_eq!(InternalNode::<i64>::lookup(&page, &29), 120);
        assert_eq!(InternalNode::<i64>::lookup(&page, &30), 130);
        assert_eq!(InternalNode::<i64>::lookup(&page, &99), 130);
    }

    #[test]
    fn test_populate_new_root() {
        let mut page = Page::new(2);
        InternalNode::<i64>::init(&mut page, INVALID_PAGE_ID);
        InternalNode::<i64>::populate_new_root(&mut page, 7, 50, 8);

        assert_eq!(node::size(&page), 2);
        assert_eq!(InternalNode::<i64>::value_at(&page, 0), 7);
        assert_eq!(InternalNode::<i64>::key_at(&page, 1), 50);
        assert_eq!(InternalNode::<i64>::value_at(&page, 1), 8);
    }

    #[test]
    fn test_insert_node_after() {
        let mut page = internal_with(&[10, 30], &[100, 110, 130]);
        InternalNode::<i64>::insert_node_after(&mut page, 110, 20, 120);

        assert_eq!(node::size(&page), 4);
        assert_eq!(InternalNode::<i64>::key_at(&page, 2), 20);
        assert_eq!(InternalNode::<i64>::value_at(&page, 2), 120);
        assert_eq!(InternalNode::<i64>::key_at(&page, 3), 30);
        assert_eq!(InternalNode::<i64>::value_at(&page, 3), 130);
    }

    #[test]
    fn test_remove_at() {
        let mut page = internal_with(&[10, 20, 30], &[100, 110, 120, 130]);
        InternalNode::<i64>::remove_at(&mut page, 2);

        assert_eq!(node::size(&page), 3);
        assert_eq!(InternalNode::<i64>::children(&page), vec![100, 110, 130]);
        assert_eq!(InternalNode::<i64>::key_at(&page, 2), 30);
    }

    #[test]
    fn test_merge_pulls_separator_down() {
        let mut left = internal_with(&[10], &[100, 110]);
        let mut right = internal_with(&[40], &[120, 130]);

        let moved = InternalNode::<i64>::move_all_to(&mut right, &mut left, 30);
        assert_eq!(moved, vec![120, 130]);
        assert_eq!(node::size(&left), 4);
        // the parent separator is now the key over the absorbed first child
        assert_eq!(InternalNode::<i64>::key_at(&left, 2), 30);
        assert_eq!(InternalNode::<i64>::key_at(&left, 3), 40);
        assert_eq!(InternalNode::<i64>::children(&left), vec![100, 110, 120, 130]);
    }

    #[test]
    fn test_rotations_route_through_separator() {
        let mut left = internal_with(&[10, 20], &[100, 110, 120]);
        let mut right = internal_with(&[40], &[130, 140]);

        // right rotation: left's last child slides under the separator 30
        let (new_sep, moved) = InternalNode::<i64>::move_last_to_front_of(&mut left, &mut right, 30);
        assert_eq!(new_sep, 20);
        assert_eq!(moved, 120);
        assert_eq!(node::size(&left), 2);
        assert_eq!(node::size(&right), 3);
        assert_eq!(InternalNode::<i64>::children(&right), vec![120, 130, 140]);
        assert_eq!(InternalNode::<i64>::key_at(&right, 1), 30);
        assert_eq!(InternalNode::<i64>::key_at(&right, 2), 40);

        // left rotation sends it back
        let (new_sep, moved) = InternalNode::<i64>::move_first_to_end_of(&mut right, &mut left, 20);
        assert_eq!(moved, 120);
        assert_eq!(new_sep, 30);
        assert_eq!(node::size(&left), 3);
        assert_eq!(InternalNode::<i64>::children(&left), vec![100, 110, 120]);
        assert_eq!(InternalNode::<i64>::key_at(&left, 2), 20);
    }
}
