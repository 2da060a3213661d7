use std::marker::PhantomData;
use std::sync::Arc;
use parking_lot::{ArcRwLockReadGuard, RawRwLock};

use crate::common::types::{Page, PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::key::IndexKey;
use crate::index::btree::leaf::LeafNode;
use crate::index::btree::node;
use crate::storage::buffer::BufferPoolManager;

type ReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;

/// Range scan over the sibling-linked leaves, in ascending key order.
///
/// Holds exactly one read-latched, pinned leaf at a time; advancing past
/// the last slot releases it and hops to the right sibling.
pub struct TreeIterator<K: IndexKey> {
    buffer_pool: Arc<BufferPoolManager>,
    leaf: Option<(PageId, ReadGuard)>,
    slot: usize,
    _key: PhantomData<K>,
}

impl<K: IndexKey> TreeIterator<K> {
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        leaf_id: PageId,
        guard: ReadGuard,
        slot: usize,
    ) -> Self {
        Self {
            buffer_pool,
            leaf: Some((leaf_id, guard)),
            slot,
            _key: PhantomData,
        }
    }

    pub(crate) fn empty(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            leaf: None,
            slot: 0,
            _key: PhantomData,
        }
    }

    fn release_current(&mut self) -> Option<PageId> {
        let (leaf_id, guard) = self.leaf.take()?;
        let next = node::next_page_id(&guard);
        drop(guard);
        let _ = self.buffer_pool.unpin_page(leaf_id, false);
        Some(next)
    }
}

impl<K: IndexKey> Iterator for TreeIterator<K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (_, guard) = self.leaf.as_ref()?;

            if self.slot < node::size(guard) {
                let key = LeafNode::<K>::key_at(guard, self.slot);
                let value = LeafNode::<K>::value_at(guard, self.slot);
                self.slot += 1;
                return Some((key, value));
            }

            // leaf exhausted: move to the right sibling
            let next = self.release_current()?;
            if next == INVALID_PAGE_ID {
                return None;
            }
            let page_ref = self.buffer_pool.fetch_page(next).ok()?;
            let guard = page_ref.read_arc();
            self.leaf = Some((next, guard));
            self.slot = 0;
        }
    }
}

impl<K: IndexKey> Drop for TreeIterator<K> {
    fn drop(&mut self) {
        self.release_current();
    }
}
