use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock};

use crate::common::types::{Page, PageId, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::internal::InternalNode;
use crate::index::btree::iterator::TreeIterator;
use crate::index::btree::key::IndexKey;
use crate::index::btree::leaf::LeafNode;
use crate::index::btree::node;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::HeaderPage;
use crate::transaction::concurrency::Transaction;

type ReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

/// Which safety rule a pessimistic descent applies when deciding that a
/// child can absorb the operation and the ancestors' latches can go.
#[derive(Clone, Copy)]
enum Safety {
    /// Will not split: one insert still leaves slack below max.
    Insert,
    /// Will not merge or redistribute: one delete stays above min.
    Delete,
}

fn is_safe(page: &Page, safety: Safety) -> bool {
    match safety {
        Safety::Insert => node::size(page) < node::max_size(page) - 1,
        Safety::Delete => node::size(page) > node::min_size(page) + 1,
    }
}

/// Write latches collected on a pessimistic descent, keyed by page id.
/// Released (and the pins returned) in one pass once the structural
/// modification settles; each entry corresponds to exactly one fetch.
struct LatchContext {
    buffer_pool: Arc<BufferPoolManager>,
    pages: Vec<(PageId, WriteGuard)>,
}

impl LatchContext {
    fn new(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            pages: Vec::new(),
        }
    }

    fn push(&mut self, page_id: PageId, guard: WriteGuard) {
        self.pages.push((page_id, guard));
    }

    fn contains(&self, page_id: PageId) -> bool {
        self.pages.iter().any(|(id, _)| *id == page_id)
    }

    fn page(&self, page_id: PageId) -> &Page {
        &self
            .pages
            .iter()
            .find(|(id, _)| *id == page_id)
            .expect("page not latched in this operation")
            .1
    }

    fn page_mut(&mut self, page_id: PageId) -> &mut Page {
        &mut self
            .pages
            .iter_mut()
            .find(|(id, _)| *id == page_id)
            .expect("page not latched in this operation")
            .1
    }

    fn last_page_id(&self) -> Option<PageId> {
        self.pages.last().map(|(id, _)| *id)
    }

    /// Drop every latch above the most recently pushed page. Ancestors
    /// released here were not modified, so they unpin clean.
    fn release_ancestors(&mut self) -> Result<(), BTreeError> {
        while self.pages.len() > 1 {
            let (page_id, guard) = self.pages.remove(0);
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;
        }
        Ok(())
    }

    fn release_all(&mut self, dirty: bool) -> Result<(), BTreeError> {
        for (page_id, guard) in self.pages.drain(..) {
            drop(guard);
            self.buffer_pool.unpin_page(page_id, dirty)?;
        }
        Ok(())
    }
}

enum OptimisticInsert {
    Done(bool),
    MustSplit,
    Retry,
}

enum OptimisticRemove {
    Done,
    MustRestructure,
    Retry,
}

/// Clustered-key B+ tree over buffer-pool pages.
///
/// Unique keys; values are tuple RIDs. Point and range reads crab down
/// with read latches. Mutations first try the optimistic protocol (read
/// descent, leaf latch upgrade) and fall back to a pessimistic write
/// descent when the leaf would split or underflow; the pessimistic path
/// releases ancestor latches as soon as a child is known to be safe.
/// The root page id is registered in the header page under `name`.
pub struct BPlusTree<K: IndexKey> {
    name: String,
    buffer_pool: Arc<BufferPoolManager>,
    root_page_id: AtomicU32,
    /// Serializes first-insert root creation.
    init_latch: Mutex<()>,
    _key: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Open (or register) the index `name`, loading its root from the
    /// header page.
    pub fn new(name: &str, buffer_pool: Arc<BufferPoolManager>) -> Result<Self, BTreeError> {
        let header_ref = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let root_page_id = {
            let mut header = header_ref.write();
            if !HeaderPage::is_header_page(&header) {
                HeaderPage::init(&mut header);
            }
            match HeaderPage::get_root_page_id(&header, name) {
                Some(root) => root,
                None => {
                    HeaderPage::insert_record(&mut header, name, INVALID_PAGE_ID)?;
                    INVALID_PAGE_ID
                }
            }
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;

        Ok(Self {
            name: name.to_string(),
            buffer_pool,
            root_page_id: AtomicU32::new(root_page_id),
            init_latch: Mutex::new(()),
            _key: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id.load(Ordering::SeqCst) == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    /// Record the new root both in memory and in the header page.
    fn set_root(&self, new_root: PageId) -> Result<(), BTreeError> {
        self.root_page_id.store(new_root, Ordering::SeqCst);
        let header_ref = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut header = header_ref.write();
            HeaderPage::update_record(&mut header, &self.name, new_root)?;
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }

    /// Read-crab from the root to the leaf bounding `key` (or the leftmost
    /// leaf when `key` is None): latch the child, then release the parent.
    /// Returns the read-latched, pinned leaf.
    fn descend_read(&self, key: Option<&K>) -> Result<Option<(PageId, ReadGuard)>, BTreeError> {
        let (mut current_id, mut guard) = loop {
            let root_id = self.root_page_id.load(Ordering::SeqCst);
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let page_ref = self.buffer_pool.fetch_page(root_id)?;
            let guard = page_ref.read_arc();
            // the root may have moved while we latched it
            if self.root_page_id.load(Ordering::SeqCst) == root_id {
                break (root_id, guard);
            }
            drop(guard);
            self.buffer_pool.unpin_page(root_id, false)?;
        };

        while !node::is_leaf(&guard) {
            let child_id = match key {
                Some(key) => InternalNode::<K>::lookup(&guard, key),
                None => InternalNode::<K>::value_at(&guard, 0),
            };
            let child_ref = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_ref.read_arc();
            drop(guard);
            self.buffer_pool.unpin_page(current_id, false)?;
            current_id = child_id;
            guard = child_guard;
        }
        Ok(Some((current_id, guard)))
    }

    /// Write-crab from the root to the leaf bounding `key`, keeping every
    /// latch in `ctx` but dropping ancestors above any child that is safe
    /// for this operation. Returns the leaf's page id.
    fn descend_write(
        &self,
        key: &K,
        safety: Safety,
        ctx: &mut LatchContext,
    ) -> Result<Option<PageId>, BTreeError> {
        loop {
            let root_id = self.root_page_id.load(Ordering::SeqCst);
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let page_ref = self.buffer_pool.fetch_page(root_id)?;
            let guard = page_ref.write_arc();
            if self.root_page_id.load(Ordering::SeqCst) == root_id {
                ctx.push(root_id, guard);
                break;
            }
            drop(guard);
            self.buffer_pool.unpin_page(root_id, false)?;
        }

        loop {
            let current_id = ctx.last_page_id().expect("descent holds a page");
            if node::is_leaf(ctx.page(current_id)) {
                return Ok(Some(current_id));
            }
            let child_id = InternalNode::<K>::lookup(ctx.page(current_id), key);
            let child_ref = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_ref.write_arc();
            let safe = is_safe(&child_guard, safety);
            ctx.push(child_id, child_guard);
            if safe {
                ctx.release_ancestors()?;
            }
        }
    }

    /// Point lookup.
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let Some((leaf_id, guard)) = self.descend_read(Some(key))? else {
            return Ok(None);
        };
        let value = LeafNode::<K>::lookup(&guard, key);
        drop(guard);
        self.buffer_pool.unpin_page(leaf_id, false)?;
        Ok(value)
    }

    /// Insert a key/value pair. Returns false (tree unchanged) on a
    /// duplicate key.
    pub fn insert(
        &self,
        key: K,
        value: Rid,
        txn: Option<&Transaction>,
    ) -> Result<bool, BTreeError> {
        loop {
            if self.is_empty() {
                let _guard = self.init_latch.lock();
                if self.is_empty() {
                    self.start_new_tree(key, value)?;
                    return Ok(true);
                }
                continue;
            }

            match self.try_insert_optimistic(key, value)? {
                OptimisticInsert::Done(inserted) => return Ok(inserted),
                OptimisticInsert::Retry => continue,
                OptimisticInsert::MustSplit => {}
            }

            if let Some(inserted) = self.insert_pessimistic(key, value, txn)? {
                return Ok(inserted);
            }
        }
    }

    fn start_new_tree(&self, key: K, value: Rid) -> Result<(), BTreeError> {
        let (page_ref, page_id) = self.buffer_pool.new_page()?;
        {
            let mut page = page_ref.write();
            LeafNode::<K>::init(&mut page, INVALID_PAGE_ID);
            LeafNode::<K>::insert(&mut page, key, value);
        }
        self.buffer_pool.unpin_page(page_id, true)?;
        self.set_root(page_id)
    }

    /// Optimistic protocol: read-crab to the leaf, upgrade its latch, and
    /// insert only if no split can result. The upgrade drops the read
    /// latch first, so every precondition is re-checked under the write
    /// latch.
    fn try_insert_optimistic(&self, key: K, value: Rid) -> Result<OptimisticInsert, BTreeError> {
        let Some((leaf_id, read_guard)) = self.descend_read(Some(&key))? else {
            return Ok(OptimisticInsert::Retry);
        };
        if LeafNode::<K>::lookup(&read_guard, &key).is_some() {
            drop(read_guard);
            self.buffer_pool.unpin_page(leaf_id, false)?;
            return Ok(OptimisticInsert::Done(false));
        }

        let page_ref = ArcRwLockReadGuard::rwlock(&read_guard).clone();
        drop(read_guard);
        let mut write_guard = page_ref.write_arc();

        if LeafNode::<K>::lookup(&write_guard, &key).is_some() {
            drop(write_guard);
            self.buffer_pool.unpin_page(leaf_id, false)?;
            return Ok(OptimisticInsert::Done(false));
        }
        if node::size(&write_guard) + 1 < node::max_size(&write_guard) {
            LeafNode::<K>::insert(&mut write_guard, key, value);
            drop(write_guard);
            self.buffer_pool.unpin_page(leaf_id, true)?;
            return Ok(OptimisticInsert::Done(true));
        }

        drop(write_guard);
        self.buffer_pool.unpin_page(leaf_id, false)?;
        Ok(OptimisticInsert::MustSplit)
    }

    /// Pessimistic insert: write latches down the path, split on overflow.
    /// Returns None if the tree emptied underneath us and the caller must
    /// retry from the top.
    fn insert_pessimistic(
        &self,
        key: K,
        value: Rid,
        txn: Option<&Transaction>,
    ) -> Result<Option<bool>, BTreeError> {
        let mut ctx = LatchContext::new(self.buffer_pool.clone());

        let result: Result<Option<bool>, BTreeError> = (|| {
            let Some(leaf_id) = self.descend_write(&key, Safety::Insert, &mut ctx)? else {
                return Ok(None);
            };

            if LeafNode::<K>::lookup(ctx.page(leaf_id), &key).is_some() {
                ctx.release_all(false)?;
                return Ok(Some(false));
            }

            LeafNode::<K>::insert(ctx.page_mut(leaf_id), key, value);
            if node::size(ctx.page(leaf_id)) == node::max_size(ctx.page(leaf_id)) {
                self.split_leaf(leaf_id, &mut ctx)?;
            }
            ctx.release_all(true)?;
            self.free_deleted_pages(txn, Vec::new())?;
            Ok(Some(true))
        })();

        if result.is_err() {
            // leave no latches behind on the error path
            let _ = ctx.release_all(false);
        }
        result
    }

    /// Split an over-full leaf: allocate a right sibling, move the upper
    /// half across, relink the sibling chain, and push the right page's
    /// first key into the parent.
    fn split_leaf(&self, leaf_id: PageId, ctx: &mut LatchContext) -> Result<(), BTreeError> {
        let (new_ref, new_id) = self.buffer_pool.new_page()?;
        let mut new_guard = new_ref.write_arc();

        LeafNode::<K>::init(&mut new_guard, node::parent_page_id(ctx.page(leaf_id)));
        {
            let leaf = ctx.page_mut(leaf_id);
            LeafNode::<K>::move_half_to(leaf, &mut new_guard);
            node::set_next_page_id(&mut new_guard, node::next_page_id(leaf));
            node::set_next_page_id(leaf, new_id);
        }

        let separator = LeafNode::<K>::key_at(&new_guard, 0);
        self.insert_into_parent(leaf_id, separator, new_id, &mut new_guard, ctx)?;

        drop(new_guard);
        self.buffer_pool.unpin_page(new_id, true)?;
        Ok(())
    }

    /// Hook `new_id` (freshly split off `old_id`, still latched by the
    /// caller as `new_node`) into the parent, splitting upward as needed.
    /// A split of the root grows the tree by one level.
    fn insert_into_parent(
        &self,
        old_id: PageId,
        separator: K,
        new_id: PageId,
        new_node: &mut Page,
        ctx: &mut LatchContext,
    ) -> Result<(), BTreeError> {
        let parent_id = node::parent_page_id(ctx.page(old_id));

        if parent_id == INVALID_PAGE_ID {
            let (root_ref, root_id) = self.buffer_pool.new_page()?;
            {
                let mut root = root_ref.write();
                InternalNode::<K>::init(&mut root, INVALID_PAGE_ID);
                InternalNode::<K>::populate_new_root(&mut root, old_id, separator, new_id);
            }
            self.buffer_pool.unpin_page(root_id, true)?;

            node::set_parent_page_id(ctx.page_mut(old_id), root_id);
            node::set_parent_page_id(new_node, root_id);
            return self.set_root(root_id);
        }

        InternalNode::<K>::insert_node_after(ctx.page_mut(parent_id), old_id, separator, new_id);

        if node::size(ctx.page(parent_id)) == node::max_size(ctx.page(parent_id)) {
            let (right_ref, right_id) = self.buffer_pool.new_page()?;
            let mut right_guard = right_ref.write_arc();

            InternalNode::<K>::init(&mut right_guard, node::parent_page_id(ctx.page(parent_id)));
            let moved = InternalNode::<K>::move_half_to(ctx.page_mut(parent_id), &mut right_guard);
            for child_id in moved {
                if child_id == new_id {
                    node::set_parent_page_id(new_node, right_id);
                } else {
                    self.reparent(child_id, right_id, ctx)?;
                }
            }

            let parent_separator = InternalNode::<K>::key_at(&right_guard, 0);
            self.insert_into_parent(parent_id, parent_separator, right_id, &mut right_guard, ctx)?;

            drop(right_guard);
            self.buffer_pool.unpin_page(right_id, true)?;
        }
        Ok(())
    }

    /// Point a moved child at its new parent, through the held latch when
    /// the child is on our path, with a short write latch otherwise.
    fn reparent(
        &self,
        child_id: PageId,
        parent_id: PageId,
        ctx: &mut LatchContext,
    ) -> Result<(), BTreeError> {
        if ctx.contains(child_id) {
            node::set_parent_page_id(ctx.page_mut(child_id), parent_id);
            return Ok(());
        }
        let child_ref = self.buffer_pool.fetch_page(child_id)?;
        {
            let mut child = child_ref.write();
            node::set_parent_page_id(&mut child, parent_id);
        }
        self.buffer_pool.unpin_page(child_id, true)?;
        Ok(())
    }

    /// Remove `key` if present; absent keys are a silent no-op.
    pub fn remove(&self, key: &K, txn: Option<&Transaction>) -> Result<(), BTreeError> {
        loop {
            if self.is_empty() {
                return Ok(());
            }
            match self.try_remove_optimistic(key)? {
                OptimisticRemove::Done => return Ok(()),
                OptimisticRemove::Retry => continue,
                OptimisticRemove::MustRestructure => {}
            }
            if self.remove_pessimistic(key, txn)? {
                return Ok(());
            }
        }
    }

    fn try_remove_optimistic(&self, key: &K) -> Result<OptimisticRemove, BTreeError> {
        let Some((leaf_id, read_guard)) = self.descend_read(Some(key))? else {
            return Ok(OptimisticRemove::Done);
        };
        if LeafNode::<K>::lookup(&read_guard, key).is_none() {
            drop(read_guard);
            self.buffer_pool.unpin_page(leaf_id, false)?;
            return Ok(OptimisticRemove::Done);
        }

        let page_ref = ArcRwLockReadGuard::rwlock(&read_guard).clone();
        drop(read_guard);
        let mut write_guard = page_ref.write_arc();

        if LeafNode::<K>::lookup(&write_guard, key).is_none() {
            drop(write_guard);
            self.buffer_pool.unpin_page(leaf_id, false)?;
            return Ok(OptimisticRemove::Done);
        }
        if node::size(&write_guard) - 1 > node::min_size(&write_guard) {
            LeafNode::<K>::remove(&mut write_guard, key);
            drop(write_guard);
            self.buffer_pool.unpin_page(leaf_id, true)?;
            return Ok(OptimisticRemove::Done);
        }

        drop(write_guard);
        self.buffer_pool.unpin_page(leaf_id, false)?;
        Ok(OptimisticRemove::MustRestructure)
    }

    /// Pessimistic delete with coalesce-or-redistribute. Returns false if
    /// the tree emptied underneath us and the caller must retry.
    fn remove_pessimistic(
        &self,
        key: &K,
        txn: Option<&Transaction>,
    ) -> Result<bool, BTreeError> {
        let mut ctx = LatchContext::new(self.buffer_pool.clone());
        let mut deleted_pages = Vec::new();

        let result: Result<bool, BTreeError> = (|| {
            let Some(leaf_id) = self.descend_write(key, Safety::Delete, &mut ctx)? else {
                return Ok(false);
            };
            if LeafNode::<K>::lookup(ctx.page(leaf_id), key).is_none() {
                ctx.release_all(false)?;
                return Ok(true);
            }

            LeafNode::<K>::remove(ctx.page_mut(leaf_id), key);
            let delete_leaf = self.coalesce_or_redistribute(leaf_id, &mut ctx, &mut deleted_pages)?;
            if delete_leaf {
                deleted_pages.push(leaf_id);
                if leaf_id == self.root_page_id.load(Ordering::SeqCst) {
                    // the last key of the whole tree is gone
                    self.set_root(INVALID_PAGE_ID)?;
                }
            }

            ctx.release_all(true)?;
            self.free_deleted_pages(txn, deleted_pages)?;
            Ok(true)
        })();

        if result.is_err() {
            let _ = ctx.release_all(false);
        }
        result
    }

    /// Deleted pages are freed only after every latch is released; when a
    /// transaction is supplied they are staged in its deleted-page set.
    fn free_deleted_pages(
        &self,
        txn: Option<&Transaction>,
        deleted_pages: Vec<PageId>,
    ) -> Result<(), BTreeError> {
        match txn {
            Some(txn) => {
                for page_id in deleted_pages {
                    txn.add_deleted_page(page_id);
                }
                for page_id in txn.take_deleted_pages() {
                    self.buffer_pool.delete_page(page_id)?;
                }
            }
            None => {
                for page_id in deleted_pages {
                    self.buffer_pool.delete_page(page_id)?;
                }
            }
        }
        Ok(())
    }

    /// Bring an underflowed node back above minimum occupancy: prefer
    /// borrowing from a sibling, merge when neither can spare, and recurse
    /// into the parent when the merge underflows it. Returns true when the
    /// node itself has been emptied and must be freed by the caller.
    fn coalesce_or_redistribute(
        &self,
        node_id: PageId,
        ctx: &mut LatchContext,
        deleted_pages: &mut Vec<PageId>,
    ) -> Result<bool, BTreeError> {
        if node::size(ctx.page(node_id)) >= node::min_size(ctx.page(node_id)) {
            return Ok(false);
        }

        let parent_id = node::parent_page_id(ctx.page(node_id));
        if parent_id == INVALID_PAGE_ID {
            return self.adjust_root(node_id, ctx);
        }

        let index = InternalNode::<K>::value_index(ctx.page(parent_id), node_id)
            .ok_or_else(|| BTreeError::Corrupted(format!("page {} missing from its parent", node_id)))?;
        let leaf = node::is_leaf(ctx.page(node_id));

        // redistribution takes precedence: try the left sibling
        if index >= 1 {
            let left_id = InternalNode::<K>::value_at(ctx.page(parent_id), index - 1);
            let left_ref = self.buffer_pool.fetch_page(left_id)?;
            let mut left = left_ref.write_arc();
            if node::size(&left) > node::min_size(&left) {
                if leaf {
                    let separator =
                        LeafNode::<K>::move_last_to_front_of(&mut left, ctx.page_mut(node_id));
                    InternalNode::<K>::set_key_at(ctx.page_mut(parent_id), index, &separator);
                } else {
                    let old_separator = InternalNode::<K>::key_at(ctx.page(parent_id), index);
                    let (separator, moved_child) = InternalNode::<K>::move_last_to_front_of(
                        &mut left,
                        ctx.page_mut(node_id),
                        old_separator,
                    );
                    InternalNode::<K>::set_key_at(ctx.page_mut(parent_id), index, &separator);
                    self.reparent(moved_child, node_id, ctx)?;
                }
                drop(left);
                self.buffer_pool.unpin_page(left_id, true)?;
                return Ok(false);
            }
            drop(left);
            self.buffer_pool.unpin_page(left_id, false)?;
        }

        // then the right sibling
        if index + 1 < node::size(ctx.page(parent_id)) {
            let right_id = InternalNode::<K>::value_at(ctx.page(parent_id), index + 1);
            let right_ref = self.buffer_pool.fetch_page(right_id)?;
            let mut right = right_ref.write_arc();
            if node::size(&right) > node::min_size(ctx.page(node_id)) {
                if leaf {
                    let separator =
                        LeafNode::<K>::move_first_to_end_of(&mut right, ctx.page_mut(node_id));
                    InternalNode::<K>::set_key_at(ctx.page_mut(parent_id), index + 1, &separator);
                } else {
                    let old_separator = InternalNode::<K>::key_at(ctx.page(parent_id), index + 1);
                    let (separator, moved_child) = InternalNode::<K>::move_first_to_end_of(
                        &mut right,
                        ctx.page_mut(node_id),
                        old_separator,
                    );
                    InternalNode::<K>::set_key_at(ctx.page_mut(parent_id), index + 1, &separator);
                    self.reparent(moved_child, node_id, ctx)?;
                }
                drop(right);
                self.buffer_pool.unpin_page(right_id, true)?;
                return Ok(false);
            }
            drop(right);
            self.buffer_pool.unpin_page(right_id, false)?;
        }

        // no sibling can spare an entry: merge
        let mut node_deleted = false;
        if index >= 1 {
            // fold this node into its left sibling
            let left_id = InternalNode::<K>::value_at(ctx.page(parent_id), index - 1);
            let left_ref = self.buffer_pool.fetch_page(left_id)?;
            let mut left = left_ref.write_arc();
            let fits = node::size(&left) + node::size(ctx.page(node_id))
                < node::max_size(ctx.page(node_id));
            if fits {
                if leaf {
                    LeafNode::<K>::move_all_to(ctx.page_mut(node_id), &mut left);
                } else {
                    let middle_key = InternalNode::<K>::key_at(ctx.page(parent_id), index);
                    let moved = InternalNode::<K>::move_all_to(
                        ctx.page_mut(node_id),
                        &mut left,
                        middle_key,
                    );
                    for child_id in moved {
                        self.reparent(child_id, left_id, ctx)?;
                    }
                }
                InternalNode::<K>::remove_at(ctx.page_mut(parent_id), index);
                node_deleted = true;
            }
            drop(left);
            self.buffer_pool.unpin_page(left_id, fits)?;
        }

        if !node_deleted && index + 1 < node::size(ctx.page(parent_id)) {
            // fold the right sibling into this node
            let right_id = InternalNode::<K>::value_at(ctx.page(parent_id), index + 1);
            let right_ref = self.buffer_pool.fetch_page(right_id)?;
            let mut right = right_ref.write_arc();
            let fits = node::size(&right) + node::size(ctx.page(node_id))
                < node::max_size(ctx.page(node_id));
            if fits {
                if leaf {
                    LeafNode::<K>::move_all_to(&mut right, ctx.page_mut(node_id));
                } else {
                    let middle_key = InternalNode::<K>::key_at(ctx.page(parent_id), index + 1);
                    let moved = InternalNode::<K>::move_all_to(
                        &mut right,
                        ctx.page_mut(node_id),
                        middle_key,
                    );
                    for child_id in moved {
                        self.reparent(child_id, node_id, ctx)?;
                    }
                }
                InternalNode::<K>::remove_at(ctx.page_mut(parent_id), index + 1);
                deleted_pages.push(right_id);
            }
            drop(right);
            self.buffer_pool.unpin_page(right_id, false)?;
        }

        let parent_deleted = self.coalesce_or_redistribute(parent_id, ctx, deleted_pages)?;
        if parent_deleted {
            deleted_pages.push(parent_id);
        }
        Ok(node_deleted)
    }

    /// The root is exempt from minimum occupancy, but collapses in two
    /// cases: an internal root left with a single child hands the root
    /// role to that child, and an emptied leaf root empties the tree.
    /// Returns true when the old root page must be freed.
    fn adjust_root(&self, root_id: PageId, ctx: &mut LatchContext) -> Result<bool, BTreeError> {
        if node::is_leaf(ctx.page(root_id)) {
            return Ok(node::size(ctx.page(root_id)) == 0);
        }

        if node::size(ctx.page(root_id)) == 1 {
            let child_id = InternalNode::<K>::value_at(ctx.page(root_id), 0);
            self.reparent(child_id, INVALID_PAGE_ID, ctx)?;
            self.set_root(child_id)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Iterator over all `(key, rid)` pairs in ascending key order.
    pub fn iter(&self) -> Result<TreeIterator<K>, BTreeError> {
        match self.descend_read(None)? {
            Some((leaf_id, guard)) => Ok(TreeIterator::new(
                self.buffer_pool.clone(),
                leaf_id,
                guard,
                0,
            )),
            None => Ok(TreeIterator::empty(self.buffer_pool.clone())),
        }
    }

    /// Iterator starting at the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<K>, BTreeError> {
        match self.descend_read(Some(key))? {
            Some((leaf_id, guard)) => {
                let slot = LeafNode::<K>::key_index(&guard, key);
                Ok(TreeIterator::new(
                    self.buffer_pool.clone(),
                    leaf_id,
                    guard,
                    slot,
                ))
            }
            None => Ok(TreeIterator::empty(self.buffer_pool.clone())),
        }
    }

    /// Walk the whole tree and check its structural invariants: separator
    /// keys bound their subtrees, parent pointers are consistent, non-root
    /// nodes respect min/max occupancy, and the sibling chain visits every
    /// leaf in key order. Intended for tests on a quiescent tree.
    pub fn verify_integrity(&self) -> Result<(), BTreeError> {
        let root_id = self.root_page_id.load(Ordering::SeqCst);
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut leaves = Vec::new();
        self.verify_subtree(root_id, INVALID_PAGE_ID, true, &mut leaves)?;

        // the sibling chain must visit exactly the leaves, in order
        let mut chained = Vec::new();
        let mut current = leaves
            .first()
            .copied()
            .ok_or_else(|| BTreeError::Corrupted("tree has a root but no leaves".into()))?;
        loop {
            chained.push(current);
            let page_ref = self.buffer_pool.fetch_page(current)?;
            let next = {
                let page = page_ref.read();
                node::next_page_id(&page)
            };
            self.buffer_pool.unpin_page(current, false)?;
            if next == INVALID_PAGE_ID {
                break;
            }
            current = next;
        }
        if chained != leaves {
            return Err(BTreeError::Corrupted(format!(
                "sibling chain {:?} does not match tree order {:?}",
                chained, leaves
            )));
        }
        Ok(())
    }

    /// Returns the smallest key in the subtree and appends its leaves in
    /// left-to-right order.
    fn verify_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        is_root: bool,
        leaves: &mut Vec<PageId>,
    ) -> Result<K, BTreeError> {
        let page_ref = self.buffer_pool.fetch_page(page_id)?;
        let page = page_ref.read();

        let size = node::size(&page);
        let corrupt = |what: String| BTreeError::Corrupted(format!("page {}: {}", page_id, what));

        if node::parent_page_id(&page) != expected_parent {
            let found = node::parent_page_id(&page);
            drop(page);
            self.buffer_pool.unpin_page(page_id, false)?;
            return Err(corrupt(format!(
                "parent pointer {} != expected {}",
                found, expected_parent
            )));
        }
        if !is_root && (size < node::min_size(&page) || size > node::max_size(&page)) {
            let (min, max) = (node::min_size(&page), node::max_size(&page));
            drop(page);
            self.buffer_pool.unpin_page(page_id, false)?;
            return Err(corrupt(format!("size {} outside [{}, {}]", size, min, max)));
        }

        if node::is_leaf(&page) {
            if size == 0 && !is_root {
                drop(page);
                self.buffer_pool.unpin_page(page_id, false)?;
                return Err(corrupt("empty non-root leaf".into()));
            }
            let mut previous = None;
            for i in 0..size {
                let key = LeafNode::<K>::key_at(&page, i);
                if let Some(prev) = previous {
                    if key <= prev {
                        drop(page);
                        self.buffer_pool.unpin_page(page_id, false)?;
                        return Err(corrupt(format!("keys not ascending at slot {}", i)));
                    }
                }
                previous = Some(key);
            }
            let min_key = LeafNode::<K>::key_at(&page, 0);
            drop(page);
            self.buffer_pool.unpin_page(page_id, false)?;
            leaves.push(page_id);
            return Ok(min_key);
        }

        // internal node: copy out entries, release, then recurse
        let entries: Vec<(K, PageId)> = (0..size)
            .map(|i| {
                (
                    InternalNode::<K>::key_at(&page, i),
                    InternalNode::<K>::value_at(&page, i),
                )
            })
            .collect();
        drop(page);
        self.buffer_pool.unpin_page(page_id, false)?;

        let mut subtree_min = None;
        for (i, (separator, child_id)) in entries.iter().enumerate() {
            let child_min = self.verify_subtree(*child_id, page_id, false, leaves)?;
            if i == 0 {
                subtree_min = Some(child_min);
            } else {
                if child_min != *separator {
                    return Err(corrupt(format!(
                        "separator {:?} at slot {} is not its subtree's minimum {:?}",
                        separator, i, child_min
                    )));
                }
                if *separator <= entries[i - 1].0 && i > 1 {
                    return Err(corrupt(format!("separators not ascending at slot {}", i)));
                }
            }
        }
        subtree_min.ok_or_else(|| corrupt("internal node with no children".into()))
    }
}
