use linked_hash_map::LinkedHashMap;

use crate::common::types::FrameId;

/// LRU victim selection over the frames that are eligible for eviction.
/// The buffer pool inserts a frame when its pin count drops to zero and
/// removes it again when the frame is re-pinned.
pub struct LruReplacer {
    // insertion-ordered: front = least recently unpinned
    lru: LinkedHashMap<FrameId, ()>,
}

impl LruReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            lru: LinkedHashMap::with_capacity(pool_size),
        }
    }

    /// Make a frame eligible for eviction (moves it to most-recent if it
    /// already was).
    pub fn insert(&mut self, frame_id: FrameId) {
        self.lru.remove(&frame_id);
        self.lru.insert(frame_id, ());
    }

    /// Remove a frame from consideration, e.g. because it was pinned.
    pub fn remove(&mut self, frame_id: FrameId) {
        self.lru.remove(&frame_id);
    }

    /// Evict the least recently used frame, if any.
    pub fn victim(&mut self) -> Option<FrameId> {
        self.lru.pop_front().map(|(frame_id, _)| frame_id)
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_order_is_lru() {
        let mut replacer = LruReplacer::new(8);
        replacer.insert(1);
        replacer.insert(2);
        replacer.insert(3);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_reinsert_refreshes_recency() {
        let mut replacer = LruReplacer::new(8);
        replacer.insert(1);
        replacer.insert(2);
        replacer.insert(1);

        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(1));
    }

    #[test]
    fn test_remove_excludes_frame() {
        let mut replacer = LruReplacer::new(8);
        replacer.insert(1);
        replacer.insert(2);
        replacer.remove(1);

        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), None);
    }
}
