use std::collections::hash_map::DefaultHasher;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};

/// Concurrent extendible hash table, used by the buffer pool as its page
/// table (K = page id, V = frame index).
///
/// The directory has 2^g slots for global depth g; each slot points to a
/// bucket with local depth d <= g, and all slots whose low d bits agree
/// share the same bucket. Resizes take the directory latch, payload edits
/// take the bucket latch; the lock order is always directory -> bucket.
pub struct ExtendibleHashTable<K, V> {
    bucket_capacity: usize,
    dir: RwLock<Directory<K, V>>,
    hasher: BuildHasherDefault<DefaultHasher>,
}

struct Directory<K, V> {
    global_depth: u32,
    slots: Vec<Arc<Bucket<K, V>>>,
}

struct Bucket<K, V> {
    data: Mutex<BucketData<K, V>>,
}

struct BucketData<K, V> {
    depth: u32,
    entries: Vec<(K, V)>,
}

impl<K, V> Bucket<K, V> {
    fn new(depth: u32) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(BucketData {
                depth,
                entries: Vec::new(),
            }),
        })
    }
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// `bucket_capacity` is the number of entries a bucket holds before it
    /// must split.
    pub fn new(bucket_capacity: usize) -> Self {
        let slots = vec![Bucket::new(1), Bucket::new(1)];
        Self {
            bucket_capacity,
            dir: RwLock::new(Directory {
                global_depth: 1,
                slots,
            }),
            hasher: BuildHasherDefault::default(),
        }
    }

    fn hash_key(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    fn bucket_index(hash: u64, global_depth: u32) -> usize {
        (hash & ((1u64 << global_depth) - 1)) as usize
    }

    pub fn global_depth(&self) -> u32 {
        self.dir.read().global_depth
    }

    pub fn local_depth(&self, slot: usize) -> u32 {
        let dir = self.dir.read();
        let bucket = dir.slots[slot].clone();
        drop(dir);
        let depth = bucket.data.lock().depth;
        depth
    }

    pub fn num_slots(&self) -> usize {
        self.dir.read().slots.len()
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let hash = self.hash_key(key);
        let dir = self.dir.read();
        let bucket = dir.slots[Self::bucket_index(hash, dir.global_depth)].clone();
        drop(dir);

        let data = bucket.data.lock();
        data.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hash_key(key);
        let dir = self.dir.read();
        let bucket = dir.slots[Self::bucket_index(hash, dir.global_depth)].clone();
        drop(dir);

        let mut data = bucket.data.lock();
        match data.entries.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                data.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Insert a key/value pair, replacing any existing entry for the key.
    /// Splits the target bucket while it exceeds capacity, doubling the
    /// directory whenever the bucket's local depth equals the global depth.
    pub fn insert(&self, key: K, value: V) {
        let hash = self.hash_key(&key);

        let overflowed = {
            let dir = self.dir.read();
            let bucket = dir.slots[Self::bucket_index(hash, dir.global_depth)].clone();
            drop(dir);

            let mut data = bucket.data.lock();
            if let Some(entry) = data.entries.iter_mut().find(|(k, _)| *k == key) {
                entry.1 = value;
                return;
            }
            data.entries.push((key, value));
            data.entries.len() > self.bucket_capacity
        };

        if overflowed {
            self.split(hash);
        }
    }

    /// Split the bucket containing `hash` until it is back under capacity.
    /// Holding the directory write latch for the whole split keeps the
    /// directory -> bucket order and serializes concurrent resizes.
    fn split(&self, hash: u64) {
        let mut dir = self.dir.write();

        loop {
            let slot = Self::bucket_index(hash, dir.global_depth);
            let bucket = dir.slots[slot].clone();
            let mut data = bucket.data.lock();
            if data.entries.len() <= self.bucket_capacity {
                return;
            }

            if data.depth == dir.global_depth {
                // double the directory: slot i+2^g aliases slot i
                let old_len = dir.slots.len();
                for i in 0..old_len {
                    let alias = dir.slots[i].clone();
                    dir.slots.push(alias);
                }
                dir.global_depth += 1;
            }

            let depth = data.depth;
            let diff_bit = 1u64 << depth;

            let b0 = Bucket::new(depth + 1);
            let b1 = Bucket::new(depth + 1);
            {
                let mut d0 = b0.data.lock();
                let mut d1 = b1.data.lock();
                for (k, v) in data.entries.drain(..) {
                    if self.hash_key(&k) & diff_bit == 0 {
                        d0.entries.push((k, v));
                    } else {
                        d1.entries.push((k, v));
                    }
                }
            }

            // repoint every directory slot that aliased the split bucket
            let low_bits = (hash & (diff_bit - 1)) as usize;
            let mask = (diff_bit - 1) as usize;
            for i in 0..dir.slots.len() {
                if i & mask == low_bits {
                    dir.slots[i] = if i as u64 & diff_bit == 0 {
                        b0.clone()
                    } else {
                        b1.clone()
                    };
                }
            }
            // loop again in case one side is still over capacity
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_insert_find_remove() {
        let table: ExtendibleHashTable<i32, String> = ExtendibleHashTable::new(4);

        table.insert(1, "one".to_string());
        table.insert(2, "two".to_string());

        assert_eq!(table.find(&1), Some("one".to_string()));
        assert_eq!(table.find(&2), Some("two".to_string()));
        assert_eq!(table.find(&3), None);

        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert_eq!(table.find(&1), None);
    }

    #[test]
    fn test_insert_replaces_existing_key() {
        let table: ExtendibleHashTable<i32, i32> = ExtendibleHashTable::new(4);
        table.insert(5, 50);
        table.insert(5, 55);
        assert_eq!(table.find(&5), Some(55));
    }

    #[test]
    fn test_split_grows_directory() {
        let table: ExtendibleHashTable<i32, i32> = ExtendibleHashTable::new(2);
        for i in 0..64 {
            table.insert(i, i * 10);
        }
        assert!(table.global_depth() > 1);
        assert_eq!(table.num_slots(), 1 << table.global_depth());
        for i in 0..64 {
            assert_eq!(table.find(&i), Some(i * 10), "key {} lost in split", i);
        }
    }

    #[test]
    fn test_alias_invariant_after_splits() {
        let table: ExtendibleHashTable<i32, i32> = ExtendibleHashTable::new(1);
        for i in 0..128 {
            table.insert(i, i);
        }
        // every slot's local depth divides the directory: slots agreeing in
        // their low d bits must resolve to the same entries
        let g = table.global_depth();
        for slot in 0..(1usize << g) {
            let d = table.local_depth(slot);
            assert!(d <= g);
        }
        for i in 0..128 {
            assert_eq!(table.find(&i), Some(i));
        }
    }

    #[test]
    fn test_concurrent_inserts() {
        let table: Arc<ExtendibleHashTable<u32, u32>> = Arc::new(ExtendibleHashTable::new(4));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                for i in 0..256u32 {
                    let key = t * 1000 + i;
                    table.insert(key, key + 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..4u32 {
            for i in 0..256u32 {
                let key = t * 1000 + i;
                assert_eq!(table.find(&key), Some(key + 1));
            }
        }
    }
}
