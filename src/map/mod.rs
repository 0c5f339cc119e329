//! Sharded concurrent map.
//!
//! A thread-safe associative container partitioned into a fixed number of
//! independently locked bins. Per-key operations contend only with other
//! operations hashing to the same bin, so with more bins than worker threads
//! contention is rare. There is no resize or rehash: a degenerate hash
//! distribution degrades to per-bin contention instead of a stop-the-world
//! rebuild.
//!
//! Two lock-carrying guards make compound operations safe without a second
//! lookup:
//!
//! - [`ShardedMap::find`] returns a guard that dereferences to the found
//!   value and holds its bin's lock until dropped.
//! - [`ShardedMap::lock_bin`] locks the bin a key hashes to and exposes
//!   `get`/`insert`/`remove` on it, making check-then-insert atomic.
//!
//! Whole-map traversal ([`ShardedMap::for_each`], [`ShardedMap::retain`])
//! locks one bin at a time, in bin order; iteration order is an artifact of
//! bin assignment and must not be relied upon.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

/// Default bin count. Larger than the thread count of typical render farms'
/// per-host workers so that two threads rarely share a bin.
pub const DEFAULT_BINS: usize = 32;

// Fibonacci multiplier used to re-mix the caller's hash before bin
// selection, so bin choice does not correlate with the per-bin HashMap's
// own bucket choice.
const HASH_MIX: u64 = 0x9e37_79b9_7f4a_7c15;

struct Bin<K, V> {
    map: Mutex<HashMap<K, V>>,
}

/// A key/value store sharded across independently locked bins.
pub struct ShardedMap<K, V> {
    bins: Box<[Bin<K, V>]>,
    mask: u64,
    hasher: RandomState,
}

impl<K: Hash + Eq, V> ShardedMap<K, V> {
    pub fn new() -> Self {
        Self::with_bins(DEFAULT_BINS)
    }

    /// Create a map with at least `bins` bins (rounded up to a power of two).
    pub fn with_bins(bins: usize) -> Self {
        let count = bins.max(1).next_power_of_two();
        let bins = (0..count)
            .map(|_| Bin {
                map: Mutex::new(HashMap::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            bins,
            mask: (count - 1) as u64,
            hasher: RandomState::new(),
        }
    }

    fn bin_for<Q>(&self, key: &Q) -> &Bin<K, V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mixed = self.hasher.hash_one(key).wrapping_mul(HASH_MIX);
        // High bits of the product are the best mixed.
        let index = ((mixed >> 32) & self.mask) as usize;
        &self.bins[index]
    }

    /// Look up `key`, returning a lock-holding guard that dereferences to the
    /// value. The bin stays locked until the guard is dropped, so the caller
    /// can read the value without racing a concurrent erase.
    pub fn find<Q>(&self, key: &Q) -> Option<FindGuard<'_, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = self.bin_for(key).map.lock();
        MutexGuard::try_map(guard, |m| m.get_mut(key))
            .ok()
            .map(|inner| FindGuard { inner })
    }

    /// Look up `key` and clone the value out, holding the bin lock only for
    /// the duration of the lookup.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.bin_for(key).map.lock().get(key).cloned()
    }

    /// Insert `value` under `key`. Returns `false` without modification if
    /// the key is already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut map = self.bin_for(&key).map.lock();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, value);
        true
    }

    /// Remove `key` if present. Returns whether anything was removed.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.bin_for(key).map.lock().remove(key).is_some()
    }

    /// Lock the bin `key` hashes to and return a guard for compound
    /// read-check-then-write operations. All keys touched through the guard
    /// must hash to the same bin as `key`; the guard enforces nothing beyond
    /// holding the one lock.
    pub fn lock_bin<Q>(&self, key: &Q) -> BinGuard<'_, K, V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        BinGuard {
            map: self.bin_for(key).map.lock(),
        }
    }

    /// Visit every entry, locking one bin at a time.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        for bin in self.bins.iter() {
            let map = bin.map.lock();
            for (k, v) in map.iter() {
                f(k, v);
            }
        }
    }

    /// Keep only the entries for which `f` returns true, one bin at a time.
    pub fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        for bin in self.bins.iter() {
            bin.map.lock().retain(|k, v| f(k, v));
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        for bin in self.bins.iter() {
            bin.map.lock().clear();
        }
    }

    /// Total entry count, summed bin by bin. A point-in-time figure, not a
    /// consistent snapshot under concurrent mutation.
    pub fn len(&self) -> usize {
        self.bins.iter().map(|b| b.map.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.iter().all(|b| b.map.lock().is_empty())
    }

    /// Number of bins (always a power of two).
    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }
}

impl<K: Hash + Eq, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Guards
// =============================================================================

/// Result of a successful [`ShardedMap::find`]: dereferences to the value
/// and releases the bin lock on drop.
pub struct FindGuard<'a, V> {
    inner: MappedMutexGuard<'a, V>,
}

impl<V> std::ops::Deref for FindGuard<'_, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.inner
    }
}

/// Exclusive access to one bin, returned by [`ShardedMap::lock_bin`].
pub struct BinGuard<'a, K, V> {
    map: MutexGuard<'a, HashMap<K, V>>,
}

impl<K: Hash + Eq, V> BinGuard<'_, K, V> {
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key)
    }

    /// Insert or replace, returning the previous value if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(key)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_insert_find_erase() {
        let map: ShardedMap<String, u32> = ShardedMap::new();
        assert!(map.is_empty());

        assert!(map.insert("a".to_string(), 1));
        assert!(map.insert("b".to_string(), 2));
        assert!(!map.insert("a".to_string(), 99), "no replace on insert");

        assert_eq!(map.get(&"a".to_string()), Some(1));
        assert_eq!(map.len(), 2);

        assert!(map.erase(&"a".to_string()));
        assert!(!map.erase(&"a".to_string()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_find_guard_holds_value() {
        let map: ShardedMap<u64, String> = ShardedMap::new();
        map.insert(7, "seven".to_string());

        let guard = map.find(&7).unwrap();
        assert_eq!(&*guard, "seven");
        drop(guard);

        assert!(map.find(&8).is_none());
    }

    #[test]
    fn test_lock_bin_check_then_insert() {
        let map: ShardedMap<u32, u32> = ShardedMap::new();
        {
            let mut bin = map.lock_bin(&5);
            assert!(!bin.contains(&5));
            bin.insert(5, 50);
            assert_eq!(bin.get(&5), Some(&50));
        }
        assert_eq!(map.get(&5), Some(50));
    }

    #[test]
    fn test_bin_count_rounds_to_power_of_two() {
        let map: ShardedMap<u32, u32> = ShardedMap::with_bins(5);
        assert_eq!(map.bin_count(), 8);
        let map: ShardedMap<u32, u32> = ShardedMap::with_bins(0);
        assert_eq!(map.bin_count(), 1);
    }

    #[test]
    fn test_for_each_and_retain() {
        let map: ShardedMap<u32, u32> = ShardedMap::with_bins(4);
        for i in 0..100 {
            map.insert(i, i * 10);
        }

        let mut sum = 0u64;
        map.for_each(|_, v| sum += *v as u64);
        assert_eq!(sum, (0..100u64).map(|i| i * 10).sum());

        map.retain(|k, _| k % 2 == 0);
        assert_eq!(map.len(), 50);
    }

    #[test]
    fn test_clear() {
        let map: ShardedMap<u32, u32> = ShardedMap::new();
        for i in 0..10 {
            map.insert(i, i);
        }
        map.clear();
        assert!(map.is_empty());
    }

    // Size equals successful inserts minus successful erases, across threads.
    #[test]
    fn test_concurrent_size_invariant() {
        let map: Arc<ShardedMap<u64, u64>> = Arc::new(ShardedMap::new());
        let threads = 8;
        let per_thread = 500u64;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let map = map.clone();
                thread::spawn(move || {
                    let base = t as u64 * 10_000;
                    let mut inserted = 0i64;
                    for i in 0..per_thread {
                        if map.insert(base + i, i) {
                            inserted += 1;
                        }
                    }
                    // Erase every other key we own.
                    for i in (0..per_thread).step_by(2) {
                        if map.erase(&(base + i)) {
                            inserted -= 1;
                        }
                    }
                    inserted
                })
            })
            .collect();

        let expected: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(map.len() as i64, expected);
    }

    // find never observes a partially constructed value: each value encodes
    // its key, and every observation must be consistent.
    #[test]
    fn test_concurrent_find_sees_consistent_values() {
        let map: Arc<ShardedMap<u64, (u64, u64)>> = Arc::new(ShardedMap::with_bins(8));

        let writer = {
            let map = map.clone();
            thread::spawn(move || {
                for i in 0..2_000u64 {
                    map.insert(i % 64, (i, i.wrapping_mul(3)));
                    map.erase(&(i % 64));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let map = map.clone();
                thread::spawn(move || {
                    for i in 0..2_000u64 {
                        if let Some(guard) = map.find(&(i % 64)) {
                            let (a, b) = *guard;
                            assert_eq!(b, a.wrapping_mul(3));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
