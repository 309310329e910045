mod waker_node;
pub(crate) use waker_node::{Detach, Progress, WakerNode};

use parking_lot::{Mutex, RwLock};
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use hashbrown::hash_map::HashMap;
use hashbrown::raw::RawTable;

/// The sharded store behind a [`crate::SingleFlightCache`].
///
/// Resolved values are append only: once a key has an entry it is never replaced or removed.
pub(crate) struct Store<K, V, E, S> {
    pub(crate) build_hasher: S,
    shards: Box<[Shard<K, V, E>]>,
}

pub(crate) struct Shard<K, V, E> {
    /// In flight fetches for keys in this shard.
    ///
    /// This lock guards the transition from no record to pending, and from pending to resolved.
    pub(crate) pending: Mutex<HashMap<K, Arc<WakerNode<V, E>>>>,
    table: RwLock<RawTable<Entry<K, V>>>,
}

struct Entry<K, V> {
    key: K,
    value: V,
}

impl<K, V, E, S> Store<K, V, E, S> {
    pub(crate) fn from_shards(shards: Box<[Shard<K, V, E>]>, build_hasher: S) -> Self {
        debug_assert!(!shards.is_empty(), "store needs at least one shard");

        Store {
            build_hasher,
            shards,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.table.read().len()).sum()
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl<K, V, E, S> Store<K, V, E, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub(crate) fn shard(&self, key: &K) -> (u64, &Shard<K, V, E>) {
        let hash = hash_key(&self.build_hasher, key);

        // shard counts are always a power of two
        let idx = hash as usize & (self.shards.len() - 1);
        (hash, &self.shards[idx])
    }

    pub(crate) fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let (hash, shard) = self.shard(key);

        shard.get(key, hash)
    }

    pub(crate) fn is_pending(&self, key: &K) -> bool {
        let (_, shard) = self.shard(key);

        shard.pending.lock().contains_key(key)
    }
}

impl<K, V, E> Shard<K, V, E> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Shard {
            pending: Mutex::new(HashMap::new()),
            table: RwLock::new(RawTable::with_capacity(capacity)),
        }
    }
}

impl<K, V, E> Shard<K, V, E>
where
    K: Eq + Hash,
{
    /// Insert a value for a key that has no entry yet.
    ///
    /// If the key already has an entry it is left untouched and its value is returned.
    pub(crate) fn insert<S: BuildHasher>(
        &self,
        key: K,
        value: V,
        hash: u64,
        build_hasher: &S,
    ) -> Option<V>
    where
        V: Clone,
    {
        let mut table = self.table.write();

        match table.find_or_find_insert_slot(
            hash,
            |e| eq_key(&key, &e.key),
            |e| hash_key(build_hasher, &e.key),
        ) {
            // saftey: we hold an exclusive lock on the table
            Ok(bucket) => unsafe { Some(bucket.as_ref().value.clone()) },
            Err(slot) => {
                let entry = Entry { key, value };
                unsafe {
                    table.insert_in_slot(hash, slot, entry);
                }

                None
            }
        }
    }

    pub(crate) fn get(&self, key: &K, hash: u64) -> Option<V>
    where
        V: Clone,
    {
        let table = self.table.read();

        table
            .get(hash, |e| eq_key(key, &e.key))
            .map(|e| e.value.clone())
    }
}

pub(crate) fn eq_key<K: Eq>(a: &K, b: &K) -> bool {
    a.eq(b)
}

pub(crate) fn hash_key<K, S>(build_hasher: &S, key: &K) -> u64
where
    K: Hash,
    S: BuildHasher,
{
    build_hasher.hash_one(key)
}

pub(crate) fn max_parallelism() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static AVAILABLE_PARALLELISM: AtomicUsize = AtomicUsize::new(0);
    let mut ap = AVAILABLE_PARALLELISM.load(Ordering::Relaxed);
    if ap == 0 {
        ap = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        AVAILABLE_PARALLELISM.store(ap, Ordering::Relaxed);
    }
    ap
}
