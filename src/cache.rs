mod get_or_insert;

pub use get_or_insert::GetOrTryInsertFuture;

use crate::builder::CacheBuilder;
use crate::map::Store;

pub use hashbrown::hash_map::DefaultHashBuilder;

use pin_project::pin_project;

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::hash::{BuildHasher, Hash};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// A concurrent cache that runs at most one fetch per key and shares its result with every caller.
///
/// Cloning the cache is cheap, clones share the same store.
///
/// `E` is the error type of the fetches run through this cache. Caches created with the default
/// [`Infallible`] can use [`Self::get_or_insert`].
pub struct SingleFlightCache<K, V, E = Infallible, S = DefaultHashBuilder> {
    pub(crate) store: Arc<Store<K, V, E, S>>,
}

impl<K, V, E, S> Clone for SingleFlightCache<K, V, E, S> {
    fn clone(&self) -> Self {
        SingleFlightCache {
            store: self.store.clone(),
        }
    }
}

impl<K, V, E> SingleFlightCache<K, V, E> {
    pub fn new() -> Self {
        CacheBuilder::new().build()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        CacheBuilder::new().estimated_size(capacity).build()
    }
}

impl<K, V, E> Default for SingleFlightCache<K, V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E, S: BuildHasher> SingleFlightCache<K, V, E, S> {
    pub fn with_hasher(build_hasher: S) -> Self {
        CacheBuilder::new().build_with_hasher(build_hasher)
    }
}

impl<K, V, E, S> SingleFlightCache<K, V, E, S> {
    /// The number of resolved entries
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shards(&self) -> usize {
        self.store.shard_count()
    }
}

impl<K, V, E, S> SingleFlightCache<K, V, E, S>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    S: BuildHasher,
{
    /// Get the value for `key`, running `init` to fetch it if no one has yet.
    ///
    /// - If the key is resolved, the value is returned right away and `init` is never called.
    /// - If another task is already fetching the key, this waits for that fetch and returns its result,
    ///   whether that is a value or an error.
    /// - Otherwise this task registers the fetch before calling `init`, so any task arriving
    ///   afterwards waits on it instead of starting its own.
    ///
    /// On success the value is stored for good. On failure nothing is stored and every waiter gets a clone
    /// of the error, the next call for the key starts a new fetch.
    ///
    /// ### Note
    /// Once created, the fetch belongs to every task waiting on the key and whichever of them is polled drives it.
    /// Dropping any one of them (a timeout, a `select!`) leaves the fetch running for the rest, it is only
    /// cancelled when every task waiting on it has been dropped. This is why the fetch must be `Send + 'static`.
    ///
    /// If `init` or the fetch panics, the task that called `init` panics too while the others wake up
    /// and one of them starts over with its own `init`.
    pub fn get_or_try_insert<F, Fut>(&self, key: K, init: F) -> GetOrTryInsertFuture<'_, K, V, E, S, F>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        GetOrTryInsertFuture::new(&self.store, key, init)
    }
}

impl<K, V, E, S> SingleFlightCache<K, V, E, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Try to get a resolved value from the cache
    ///
    /// This never waits on a pending fetch, keys that are still being fetched return `None`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.store.get(key)
    }

    /// Is a fetch currently running for this key
    pub fn is_pending(&self, key: &K) -> bool {
        self.store.is_pending(key)
    }
}

impl<K, V, S> SingleFlightCache<K, V, Infallible, S>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + 'static,
    S: BuildHasher,
{
    /// Get or insert the value for the given key
    ///
    /// The infallible form of [`Self::get_or_try_insert`].
    pub async fn get_or_insert<F, Fut>(&self, key: K, init: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let fetch = move || Infallibly { fut: init() };

        match self.get_or_try_insert(key, fetch).await {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }
}

/// Lifts a fetch that cant fail into one the cache can run.
#[pin_project]
struct Infallibly<Fut> {
    #[pin]
    fut: Fut,
}

impl<Fut: Future> Future for Infallibly<Fut> {
    type Output = Result<Fut::Output, Infallible>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().fut.poll(cx).map(Ok)
    }
}

impl<K, V, E, S> fmt::Debug for SingleFlightCache<K, V, E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightCache")
            .field("len", &self.len())
            .field("shards", &self.shards())
            .finish_non_exhaustive()
    }
}
