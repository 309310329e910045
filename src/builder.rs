use crate::map::{max_parallelism, Shard, Store};
use crate::SingleFlightCache;

use hashbrown::hash_map::DefaultHashBuilder;

use std::hash::BuildHasher;
use std::sync::Arc;

/// Configures how a [`SingleFlightCache`] lays out its store.
///
/// ```
/// use single_flight_cache::{CacheBuilder, SingleFlightCache};
///
/// let cache: SingleFlightCache<String, u64> = CacheBuilder::new()
///     .shards(8)
///     .estimated_size(1024)
///     .build();
///
/// assert_eq!(cache.shards(), 8);
/// ```
#[derive(Clone, Debug, Default)]
pub struct CacheBuilder {
    pub(crate) shards: Option<usize>,
    pub(crate) estimated_size: Option<usize>,
}

impl CacheBuilder {
    pub fn new() -> Self {
        CacheBuilder {
            shards: None,
            estimated_size: None,
        }
    }

    /// The number of shards, rounded up to the next power of two.
    ///
    /// Defaults to four times the available parallelism.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// How many keys you expect to cache, used to presize each shard.
    pub fn estimated_size(mut self, estimated_size: usize) -> Self {
        self.estimated_size = Some(estimated_size);
        self
    }

    pub fn build<K, V, E>(self) -> SingleFlightCache<K, V, E> {
        self.build_with_hasher(DefaultHashBuilder::default())
    }

    pub fn build_with_hasher<K, V, E, S: BuildHasher>(
        self,
        build_hasher: S,
    ) -> SingleFlightCache<K, V, E, S> {
        SingleFlightCache {
            store: Arc::new(self.build_store(build_hasher)),
        }
    }

    pub(crate) fn build_store<K, V, E, S: BuildHasher>(self, build_hasher: S) -> Store<K, V, E, S> {
        let shards = self
            .shards
            .unwrap_or_else(|| max_parallelism() * 4)
            .max(1)
            .next_power_of_two();

        let per_shard = match self.estimated_size {
            Some(estimated_size) if estimated_size > shards => (estimated_size / shards) * 2,
            _ => 0,
        };

        let shards = (0..shards).map(|_| Shard::with_capacity(per_shard)).collect();

        Store::from_shards(shards, build_hasher)
    }
}
