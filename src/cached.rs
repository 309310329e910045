use crate::error::{CachedError, KeyError};
use crate::keys::KeyScheme;
use crate::SingleFlightCache;

use std::fmt::Display;
use std::future::Future;

/// A type that knows how to name the work it caches.
pub trait CacheClient<A: ?Sized> {
    fn cache_key(&self, key_type: &str, args: &A) -> Result<String, KeyError>;
}

/// A [`KeyScheme`] can act as a client on its own when the arguments are a single displayable value.
impl<A: Display> CacheClient<A> for KeyScheme {
    fn cache_key(&self, key_type: &str, args: &A) -> Result<String, KeyError> {
        self.derive(key_type, [args])
    }
}

/// A `Fetch` produces the value for some arguments, given the client it runs on behalf of.
///
/// The returned future is shared by every caller waiting on its key and may outlive the call that
/// created it, so it cant borrow from the client. Clone what it needs out of the client instead.
pub trait Fetch<C, A, V> {
    type Error;

    fn fetch(&self, client: &C, args: A) -> impl Future<Output = Result<V, Self::Error>> + Send + 'static;
}

impl<C, A, V, F, Fut, E> Fetch<C, A, V> for F
where
    F: Fn(&C, A) -> Fut,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    type Error = E;

    fn fetch(&self, client: &C, args: A) -> impl Future<Output = Result<V, E>> + Send + 'static {
        self(client, args)
    }
}

/// Puts a [`Fetch`] behind a [`SingleFlightCache`].
///
/// Each call derives its key from the client, then either shares an existing result or runs the fetch.
/// Several `Cached` can share one cache (see [`Cached::with_cache`]), their keys only need to differ.
pub struct Cached<C, F, V, E> {
    client: C,
    key_type: String,
    fetch: F,
    cache: SingleFlightCache<String, V, E>,
}

impl<C, F, V, E> Cached<C, F, V, E> {
    pub fn new(client: C, key_type: impl Into<String>, fetch: F) -> Self {
        Self::with_cache(client, key_type, fetch, SingleFlightCache::new())
    }

    pub fn with_cache(
        client: C,
        key_type: impl Into<String>,
        fetch: F,
        cache: SingleFlightCache<String, V, E>,
    ) -> Self {
        Cached {
            client,
            key_type: key_type.into(),
            fetch,
            cache,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    pub fn cache(&self) -> &SingleFlightCache<String, V, E> {
        &self.cache
    }
}

impl<C, F, V, E> Cached<C, F, V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Get the cached value for `args`, fetching it at most once no matter how many callers ask concurrently.
    ///
    /// A key that cant be derived fails with [`CachedError::Key`] and never reaches the cache.
    pub async fn call<A>(&self, args: A) -> Result<V, CachedError<E>>
    where
        C: CacheClient<A>,
        F: Fetch<C, A, V, Error = E>,
    {
        let key = self.client.cache_key(&self.key_type, &args)?;

        tracing::trace!(%key, "cached call");
        self.cache
            .get_or_try_insert(key, || self.fetch.fetch(&self.client, args))
            .await
            .map_err(CachedError::Fetch)
    }
}
