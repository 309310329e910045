//! An async cache that fetches each key at most once, no matter how many tasks ask for it at the same time.
//!
//! The first task to ask for a missing key starts the fetch. Every task that asks while that fetch is running
//! waits on it and gets the same result, value or error. A task that gives up early leaves the fetch running
//! for the ones still waiting. Once a fetch succeeds its value stays cached for the lifetime of the cache,
//! once it fails the next caller tries again.
//!
//! # Quick Start
//! ```
//! use single_flight_cache::SingleFlightCache;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache: SingleFlightCache<&str, u32> = SingleFlightCache::new();
//!
//! let value = cache.get_or_insert("mykey", || async { 105 }).await;
//! assert_eq!(value, 105);
//!
//! // resolved keys never run their fetch again
//! let value = cache.get_or_insert("mykey", || async { 0 }).await;
//! assert_eq!(value, 105);
//! # }
//! ```
//!
//! Fallible fetches go through [`SingleFlightCache::get_or_try_insert`], and [`Cached`] puts a fetch
//! behind a cache with keys derived from its arguments.

pub mod cache;
#[doc(inline)]
pub use cache::SingleFlightCache;

pub mod builder;
#[doc(inline)]
pub use builder::CacheBuilder;

/// Cache keys built from a type tag and call arguments.
pub mod keys;
#[doc(inline)]
pub use keys::{derive_key, KeyScheme};

/// Wrap a fetch so its calls go through a cache, keyed by their arguments.
pub mod cached;
#[doc(inline)]
pub use cached::{CacheClient, Cached, Fetch};

pub mod error;
pub use error::{CachedError, KeyError, KeyPart};

mod map;

#[doc(hidden)]
pub mod constants_for_benchmarking;
