use std::future::Future;
use std::hash::BuildHasher;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::ready;
use std::task::Context;
use std::task::Poll;

use crate::map::{Detach, Progress, Shard, Store, WakerNode};

use pin_project::pinned_drop;
use tracing::{debug, trace};

/// The future returned by [`super::SingleFlightCache::get_or_try_insert`]
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[pin_project::pin_project(PinnedDrop)]
pub struct GetOrTryInsertFuture<'a, K, V, E, S, F>
where
    K: Eq + Hash,
{
    store: &'a Store<K, V, E, S>,
    shard: &'a Shard<K, V, E>,
    hash: u64,
    key: K,
    /// Taken once we create the fetch, so `None` afterwards means the pending fetch is ours
    init: Option<F>,
    state: State<V, E>,
}

enum State<V, E> {
    /// We dont know anything about the key yet
    Idle,
    /// We hold a slot on the pending fetch for the key, whether we created it or joined it
    Attached { node: Arc<WakerNode<V, E>>, slot: usize },
    Done,
}

impl<'a, K, V, E, S, F> GetOrTryInsertFuture<'a, K, V, E, S, F>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub(crate) fn new(store: &'a Store<K, V, E, S>, key: K, init: F) -> Self {
        let (hash, shard) = store.shard(&key);

        GetOrTryInsertFuture {
            store,
            shard,
            hash,
            key,
            init: Some(init),
            state: State::Idle,
        }
    }
}

#[pinned_drop]
impl<'a, K, V, E, S, F> PinnedDrop for GetOrTryInsertFuture<'a, K, V, E, S, F>
where
    K: Eq + Hash,
{
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();

        if let State::Attached { node, slot } = &*this.state {
            let mut pending = this.shard.pending.lock();

            let fetch = match node.detach(*slot) {
                Detach::Dead(fetch) => {
                    if pending.get(&*this.key).is_some_and(|n| Arc::ptr_eq(n, node)) {
                        pending.remove(&*this.key);
                    }

                    fetch
                }
                Detach::Live => None,
            };
            drop(pending);

            // dropped out here, a fetch is free to touch the cache from its destructor
            if let Some(fetch) = fetch {
                debug!("every caller went away, cancelling fetch");
                drop(fetch);
            }
        }
    }
}

impl<'a, K, V, E, S, F, Fut> Future for GetOrTryInsertFuture<'a, K, V, E, S, F>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    S: BuildHasher,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    type Output = Result<V, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        loop {
            match &mut *this.state {
                State::Idle => {
                    // do an initial read to see if the value is in the cache, if it is we can return it
                    // without serializing on the pending lock
                    if let Some(value) = this.shard.get(this.key, *this.hash) {
                        *this.state = State::Done;
                        return Poll::Ready(Ok(value));
                    }

                    // take the lock so no one else can register a fetch for this key
                    let mut pending = this.shard.pending.lock();
                    if let Some(value) = this.shard.get(this.key, *this.hash) {
                        drop(pending);
                        *this.state = State::Done;
                        return Poll::Ready(Ok(value));
                    }

                    // an abandoned fetch is still in the map until its last caller cleans up, we replace it
                    let joinable = pending
                        .get(&*this.key)
                        .filter(|node| !node.is_abandoned())
                        .cloned();

                    match joinable {
                        Some(node) => {
                            let slot = node.attach();
                            drop(pending);

                            trace!("joining pending fetch");
                            *this.state = State::Attached { node, slot };
                        }
                        None => {
                            let node = WakerNode::start();
                            let slot = node.attach();
                            let stale = pending.insert(this.key.clone(), node.clone());
                            // we dont call `init` just yet as it could panic, we need to drop our lock first
                            drop(pending);
                            drop(stale);

                            trace!("no record for key, starting fetch");
                            *this.state = State::Attached {
                                node: node.clone(),
                                slot,
                            };

                            let init = this.init.take().expect("init is only taken once");
                            let fetch = match panic::catch_unwind(AssertUnwindSafe(init)) {
                                Ok(fetch) => fetch,
                                Err(payload) => {
                                    // anyone who joined in the meantime starts over, our drop clears the record
                                    node.abandon(None);
                                    panic::resume_unwind(payload);
                                }
                            };

                            node.begin(Box::pin(fetch));
                        }
                    }
                }
                State::Attached { node, slot } => match ready!(node.poll_fetch(*slot, cx)) {
                    Progress::Finished(result, fetch) => {
                        let result = publish(*this.store, *this.shard, &*this.key, *this.hash, node, result);
                        *this.state = State::Done;

                        // everyone has the result by now, even if this panics
                        drop(fetch);

                        return Poll::Ready(result);
                    }
                    Progress::Settled(result) => {
                        *this.state = State::Done;
                        return Poll::Ready(result);
                    }
                    Progress::Abandoned => {
                        // our own fetch panicked, possibly while someone else was driving it
                        if this.init.is_none() {
                            match node.take_panic() {
                                Some(payload) => panic::resume_unwind(payload),
                                None => panic!("the fetch for this key panicked"),
                            }
                        }

                        // start over and maybe take its place
                        trace!("pending fetch abandoned, retrying");
                        *this.state = State::Idle;
                    }
                },
                State::Done => panic!("`GetOrTryInsertFuture` polled after completion"),
            }
        }
    }
}

/// Record the result of a fetch and hand it to every attached caller.
fn publish<K, V, E, S>(
    store: &Store<K, V, E, S>,
    shard: &Shard<K, V, E>,
    key: &K,
    hash: u64,
    node: &Arc<WakerNode<V, E>>,
    result: Result<V, E>,
) -> Result<V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
    S: BuildHasher,
{
    let mut pending = shard.pending.lock();

    if let Ok(value) = &result {
        if shard
            .insert(key.clone(), value.clone(), hash, &store.build_hasher)
            .is_some()
        {
            unreachable!("a key was resolved while we held its pending fetch, this is a bug");
        }
    }

    match pending.remove(key) {
        Some(removed) if Arc::ptr_eq(&removed, node) => {}
        _ => unreachable!("were finishing a fetch we never registered, this is a bug"),
    }
    drop(pending);

    debug!(waiters = node.waiters(), ok = result.is_ok(), "fetch finished");
    node.settle(result.clone());

    result
}

#[cfg(test)]
mod test {
    use crate::SingleFlightCache;

    use futures::poll;
    use std::convert::Infallible;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    /// Counts the call, then resolves to `value`.
    fn counted<T: Send + 'static>(calls: &Arc<AtomicUsize>, value: T) -> impl Future<Output = T> + Send + 'static {
        let calls = calls.clone();

        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            value
        }
    }

    #[tokio::test]
    async fn test_get_or_insert_single_caller() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new();

        let key = 1;
        let val = cache.get_or_insert(key, || async { 1 }).await;

        assert_eq!(val, 1);
        assert_eq!(cache.get(&key), Some(1));
        assert!(!cache.is_pending(&key));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_or_insert_many_callers_returns_the_same_value_join() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new();

        let key = 1;

        let fut1 = cache.get_or_insert(key, || async { 1 });
        let fut2 = cache.get_or_insert(key, || async { 2 });
        let fut3 = cache.get_or_insert(key, || async { 3 });

        let (get1, get2, get3) = tokio::join!(fut1, fut2, fut3);

        assert_eq!(get1, 1);
        assert_eq!(get2, 1);
        assert_eq!(get3, 1);
    }

    #[tokio::test]
    async fn test_get_or_try_insert_ok_single_caller() {
        let cache: SingleFlightCache<u32, u32, TestError> = SingleFlightCache::new();

        let key = 1;
        let val = cache.get_or_try_insert(key, || async { Ok(1) }).await;

        assert_eq!(val, Ok(1));
    }

    #[tokio::test]
    async fn test_get_or_try_insert_err_single_caller() {
        let cache: SingleFlightCache<u32, u32, TestError> = SingleFlightCache::new();

        let key = 1;
        let val = cache
            .get_or_try_insert(key, || async { Err(TestError::IntentionalError) })
            .await;

        assert_eq!(val, Err(TestError::IntentionalError));
        assert_eq!(cache.get(&key), None);
        assert!(!cache.is_pending(&key));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_or_try_insert_ok_many_callers_returns_the_same_value_join() {
        let cache: SingleFlightCache<u32, u32, TestError> = SingleFlightCache::new();

        let key = 1;

        let fut1 = cache.get_or_try_insert(key, || async { Ok(1) });
        let fut2 = cache.get_or_try_insert(key, || async { Ok(2) });
        let fut3 = cache.get_or_try_insert(key, || async { Ok(3) });

        let (get1, get2, get3) = tokio::join!(fut1, fut2, fut3);

        assert_eq!(get1, Ok(1));
        assert_eq!(get2, Ok(1));
        assert_eq!(get3, Ok(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_or_try_insert_immediate_err_lets_next_caller_fetch() {
        let cache: SingleFlightCache<u32, u32, TestError> = SingleFlightCache::new();

        let key = 1;

        // the first fetch fails before anyone else can join it
        let fut1 = cache.get_or_try_insert(key, || async { Err(TestError::IntentionalError) });
        let fut2 = cache.get_or_try_insert(key, || async { Ok(2) });
        let fut3 = cache.get_or_try_insert(key, || async { Ok(3) });

        let (get1, get2, get3) = tokio::join!(fut1, fut2, fut3);

        assert_eq!(get1, Err(TestError::IntentionalError));
        assert_eq!(get2, Ok(2));
        assert_eq!(get3, Ok(2));
    }

    #[tokio::test]
    async fn test_get_or_try_insert_err_is_shared_by_every_waiter() {
        let cache: SingleFlightCache<u32, u32, TestError> = SingleFlightCache::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let key = 1;

        let mut fut1 = Box::pin(cache.get_or_try_insert(key, || async move {
            let _ = rx.await;
            Err(TestError::IntentionalError)
        }));
        let mut fut2 = Box::pin(cache.get_or_try_insert(key, || async { Ok(2) }));
        let mut fut3 = Box::pin(cache.get_or_try_insert(key, || async { Ok(3) }));

        assert_eq!(poll!(fut1.as_mut()), Poll::Pending);
        assert_eq!(poll!(fut2.as_mut()), Poll::Pending);
        assert_eq!(poll!(fut3.as_mut()), Poll::Pending);

        tx.send(()).unwrap();

        let (get1, get2, get3) = tokio::join!(fut1, fut2, fut3);

        assert_eq!(get1, Err(TestError::IntentionalError));
        assert_eq!(get2, Err(TestError::IntentionalError));
        assert_eq!(get3, Err(TestError::IntentionalError));
        assert_eq!(cache.get(&key), None);
        assert!(!cache.is_pending(&key));
    }

    #[tokio::test]
    async fn test_get_or_try_insert_retries_after_failure() {
        let cache: SingleFlightCache<u32, u32, TestError> = SingleFlightCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let failed = cache
            .get_or_try_insert(1, || counted(&calls, Err(TestError::IntentionalError)))
            .await;
        let retried = cache.get_or_try_insert(1, || counted(&calls, Ok(5))).await;

        assert_eq!(failed, Err(TestError::IntentionalError));
        assert_eq!(retried, Ok(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resolved_key_never_fetches_again() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let val = cache.get_or_insert(9, || counted(&calls, 9)).await;

            assert_eq!(val, 9);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_is_registered_before_init_completes() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();

        let mut leader = Box::pin(cache.get_or_try_insert(3, || async move { Ok(rx.await.unwrap_or(0)) }));
        assert_eq!(poll!(leader.as_mut()), Poll::Pending);
        assert!(cache.is_pending(&3));
        assert_eq!(cache.get(&3), None);

        let mut waiter = Box::pin(cache.get_or_try_insert(3, || async { Ok(99) }));
        assert_eq!(poll!(waiter.as_mut()), Poll::Pending);

        tx.send(30).unwrap();

        assert_eq!(leader.await, Ok(30));
        assert_eq!(waiter.await, Ok(30));
        assert!(!cache.is_pending(&3));
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_cancel_fetch() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();

        let mut leader = Box::pin(cache.get_or_try_insert(4, || async move { Ok(rx.await.unwrap_or(0)) }));
        assert_eq!(poll!(leader.as_mut()), Poll::Pending);

        let mut waiter = Box::pin(cache.get_or_try_insert(4, || async { Ok(99) }));
        assert_eq!(poll!(waiter.as_mut()), Poll::Pending);
        drop(waiter);

        assert!(cache.is_pending(&4));
        tx.send(40).unwrap();

        assert_eq!(leader.await, Ok(40));
        assert_eq!(cache.get(&4), Some(40));
    }

    #[tokio::test]
    async fn test_dropped_leader_keeps_the_fetch_for_its_waiter() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();

        let mut leader = Box::pin(cache.get_or_insert(5, || {
            let calls = calls.clone();

            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                rx.await.unwrap_or(0)
            }
        }));
        assert_eq!(poll!(leader.as_mut()), Poll::Pending);

        let mut waiter = Box::pin(cache.get_or_insert(5, || counted(&calls, 2)));
        assert_eq!(poll!(waiter.as_mut()), Poll::Pending);

        drop(leader);
        assert!(cache.is_pending(&5));

        tx.send(1).unwrap();

        assert_eq!(waiter.await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&5), Some(1));
    }

    #[tokio::test]
    async fn test_last_caller_dropped_cancels_the_fetch() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new();
        let cancelled = Arc::new(AtomicBool::new(false));

        let guard = SetOnDrop(cancelled.clone());
        let mut leader = Box::pin(cache.get_or_insert(6, || async move {
            let _guard = guard;
            std::future::pending::<u32>().await
        }));
        assert_eq!(poll!(leader.as_mut()), Poll::Pending);

        let mut waiter = Box::pin(cache.get_or_insert(6, || async { 0 }));
        assert_eq!(poll!(waiter.as_mut()), Poll::Pending);

        drop(leader);
        assert!(!cancelled.load(Ordering::SeqCst));
        assert!(cache.is_pending(&6));

        drop(waiter);
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(!cache.is_pending(&6));

        // nothing was stored, the next caller starts a new fetch
        assert_eq!(cache.get_or_insert(6, || async { 60 }).await, 60);
    }

    #[tokio::test]
    async fn test_panicking_init_clears_pending() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new();

        let task = tokio::spawn({
            let cache = cache.clone();

            async move {
                cache
                    .get_or_insert(7, || -> std::future::Ready<u32> { panic!("no fetch for you") })
                    .await
            }
        });

        assert!(task.await.unwrap_err().is_panic());
        assert!(!cache.is_pending(&7));
        assert_eq!(cache.get_or_insert(7, || async { 70 }).await, 70);
    }

    #[tokio::test]
    async fn test_fetch_panicking_on_drop_still_publishes() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new();

        let task = tokio::spawn({
            let cache = cache.clone();

            async move { cache.get_or_try_insert(8, || PanicsOnDrop(80)).await }
        });

        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(cache.get(&8), Some(80));
        assert!(!cache.is_pending(&8));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_different_keys_fetch_independently() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();

        // key 1 is stuck until we say so, key 2 must not wait on it
        let mut slow = Box::pin(cache.get_or_insert(1, || async move { rx.await.unwrap_or(0) }));
        assert_eq!(poll!(slow.as_mut()), Poll::Pending);

        assert_eq!(cache.get_or_insert(2, || async { 2 }).await, 2);
        assert!(cache.is_pending(&1));

        tx.send(1).unwrap();
        assert_eq!(slow.await, 1);
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Resolves right away, then panics when it is dropped.
    struct PanicsOnDrop(u32);

    impl Future for PanicsOnDrop {
        type Output = Result<u32, Infallible>;

        fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
            Poll::Ready(Ok(self.0))
        }
    }

    impl Drop for PanicsOnDrop {
        fn drop(&mut self) {
            panic!("fetch dropped");
        }
    }

    #[derive(Debug, PartialEq, Clone, Copy)]
    pub enum TestError {
        IntentionalError,
    }

    impl std::error::Error for TestError {}
    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::IntentionalError => write!(f, "intentional error"),
            }
        }
    }
}
