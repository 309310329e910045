use parking_lot::Mutex;

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

/// A fetch once it has been handed to its [`WakerNode`].
pub(crate) type BoxFetch<V, E> = Pin<Box<dyn Future<Output = Result<V, E>> + Send>>;

/// A pending fetch, shared by every caller attached to its key.
///
/// The fetch lives here and not in the caller that created it: whichever attached caller is polled
/// drives it forward, so any caller can go away without cancelling it for the others.
/// It is dropped once the last attached caller detaches.
pub(crate) struct WakerNode<V, E> {
    state: Mutex<NodeState<V, E>>,
    wakers: Arc<Wakers>,
}

enum NodeState<V, E> {
    /// `None` before the fetch exists, and while one of the callers is polling it
    Running(Option<BoxFetch<V, E>>),
    Settled(Result<V, E>),
    /// The fetch panicked or everyone detached, holds the panic until the creator of the fetch takes it
    Abandoned(Option<Box<dyn Any + Send>>),
}

/// What a caller gets from polling the node.
pub(crate) enum Progress<V, E> {
    /// This caller completed the fetch, it has to publish the result before dropping the fetch
    Finished(Result<V, E>, BoxFetch<V, E>),
    Settled(Result<V, E>),
    Abandoned,
}

/// What is left after a caller detaches.
pub(crate) enum Detach<V, E> {
    Live,
    /// Nobody is attached anymore, the pending record has to go.
    /// The fetch, if there was one, is handed back so it can be dropped outside of any lock
    Dead(Option<BoxFetch<V, E>>),
}

impl<V, E> WakerNode<V, E> {
    pub(crate) fn start() -> Arc<Self> {
        Arc::new(WakerNode {
            state: Mutex::new(NodeState::Running(None)),
            wakers: Arc::default(),
        })
    }

    /// Take a slot on this node.
    ///
    /// A caller that goes away before the node settles has to [`WakerNode::detach`] its slot.
    pub(crate) fn attach(&self) -> usize {
        self.wakers.attach()
    }

    /// Hand the fetch over, from now on any attached caller can drive it.
    pub(crate) fn begin(&self, fetch: BoxFetch<V, E>) {
        if let NodeState::Running(slot @ None) = &mut *self.state.lock() {
            *slot = Some(fetch);
        }
    }

    /// Drive the fetch if nobody else is polling it, otherwise wait for someone who is.
    ///
    /// A panic inside the fetch is caught and abandons the node.
    pub(crate) fn poll_fetch(&self, slot: usize, cx: &mut Context<'_>) -> Poll<Progress<V, E>>
    where
        V: Clone,
        E: Clone,
    {
        let mut fetch = {
            let mut state = self.state.lock();

            match &mut *state {
                NodeState::Running(fetch) => {
                    self.wakers.register(slot, cx.waker());

                    match fetch.take() {
                        Some(fetch) => fetch,
                        // whoever holds it wakes us through `self.wakers`
                        None => return Poll::Pending,
                    }
                }
                NodeState::Settled(result) => return Poll::Ready(Progress::Settled(result.clone())),
                NodeState::Abandoned(_) => return Poll::Ready(Progress::Abandoned),
            }
        };

        // the fetch wakes every attached caller, any of them can poll it next
        let waker = Waker::from(self.wakers.clone());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| {
            fetch.as_mut().poll(&mut Context::from_waker(&waker))
        }));

        match polled {
            Ok(Poll::Ready(result)) => Poll::Ready(Progress::Finished(result, fetch)),
            Ok(Poll::Pending) => {
                if let NodeState::Running(parked @ None) = &mut *self.state.lock() {
                    *parked = Some(fetch);
                }

                Poll::Pending
            }
            Err(payload) => {
                tracing::debug!("fetch panicked, abandoning it");
                self.abandon(Some(payload));

                Poll::Ready(Progress::Abandoned)
            }
        }
    }

    /// Publish the result of the fetch and wake every attached caller.
    pub(crate) fn settle(&self, result: Result<V, E>) {
        let mut state = self.state.lock();

        if let NodeState::Running(_) = &*state {
            *state = NodeState::Settled(result);
            drop(state);

            self.wakers.wake_all();
        }
    }

    /// Give up on the fetch and wake every attached caller, they will find [`Progress::Abandoned`].
    ///
    /// Does nothing once the node has settled. Returns the fetch if it was parked here.
    pub(crate) fn abandon(&self, payload: Option<Box<dyn Any + Send>>) -> Option<BoxFetch<V, E>> {
        let mut state = self.state.lock();

        let NodeState::Running(fetch) = &mut *state else {
            return None;
        };
        let fetch = fetch.take();
        *state = NodeState::Abandoned(payload);
        drop(state);

        self.wakers.wake_all();
        fetch
    }

    /// The panic that abandoned this node, if nobody took it yet.
    pub(crate) fn take_panic(&self) -> Option<Box<dyn Any + Send>> {
        match &mut *self.state.lock() {
            NodeState::Abandoned(payload) => payload.take(),
            _ => None,
        }
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        matches!(&*self.state.lock(), NodeState::Abandoned(_))
    }

    /// A caller went away.
    ///
    /// The last caller to detach from a running node takes the fetch with it.
    pub(crate) fn detach(&self, slot: usize) -> Detach<V, E> {
        let mut state = self.state.lock();
        let remaining = self.wakers.detach(slot);

        match &mut *state {
            NodeState::Running(fetch) if remaining == 0 => {
                let fetch = fetch.take();
                *state = NodeState::Abandoned(None);

                return Detach::Dead(fetch);
            }
            NodeState::Running(_) => {}
            NodeState::Abandoned(_) => return Detach::Dead(None),
            NodeState::Settled(_) => return Detach::Live,
        }
        drop(state);

        // the last wake up might have been meant for us, pass it on
        self.wakers.wake_all();
        Detach::Live
    }

    /// The number of callers still attached.
    pub(crate) fn waiters(&self) -> usize {
        self.wakers.attached()
    }
}

/// The waker handed to the fetch, it wakes every attached caller.
#[derive(Default)]
struct Wakers {
    slots: Mutex<Vec<Slot>>,
}

enum Slot {
    Vacant,
    Attached(Option<Waker>),
}

impl Wakers {
    fn attach(&self) -> usize {
        let mut slots = self.slots.lock();

        match slots.iter().position(|s| matches!(s, Slot::Vacant)) {
            Some(idx) => {
                slots[idx] = Slot::Attached(None);
                idx
            }
            None => {
                slots.push(Slot::Attached(None));
                slots.len() - 1
            }
        }
    }

    fn register(&self, slot: usize, waker: &Waker) {
        if let Some(Slot::Attached(entry)) = self.slots.lock().get_mut(slot) {
            if !entry.as_ref().is_some_and(|w| w.will_wake(waker)) {
                *entry = Some(waker.clone());
            }
        }
    }

    /// Free a slot, returns how many are still attached.
    fn detach(&self, slot: usize) -> usize {
        let mut slots = self.slots.lock();

        if let Some(entry) = slots.get_mut(slot) {
            *entry = Slot::Vacant;
        }

        count_attached(&slots)
    }

    fn attached(&self) -> usize {
        count_attached(&self.slots.lock())
    }

    fn wake_all(&self) {
        let wakers: Vec<Waker> = self
            .slots
            .lock()
            .iter()
            .filter_map(|s| match s {
                Slot::Attached(Some(waker)) => Some(waker.clone()),
                _ => None,
            })
            .collect();

        for waker in wakers {
            waker.wake();
        }
    }
}

impl Wake for Wakers {
    fn wake(self: Arc<Self>) {
        self.wake_all();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_all();
    }
}

#[inline]
fn count_attached(slots: &[Slot]) -> usize {
    slots.iter().filter(|s| matches!(s, Slot::Attached(_))).count()
}
