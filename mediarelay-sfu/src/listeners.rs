//! Weakly held listener registrations

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::types::{StreamId, TrackId};

/// Called when a stream gains a track
pub type TrackCallback<T> = Arc<dyn Fn(&Arc<T>) + Send + Sync>;

/// Called once when a stream stops
pub type StreamStopCallback = Arc<dyn Fn(&StreamId) + Send + Sync>;

/// Called once when a track stops
pub type TrackStopCallback = Arc<dyn Fn(&TrackId) + Send + Sync>;

/// Handle returned by [`ListenerSet::add`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

struct Registrations<T: ?Sized> {
    entries: Vec<(ListenerId, Weak<T>)>,
    closed: bool,
}

/// Set of weakly referenced listeners.
///
/// Listeners never keep their subject alive through this set, and a
/// listener that is dropped without unsubscribing is pruned on the next add.
pub(crate) struct ListenerSet<T: ?Sized> {
    inner: Mutex<Registrations<T>>,
}

impl<T: ?Sized> ListenerSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Registrations {
                entries: Vec::new(),
                closed: false,
            }),
        }
    }

    pub(crate) fn add(&self, listener: Weak<T>) -> ListenerId {
        let mut inner = self.inner.lock();
        Self::push(&mut inner, listener)
    }

    /// Like [`add`](Self::add), but refused once the set is closed.
    pub(crate) fn try_add(&self, listener: Weak<T>) -> Option<ListenerId> {
        let mut inner = self.inner.lock();
        (!inner.closed).then(|| Self::push(&mut inner, listener))
    }

    fn push(inner: &mut Registrations<T>, listener: Weak<T>) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        inner.entries.retain(|(_, weak)| weak.strong_count() > 0);
        inner.entries.push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|(entry_id, _)| *entry_id != id);
        inner.entries.len() != before
    }

    /// Live listeners, copied out so callbacks run without the lock held
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    /// Refuse further [`try_add`](Self::try_add) calls and remove every
    /// registration, returning the listeners still alive
    pub(crate) fn close(&self) -> Vec<Arc<T>> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        std::mem::take(&mut inner.entries)
            .into_iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }
}
