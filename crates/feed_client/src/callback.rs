//! Listener registration bookkeeping.
//!
//! Holds one independently ordered listener set per event category. Pure
//! bookkeeping; dispatch lives in [`crate::dispatcher`].

use common::{MetricsUpdate, Result, SnapshotUpdate};

use crate::state::ConnectionState;

/// Listener for incremental metric updates. A returned error is logged and
/// does not stop delivery to the remaining listeners.
pub type MetricsListener = Box<dyn Fn(&MetricsUpdate) -> Result<()> + Send>;
/// Listener for full snapshot updates.
pub type SnapshotListener = Box<dyn Fn(&SnapshotUpdate) -> Result<()> + Send>;
/// Listener for connection state changes.
pub type StateListener = Box<dyn Fn(ConnectionState) + Send>;
/// Listener for error notifications.
pub type ErrorListener = Box<dyn Fn(&str) + Send>;

/// A listener paired with the category it registers under.
pub enum Listener {
    Metrics(MetricsListener),
    Snapshot(SnapshotListener),
    State(StateListener),
    Error(ErrorListener),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Category {
    Metrics,
    Snapshot,
    State,
    Error,
}

impl Listener {
    pub(crate) fn category(&self) -> Category {
        match self {
            Listener::Metrics(_) => Category::Metrics,
            Listener::Snapshot(_) => Category::Snapshot,
            Listener::State(_) => Category::State,
            Listener::Error(_) => Category::Error,
        }
    }
}

/// Opaque token identifying one registered listener.
///
/// Passing it to `remove` detaches exactly that listener; removing it twice is
/// a no-op the second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    category: Category,
    id: u64,
}

impl CallbackHandle {
    pub(crate) fn new(category: Category, id: u64) -> Self {
        Self { category, id }
    }
}

/// Per-category listener sets, iterated in registration order.
#[derive(Default)]
pub struct CallbackRegistry {
    metrics: Vec<(u64, MetricsListener)>,
    snapshots: Vec<(u64, SnapshotListener)>,
    state: Vec<(u64, StateListener)>,
    errors: Vec<(u64, ErrorListener)>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u64, listener: Listener) -> CallbackHandle {
        let handle = CallbackHandle::new(listener.category(), id);
        match listener {
            Listener::Metrics(cb) => self.metrics.push((id, cb)),
            Listener::Snapshot(cb) => self.snapshots.push((id, cb)),
            Listener::State(cb) => self.state.push((id, cb)),
            Listener::Error(cb) => self.errors.push((id, cb)),
        }
        handle
    }

    /// Remove the listener the handle names. Returns whether it was present.
    pub fn remove(&mut self, handle: CallbackHandle) -> bool {
        fn drop_id<T>(set: &mut Vec<(u64, T)>, id: u64) -> bool {
            let before = set.len();
            set.retain(|(entry_id, _)| *entry_id != id);
            set.len() != before
        }
        match handle.category {
            Category::Metrics => drop_id(&mut self.metrics, handle.id),
            Category::Snapshot => drop_id(&mut self.snapshots, handle.id),
            Category::State => drop_id(&mut self.state, handle.id),
            Category::Error => drop_id(&mut self.errors, handle.id),
        }
    }

    pub fn metrics(&self) -> impl Iterator<Item = &MetricsListener> {
        self.metrics.iter().map(|(_, cb)| cb)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &SnapshotListener> {
        self.snapshots.iter().map(|(_, cb)| cb)
    }

    pub fn state(&self) -> impl Iterator<Item = &StateListener> {
        self.state.iter().map(|(_, cb)| cb)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorListener> {
        self.errors.iter().map(|(_, cb)| cb)
    }
}
