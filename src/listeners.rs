//! Copy-on-write listener sets.
//!
//! Fan-out iterates an immutable snapshot; `add` and `remove` build a new
//! list and swap it in. A listener that unsubscribes itself (or another one)
//! from inside a callback therefore never disturbs the iteration that is
//! delivering to it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

/// Immutable-snapshot set of shared listeners.
pub struct ListenerSet<L: ?Sized> {
    listeners: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        Arc::clone(&self.listeners.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace(&self, mutate: impl FnOnce(&mut Vec<Arc<L>>)) {
        let mut guard = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::clone(&guard);
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    /// Adds a listener. Adding the same `Arc` twice is a no-op.
    pub fn add(&self, listener: Arc<L>) {
        self.replace(|list| {
            if !list.iter().any(|l| same(l, &listener)) {
                list.push(listener);
            }
        });
    }

    /// Removes a listener by identity.
    pub fn remove(&self, listener: &Arc<L>) {
        self.replace(|list| list.retain(|l| !same(l, listener)));
    }

    /// Whether the exact `Arc` is registered.
    #[must_use]
    pub fn contains(&self, listener: &Arc<L>) -> bool {
        self.snapshot().iter().any(|l| same(l, listener))
    }

    /// Drops every listener.
    pub fn clear(&self) {
        self.replace(Vec::clear);
    }

    /// Number of listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Calls `f` for every listener in the current snapshot.
    ///
    /// A panicking listener is logged and skipped; the remaining listeners
    /// still receive the notification.
    pub fn for_each(&self, f: impl Fn(&L)) {
        for listener in self.snapshot().iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(listener)));
            if outcome.is_err() {
                log::error!("Listener panicked during notification; continuing with the rest");
            }
        }
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> fmt::Debug for ListenerSet<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

fn same<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    trait Ping: Send + Sync {
        fn ping(&self);
    }

    struct Counter(AtomicUsize);

    impl Ping for Counter {
        fn ping(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panics;

    impl Ping for Panics {
        fn ping(&self) {
            panic!("listener failure");
        }
    }

    #[test]
    fn add_is_idempotent_per_arc() {
        let set: ListenerSet<dyn Ping> = ListenerSet::new();
        let counter: Arc<dyn Ping> = Arc::new(Counter(AtomicUsize::new(0)));

        set.add(Arc::clone(&counter));
        set.add(Arc::clone(&counter));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&counter));

        set.remove(&counter);
        assert!(set.is_empty());
    }

    #[test]
    fn snapshot_survives_removal() {
        let set: ListenerSet<dyn Ping> = ListenerSet::new();
        let counter: Arc<dyn Ping> = Arc::new(Counter(AtomicUsize::new(0)));
        set.add(Arc::clone(&counter));

        let snapshot = set.snapshot();
        set.clear();

        assert_eq!(snapshot.len(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let set: ListenerSet<dyn Ping> = ListenerSet::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        set.add(Arc::new(Panics));
        set.add(Arc::clone(&counter) as Arc<dyn Ping>);

        set.for_each(Ping::ping);

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
