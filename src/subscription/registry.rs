//! Copy-on-write subscription registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use nostr::{RelayUrl, Timestamp};

use super::{new_subscription_id, EoseCallback, Subscription};
use crate::filter::TypedFilter;

type SubscriptionMap = HashMap<String, Subscription>;

/// All subscriptions known to a client.
///
/// Readers take an immutable snapshot; writers build a new map and swap it
/// in. Relays iterate the snapshot while re-sending filters, so a concurrent
/// `add` or `remove` never disturbs an iteration in progress.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<Arc<SubscriptionMap>>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<SubscriptionMap> {
        Arc::clone(
            &self
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut SubscriptionMap) -> R) -> R {
        let mut guard = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = SubscriptionMap::clone(&guard);
        let result = mutate(&mut next);
        *guard = Arc::new(next);
        result
    }

    /// Registers an inactive subscription with a fresh id.
    pub fn create(&self, on_eose: Option<EoseCallback>) -> String {
        let id = new_subscription_id();
        let mut subscription = Subscription::new(id.clone());
        if let Some(callback) = on_eose {
            subscription = subscription.with_eose(callback);
        }
        self.update(|map| map.insert(id.clone(), subscription));
        id
    }

    /// Stores `filters` under `id`, creating the subscription if needed.
    ///
    /// Returns whether the new filters differ from the previous ones in
    /// anything other than `since`. The new list is stored either way. For
    /// an unchanged query the stored checkpoints only move forward: each
    /// relay keeps the later of its old and new `since`.
    pub fn add(&self, id: &str, mut filters: Vec<TypedFilter>) -> bool {
        self.update(|map| {
            let subscription = map
                .entry(id.to_string())
                .or_insert_with(|| Subscription::new(id));
            let changed = subscription.has_changed_filters_from(Some(&filters));
            if !changed {
                for (next, previous) in filters.iter_mut().zip(subscription.filters()) {
                    for (relay, since) in previous.filter.since.iter().flatten() {
                        next.filter.advance_since(relay, *since);
                    }
                }
            }
            subscription.set_filters(Some(filters));
            changed
        })
    }

    /// Removes a subscription. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.update(|map| map.remove(id).is_some())
    }

    /// Whether `id` exists and has filters.
    #[must_use]
    pub fn is_active(&self, id: &str) -> bool {
        self.snapshot().get(id).is_some_and(Subscription::is_active)
    }

    /// Filters registered for `id`, empty if unknown.
    #[must_use]
    pub fn filters(&self, id: &str) -> Vec<TypedFilter> {
        self.snapshot()
            .get(id)
            .map(|sub| sub.filters().to_vec())
            .unwrap_or_default()
    }

    /// All active subscriptions with their filters.
    #[must_use]
    pub fn active(&self) -> Vec<(String, Vec<TypedFilter>)> {
        self.snapshot()
            .values()
            .filter(|sub| sub.is_active())
            .map(|sub| (sub.id().to_string(), sub.filters().to_vec()))
            .collect()
    }

    /// Number of registered subscriptions, active or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Forwards an EOSE signal to the subscription's callback.
    pub fn notify_eose(&self, id: &str, relay: &RelayUrl, time: Timestamp) {
        let snapshot = self.snapshot();
        if let Some(subscription) = snapshot.get(id) {
            subscription.update_eose(relay, time);
        }
    }
}
