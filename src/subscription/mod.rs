//! Subscription bookkeeping.
//!
//! Subscriptions are long-lived, named requests for events. They outlive
//! relay connections: whenever a relay (re)connects it asks the
//! [`SubscriptionRegistry`] for every active subscription and re-sends it.
//!
//! # Types
//!
//! - [`Subscription`]: an id, its typed filters, and an optional EOSE callback
//! - [`SubscriptionRegistry`]: copy-on-write map of all subscriptions

mod registry;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use nostr::{RelayUrl, Timestamp};

use crate::filter::TypedFilter;

pub use registry::SubscriptionRegistry;

/// Called when a relay reports end of stored events for a subscription.
///
/// Receives the relay and the local time the signal arrived, which callers
/// typically feed back into [`Filter::advance_since`](crate::filter::Filter::advance_since).
pub type EoseCallback = Arc<dyn Fn(&RelayUrl, Timestamp) + Send + Sync>;

/// Generates a short random subscription id.
#[must_use]
pub fn new_subscription_id() -> String {
    let bytes: [u8; 6] = rand::random();
    hex::encode(bytes)
}

/// A named request for events.
///
/// A subscription without filters (or with an empty list) is inactive and
/// is never sent to relays.
#[derive(Clone)]
pub struct Subscription {
    id: String,
    filters: Option<Vec<TypedFilter>>,
    on_eose: Option<EoseCallback>,
}

impl Subscription {
    /// Creates an inactive subscription.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filters: None,
            on_eose: None,
        }
    }

    /// Attaches an EOSE callback.
    #[must_use]
    pub fn with_eose(mut self, on_eose: EoseCallback) -> Self {
        self.on_eose = Some(on_eose);
        self
    }

    /// Subscription id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current filters; empty when inactive.
    #[must_use]
    pub fn filters(&self) -> &[TypedFilter] {
        self.filters.as_deref().unwrap_or_default()
    }

    /// Replaces the filter list.
    pub fn set_filters(&mut self, filters: Option<Vec<TypedFilter>>) {
        self.filters = filters;
    }

    /// Whether the subscription has at least one filter.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.filters.as_ref().is_some_and(|f| !f.is_empty())
    }

    /// Whether `other` asks for something different than the current filters.
    ///
    /// Checkpoint (`since`) differences are ignored so that advancing a
    /// checkpoint does not trigger a re-subscription.
    #[must_use]
    pub fn has_changed_filters_from(&self, other: Option<&[TypedFilter]>) -> bool {
        match (self.filters.as_deref(), other) {
            (None, None) => false,
            (Some(current), Some(other)) => {
                current.len() != other.len()
                    || current
                        .iter()
                        .zip(other)
                        .any(|(a, b)| !a.same_query_as(b))
            }
            _ => true,
        }
    }

    /// Invokes the EOSE callback, if any. A panicking callback is logged
    /// and swallowed so the relay keeps processing frames.
    pub fn update_eose(&self, relay: &RelayUrl, time: Timestamp) {
        let Some(callback) = &self.on_eose else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| callback(relay, time))).is_err() {
            log::error!("EOSE callback for {} panicked on {relay}", self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filters", &self.filters)
            .field("on_eose", &self.on_eose.is_some())
            .finish()
    }
}
