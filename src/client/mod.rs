//! Client facade.
//!
//! [`Client`] is the single entry point for the session layer. It owns the
//! relay pool and the subscription registry, rebuilds the pool only when the
//! relay configuration actually changed, and offers publish helpers that
//! wait for relay acknowledgements.
//!
//! A client is an explicit handle: construct one per account (or per test)
//! and pass clones around. Dropping the last clone tears everything down.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use nostr::Kind;
//! use relay_hub::client::Client;
//! use relay_hub::config::ClientConfig;
//! use relay_hub::filter::{FeedType, Filter, TypedFilter};
//! use relay_hub::relay::RelayDescriptor;
//! use relay_hub::transport::WebSocketTransportFactory;
//!
//! # async fn demo() -> Result<(), relay_hub::relay::RelayError> {
//! let client = Client::new(ClientConfig::default(), Arc::new(WebSocketTransportFactory::new()));
//! client.reconnect(Some(vec![RelayDescriptor::parse("wss://relay.damus.io")?]), true)?;
//!
//! let feed = TypedFilter::new(Filter::new().kinds([Kind::TextNote]).limit(50), [FeedType::Global]);
//! client.send_filter("global-feed", vec![feed]);
//! # Ok(())
//! # }
//! ```

mod ack;
mod one_shot;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nostr::{Event, RelayUrl};
use tokio::sync::{mpsc, watch};

use crate::config::ClientConfig;
use crate::filter::{FeedType, TypedFilter};
use crate::pool::{PoolStatus, RelayPool};
use crate::relay::{Relay, RelayDescriptor, RelayListener, RelayResult};
use crate::stats::RelayStats;
use crate::subscription::{EoseCallback, SubscriptionRegistry};
use crate::transport::TransportFactory;

use ack::{AckListener, Registration};
use one_shot::OneShotListener;

/// Where [`Client::send_and_wait_for_response`] publishes.
#[derive(Debug, Clone)]
pub enum PublishTarget {
    /// Every relay in the pool, honoring write permission.
    Pool,
    /// Explicit relays, regardless of write permission. Relays not in the
    /// pool are opened temporarily.
    Relays(Vec<RelayDescriptor>),
    /// One relay, opened temporarily if it is not in the pool.
    Single(RelayDescriptor),
    /// Writable relays in the pool serving at least one of these feeds.
    Feeds(HashSet<FeedType>),
}

/// Handle to a relay session. Clones share the session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
    stats: Arc<RelayStats>,
    registry: Arc<SubscriptionRegistry>,
    pool: RelayPool,
    descriptors: Mutex<Option<Vec<RelayDescriptor>>>,
    one_shots: Mutex<HashMap<String, Arc<dyn RelayListener>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.pool.disconnect();
        self.pool.unload_relays();
    }
}

impl Client {
    /// Creates a client with an empty pool.
    #[must_use]
    pub fn new(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                factory,
                stats: Arc::new(RelayStats::new()),
                registry: Arc::new(SubscriptionRegistry::new()),
                pool: RelayPool::new(),
                descriptors: Mutex::new(None),
                one_shots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &RelayPool {
        &self.inner.pool
    }

    /// Per-relay statistics.
    #[must_use]
    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.inner.stats
    }

    /// Builds a relay wired to this client's transport, registry and stats.
    #[must_use]
    pub fn build_relay(&self, descriptor: RelayDescriptor) -> Relay {
        let stats = self.inner.stats.get(&descriptor.url);
        Relay::new(
            descriptor,
            self.inner.config.relay_options(),
            Arc::clone(&self.inner.factory),
            Arc::clone(&self.inner.registry),
            stats,
        )
    }

    /// Applies a relay configuration.
    ///
    /// With `only_if_changed`, a configuration identical to the loaded one
    /// (same URLs, each with the same settings, in any order) keeps every
    /// existing connection and only reconnects relays that dropped.
    /// Otherwise the pool is torn down and rebuilt from `descriptors`;
    /// `None` leaves it empty.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::EmptyRelaySet`](crate::relay::RelayError::EmptyRelaySet)
    /// if `descriptors` is an empty list.
    pub fn reconnect(
        &self,
        descriptors: Option<Vec<RelayDescriptor>>,
        only_if_changed: bool,
    ) -> RelayResult<()> {
        let mut current = self
            .inner
            .descriptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if only_if_changed && is_same_relay_set_config(current.as_deref(), descriptors.as_deref()) {
            log::debug!("Relay configuration unchanged, reconnecting dropped relays");
            self.inner.pool.request_and_watch();
            return Ok(());
        }

        if current.take().is_some() {
            self.inner.pool.disconnect();
            self.inner.pool.unload_relays();
        }

        let Some(descriptors) = descriptors else {
            return Ok(());
        };

        let relays: Vec<Relay> = descriptors
            .iter()
            .cloned()
            .map(|descriptor| self.build_relay(descriptor))
            .collect();
        self.inner.pool.load_relays(relays)?;
        log::info!("Loaded {} relays", descriptors.len());

        *current = Some(descriptors);
        self.inner.pool.request_and_watch();
        Ok(())
    }

    /// Disconnects and unloads every relay.
    pub fn shutdown(&self) {
        let mut current = self
            .inner
            .descriptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        current.take();
        self.inner.pool.disconnect();
        self.inner.pool.unload_relays();

        let one_shots: Vec<_> = self.one_shots().drain().map(|(_, l)| l).collect();
        for listener in &one_shots {
            self.unsubscribe(listener);
        }
    }

    /// Registers a fresh, inactive subscription and returns its id.
    ///
    /// `on_eose` receives the relay and arrival time of every EOSE, which is
    /// what callers feed into [`Filter::advance_since`](crate::filter::Filter::advance_since).
    pub fn create_subscription(&self, on_eose: Option<EoseCallback>) -> String {
        self.inner.registry.create(on_eose)
    }

    /// Stores `filters` under `subscription_id` and sends them to every relay.
    pub fn send_filter(&self, subscription_id: &str, filters: Vec<TypedFilter>) {
        self.inner.registry.add(subscription_id, filters.clone());
        self.inner.pool.send_filter(subscription_id, &filters);
    }

    /// Stores `filters` and sends them only if they differ from the current
    /// ones in something other than `since`. Returns whether they were sent.
    ///
    /// An empty list closes the subscription on the relays.
    pub fn update_subscription(&self, subscription_id: &str, filters: Vec<TypedFilter>) -> bool {
        let empty = filters.is_empty();
        let changed = self.inner.registry.add(subscription_id, filters.clone());
        if !changed {
            return false;
        }

        if empty {
            self.inner.pool.close(subscription_id);
        } else {
            self.inner.pool.send_filter(subscription_id, &filters);
        }
        true
    }

    /// Stores `filters`; only relays without a connection pick them up, when
    /// they reconnect.
    pub fn send_filter_only_if_disconnected(&self, subscription_id: &str, filters: Vec<TypedFilter>) {
        self.inner.registry.add(subscription_id, filters);
        self.inner.pool.request_and_watch();
    }

    /// Subscribes and hands the first matching event to `on_response`.
    ///
    /// The callback runs at most once even when several relays answer at
    /// the same time; the subscription is closed right after it. Closing
    /// the subscription before any answer drops the callback.
    pub fn send_filter_and_stop_on_first_response(
        &self,
        subscription_id: &str,
        filters: Vec<TypedFilter>,
        on_response: impl FnOnce(&Event) + Send + 'static,
    ) {
        let listener: Arc<dyn RelayListener> =
            OneShotListener::new(subscription_id, self, Box::new(on_response));
        let replaced = self
            .one_shots()
            .insert(subscription_id.to_string(), Arc::clone(&listener));
        if let Some(replaced) = replaced {
            self.unsubscribe(&replaced);
        }
        self.subscribe(listener);
        self.send_filter(subscription_id, filters);
    }

    /// Closes a subscription and forgets it, along with its pending
    /// first-response callback.
    pub fn close(&self, subscription_id: &str) {
        let one_shot = self.one_shots().remove(subscription_id);
        if let Some(listener) = one_shot {
            self.unsubscribe(&listener);
        }
        self.inner.registry.remove(subscription_id);
        self.inner.pool.close(subscription_id);
    }

    fn one_shots(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn RelayListener>>> {
        self.inner
            .one_shots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the subscription exists and has filters.
    #[must_use]
    pub fn is_active(&self, subscription_id: &str) -> bool {
        self.inner.registry.is_active(subscription_id)
    }

    /// Every active subscription with its filters.
    #[must_use]
    pub fn all_subscriptions(&self) -> HashMap<String, Vec<TypedFilter>> {
        self.inner.registry.active().into_iter().collect()
    }

    /// Filters of one subscription, empty if unknown.
    #[must_use]
    pub fn subscription_filters(&self, subscription_id: &str) -> Vec<TypedFilter> {
        self.inner.registry.filters(subscription_id)
    }

    /// Publishes to every writable relay in the pool.
    pub fn send(&self, event: &Event) {
        self.inner.pool.send(event);
    }

    /// Publishes to one relay, opening it temporarily if needed.
    pub fn send_single(&self, event: &Event, descriptor: RelayDescriptor) {
        let event = event.clone();
        self.inner.pool.run_creating_if_needed(
            self.build_relay(descriptor),
            self.inner.config.ephemeral_relay_timeout,
            move |relay| relay.send(&event),
        );
    }

    /// Publishes to explicit relays regardless of their write permission,
    /// opening the ones that are not loaded.
    pub fn send_privately(&self, event: &Event, descriptors: Vec<RelayDescriptor>) {
        for descriptor in descriptors {
            let event = event.clone();
            self.inner.pool.run_creating_if_needed(
                self.build_relay(descriptor),
                self.inner.config.ephemeral_relay_timeout,
                move |relay| relay.send_override(&event),
            );
        }
    }

    /// Publishes to `url` only if it is loaded. Returns whether it was.
    pub fn send_if_exists(&self, event: &Event, url: &RelayUrl) -> bool {
        self.inner.pool.get_relay(url).is_some_and(|relay| {
            relay.send(event);
            true
        })
    }

    /// Publishes `event` and waits for relays to acknowledge it.
    ///
    /// Every targeted relay counts once, on whichever comes first: an `OK`,
    /// a disconnect, an EOSE, or an error. Resolves when all of them counted
    /// or when `timeout` (default [`ClientConfig::send_ack_timeout`])
    /// elapses. Returns whether at least one relay stored the event.
    pub async fn send_and_wait_for_response(
        &self,
        event: &Event,
        target: PublishTarget,
        timeout: Option<Duration>,
    ) -> bool {
        let timeout = timeout.unwrap_or(self.inner.config.send_ack_timeout);
        let deadline = tokio::time::Instant::now() + timeout;

        let targets: HashSet<RelayUrl> = match &target {
            PublishTarget::Pool => self
                .inner
                .pool
                .get_all()
                .iter()
                .map(|relay| relay.url().clone())
                .collect(),
            PublishTarget::Relays(descriptors) => {
                descriptors.iter().map(|d| d.url.clone()).collect()
            }
            PublishTarget::Single(descriptor) => HashSet::from([descriptor.url.clone()]),
            PublishTarget::Feeds(feeds) => self
                .feed_relays(feeds)
                .iter()
                .map(|relay| relay.url().clone())
                .collect(),
        };

        if targets.is_empty() {
            log::debug!("No relays to publish {} to", event.id);
            return false;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(AckListener::new(event.id, targets.clone(), tx));
        let _registration = Registration::new(&self.inner.pool, listener);

        match target {
            PublishTarget::Pool => self.send(event),
            PublishTarget::Relays(descriptors) => self.send_privately(event, descriptors),
            PublishTarget::Single(descriptor) => self.send_single(event, descriptor),
            PublishTarget::Feeds(feeds) => {
                for relay in self.feed_relays(&feeds) {
                    relay.send(event);
                }
            }
        }

        ack::wait_for_acks(rx, targets, deadline).await
    }

    fn feed_relays(&self, feeds: &HashSet<FeedType>) -> Vec<Relay> {
        self.inner
            .pool
            .get_all()
            .into_iter()
            .filter(|relay| {
                let descriptor = relay.descriptor();
                descriptor.write && !descriptor.feed_types.is_disjoint(feeds)
            })
            .collect()
    }

    /// Adds a listener for every relay callback.
    pub fn subscribe(&self, listener: Arc<dyn RelayListener>) {
        self.inner.pool.register(listener);
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, listener: &Arc<dyn RelayListener>) {
        self.inner.pool.unregister(listener);
    }

    /// Receiver of pool status changes.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<PoolStatus> {
        self.inner.pool.status()
    }

    /// Number of connected relays.
    #[must_use]
    pub fn connected_relays(&self) -> usize {
        self.inner.pool.connected_relays()
    }

    /// Number of loaded relays.
    #[must_use]
    pub fn available_relays(&self) -> usize {
        self.inner.pool.available_relays()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

/// Whether two relay sets would produce identical connections.
///
/// Matches descriptors by URL, so order does not matter.
fn is_same_relay_set_config(
    current: Option<&[RelayDescriptor]>,
    next: Option<&[RelayDescriptor]>,
) -> bool {
    match (current, next) {
        (None, None) => true,
        (Some(current), Some(next)) => {
            current.len() == next.len()
                && next.iter().all(|descriptor| {
                    current
                        .iter()
                        .find(|c| c.url == descriptor.url)
                        .is_some_and(|c| c.is_same_relay_config(descriptor))
                })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FeedType;

    fn descriptor(url: &str) -> RelayDescriptor {
        RelayDescriptor::parse(url).unwrap()
    }

    fn offline_client() -> Client {
        Client::new(
            ClientConfig::default(),
            Arc::new(crate::transport::MockTransportFactory::new()),
        )
    }

    fn pending_one_shots(client: &Client) -> usize {
        client.inner.one_shots.lock().unwrap().len()
    }

    #[test]
    fn closing_unanswered_query_releases_its_listener() {
        let client = offline_client();
        client.send_filter_and_stop_on_first_response("lookup", vec![], |_| {});
        client.send_filter_and_stop_on_first_response("lookup", vec![], |_| {});
        assert_eq!(pending_one_shots(&client), 1);

        client.close("lookup");
        assert_eq!(pending_one_shots(&client), 0);
    }

    #[test]
    fn shutdown_releases_pending_queries() {
        let client = offline_client();
        client.send_filter_and_stop_on_first_response("a", vec![], |_| {});
        client.send_filter_and_stop_on_first_response("b", vec![], |_| {});

        client.shutdown();
        assert_eq!(pending_one_shots(&client), 0);
    }

    #[test]
    fn relay_set_comparison_ignores_order() {
        let a = vec![descriptor("wss://a.example.com"), descriptor("wss://b.example.com")];
        let b = vec![descriptor("wss://b.example.com"), descriptor("wss://a.example.com")];
        assert!(is_same_relay_set_config(Some(&a), Some(&b)));
    }

    #[test]
    fn relay_set_comparison_detects_differences() {
        let a = vec![descriptor("wss://a.example.com")];
        let read_only = vec![descriptor("wss://a.example.com").read_only()];
        let other_feeds = vec![descriptor("wss://a.example.com").with_feed_types([FeedType::Search])];
        let bigger = vec![descriptor("wss://a.example.com"), descriptor("wss://b.example.com")];

        assert!(!is_same_relay_set_config(Some(&a), Some(&read_only)));
        assert!(!is_same_relay_set_config(Some(&a), Some(&other_feeds)));
        assert!(!is_same_relay_set_config(Some(&a), Some(&bigger)));
        assert!(!is_same_relay_set_config(None, Some(&a)));
        assert!(!is_same_relay_set_config(Some(&a), None));
        assert!(is_same_relay_set_config(None, None));
    }
}
