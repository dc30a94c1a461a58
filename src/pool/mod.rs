//! Relay pool.
//!
//! The pool owns every relay of the session, fans filters and events out to
//! all of them, and folds their callbacks into one listener stream. It never
//! rejects anything centrally: each relay applies its own read, write and
//! feed-type gates.
//!
//! Pool status (`connected`, `available`) is published on a watch channel and
//! only changes when the tuple actually changes.

mod status;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use nostr::{Event, EventId, RelayUrl, Timestamp};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::filter::TypedFilter;
use crate::listeners::ListenerSet;
use crate::relay::{Relay, RelayError, RelayListener, RelayResult, RelayState};

pub use status::PoolStatus;

/// Handle to the session's relays. Clones share the pool.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    relays: Mutex<Vec<Relay>>,
    listeners: ListenerSet<dyn RelayListener>,
    forwarder: Arc<dyn RelayListener>,
    status: watch::Sender<PoolStatus>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for timer in timers.drain(..) {
            timer.abort();
        }
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        let (status, _) = watch::channel(PoolStatus::default());
        let inner = Arc::new_cyclic(|pool: &Weak<PoolInner>| PoolInner {
            relays: Mutex::new(Vec::new()),
            listeners: ListenerSet::new(),
            forwarder: Arc::new(Forwarder { pool: pool.clone() }),
            status,
            timers: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    fn relays_guard(&self) -> MutexGuard<'_, Vec<Relay>> {
        self.inner
            .relays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current relay list.
    #[must_use]
    pub fn get_all(&self) -> Vec<Relay> {
        self.relays_guard().clone()
    }

    /// Relay loaded for `url`, if any.
    #[must_use]
    pub fn get_relay(&self, url: &RelayUrl) -> Option<Relay> {
        self.relays_guard().iter().find(|r| r.url() == url).cloned()
    }

    /// Relays whose URL is in `urls`.
    #[must_use]
    pub fn get_relays(&self, urls: &HashSet<RelayUrl>) -> Vec<Relay> {
        self.relays_guard()
            .iter()
            .filter(|r| urls.contains(r.url()))
            .cloned()
            .collect()
    }

    /// Adds a pool-level listener.
    pub fn register(&self, listener: Arc<dyn RelayListener>) {
        self.inner.listeners.add(listener);
    }

    /// Removes a pool-level listener.
    pub fn unregister(&self, listener: &Arc<dyn RelayListener>) {
        self.inner.listeners.remove(listener);
    }

    /// Loads a new relay set.
    ///
    /// The previous set should be unloaded first; relays whose URL is
    /// already loaded are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::EmptyRelaySet`] if `relays` is empty.
    pub fn load_relays(&self, relays: Vec<Relay>) -> RelayResult<()> {
        if relays.is_empty() {
            return Err(RelayError::EmptyRelaySet);
        }

        {
            let mut loaded = self.relays_guard();
            for relay in relays {
                if loaded.iter().any(|r| r.url() == relay.url()) {
                    log::warn!("Relay {} is already loaded", relay.url());
                    continue;
                }
                relay.register(Arc::clone(&self.inner.forwarder));
                loaded.push(relay);
            }
        }

        self.update_status();
        Ok(())
    }

    /// Unregisters and drops every relay and cancels ephemeral timers.
    pub fn unload_relays(&self) {
        let relays = std::mem::take(&mut *self.relays_guard());
        for relay in &relays {
            relay.unregister(&self.inner.forwarder);
        }

        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .for_each(|timer| timer.abort());

        log::debug!("Unloaded {} relays", relays.len());
        self.update_status();
    }

    /// Adds one relay. Returns `false` if its URL is already loaded.
    pub fn add_relay(&self, relay: Relay) -> bool {
        {
            let mut loaded = self.relays_guard();
            if loaded.iter().any(|r| r.url() == relay.url()) {
                return false;
            }
            relay.register(Arc::clone(&self.inner.forwarder));
            loaded.push(relay);
        }

        self.update_status();
        true
    }

    /// Removes and disconnects the relay for `url`.
    pub fn remove_relay(&self, url: &RelayUrl) -> Option<Relay> {
        let removed = {
            let mut loaded = self.relays_guard();
            let index = loaded.iter().position(|r| r.url() == url)?;
            loaded.remove(index)
        };

        removed.unregister(&self.inner.forwarder);
        removed.disconnect();
        self.update_status();
        Some(removed)
    }

    /// Removes `relay` only if it is still the instance loaded for its URL.
    fn remove_if_same(&self, relay: &Relay) -> bool {
        let removed = {
            let mut loaded = self.relays_guard();
            let Some(index) = loaded.iter().position(|r| Relay::ptr_eq(r, relay)) else {
                return false;
            };
            loaded.remove(index)
        };

        removed.unregister(&self.inner.forwarder);
        removed.disconnect();
        self.update_status();
        true
    }

    /// Connects every relay.
    pub fn connect(&self) {
        for relay in self.get_all() {
            relay.connect();
        }
    }

    /// Disconnects every relay.
    pub fn disconnect(&self) {
        for relay in self.get_all() {
            relay.disconnect();
        }
        self.update_status();
    }

    /// Connects relays that have no connection; live ones are left alone.
    pub fn request_and_watch(&self) {
        for relay in self.get_all() {
            if !relay.has_socket() {
                relay.connect();
            }
        }
    }

    /// Connects dropped relays and re-sends subscriptions to live ones.
    pub fn connect_and_send_filters_if_disconnected(&self) {
        for relay in self.get_all() {
            if relay.is_connected() {
                relay.renew_filters();
            } else if !relay.has_socket() {
                relay.connect();
            }
        }
    }

    /// Sends a subscription to every relay.
    pub fn send_filter(&self, subscription_id: &str, filters: &[TypedFilter]) {
        for relay in self.get_all() {
            relay.send_filter(subscription_id, filters);
        }
    }

    /// Publishes an event to every relay.
    pub fn send(&self, event: &Event) {
        for relay in self.get_all() {
            relay.send(event);
        }
    }

    /// Publishes an event to the relays in `urls`.
    ///
    /// With `override_write`, relays that are not writable publish anyway.
    pub fn send_to_selected_relays(
        &self,
        urls: &HashSet<RelayUrl>,
        event: &Event,
        override_write: bool,
    ) {
        for relay in self.get_relays(urls) {
            if override_write {
                relay.send_override(event);
            } else {
                relay.send(event);
            }
        }
    }

    /// Closes a subscription on every relay.
    pub fn close(&self, subscription_id: &str) {
        for relay in self.get_all() {
            relay.close(subscription_id);
        }
    }

    /// Runs `when_connected` on a connection to `relay`'s URL.
    ///
    /// Reuses the loaded relay for that URL when there is one. Otherwise
    /// `relay` joins the pool as an ephemeral relay and is disconnected and
    /// removed after `timeout`, unless it was replaced in the meantime.
    /// Returns the relay that was used.
    pub fn run_creating_if_needed(
        &self,
        relay: Relay,
        timeout: Duration,
        when_connected: impl FnOnce(&Relay) + Send + 'static,
    ) -> Relay {
        if let Some(existing) = self.get_relay(relay.url()) {
            existing.connect_and_run(when_connected);
            return existing;
        }

        if !self.add_relay(relay.clone()) {
            let existing = self.get_relay(relay.url()).unwrap_or(relay);
            existing.connect_and_run(when_connected);
            return existing;
        }

        log::debug!("Opening ephemeral relay {} for {timeout:?}", relay.url());
        self.schedule_removal(&relay, timeout);
        relay.connect_and_run(when_connected);
        relay
    }

    fn schedule_removal(&self, relay: &Relay, timeout: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime to expire ephemeral relay {}", relay.url());
            return;
        };

        let pool = Arc::downgrade(&self.inner);
        let relay = relay.clone();
        let mut timers = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        timers.retain(|timer| !timer.is_finished());

        timers.push(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = pool.upgrade() {
                let pool = RelayPool { inner };
                if pool.remove_if_same(&relay) {
                    log::debug!("Expired ephemeral relay {}", relay.url());
                }
            }
        }));
    }

    /// Number of connected relays.
    #[must_use]
    pub fn connected_relays(&self) -> usize {
        self.get_all().iter().filter(|r| r.is_connected()).count()
    }

    /// Number of loaded relays.
    #[must_use]
    pub fn available_relays(&self) -> usize {
        self.relays_guard().len()
    }

    /// Latest status.
    #[must_use]
    pub fn current_status(&self) -> PoolStatus {
        *self.inner.status.borrow()
    }

    /// Receiver notified whenever the status tuple changes.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<PoolStatus> {
        self.inner.status.subscribe()
    }

    /// Recomputes the status and publishes it if it changed.
    pub fn update_status(&self) {
        let relays = self.get_all();
        let next = PoolStatus::new(
            relays.iter().filter(|r| r.is_connected()).count(),
            relays.len(),
        );
        self.publish_status(next);
    }

    fn publish_status(&self, next: PoolStatus) {
        self.inner.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn notify(&self, f: impl Fn(&dyn RelayListener)) {
        self.inner.listeners.for_each(|listener| f(listener));
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.get_all())
            .field("status", &self.current_status())
            .finish()
    }
}

/// Registered on every loaded relay; re-emits to the pool's listeners.
struct Forwarder {
    pool: Weak<PoolInner>,
}

impl Forwarder {
    fn with_pool(&self, f: impl FnOnce(&RelayPool)) {
        if let Some(inner) = self.pool.upgrade() {
            f(&RelayPool { inner });
        }
    }
}

impl RelayListener for Forwarder {
    fn on_event(&self, relay: &Relay, subscription_id: &str, event: &Event, after_eose: bool) {
        self.with_pool(|pool| {
            pool.notify(|l| l.on_event(relay, subscription_id, event, after_eose));
        });
    }

    fn on_eose(&self, relay: &Relay, subscription_id: &str, time: Timestamp) {
        self.with_pool(|pool| pool.notify(|l| l.on_eose(relay, subscription_id, time)));
    }

    fn on_error(&self, relay: &Relay, subscription_id: &str, error: &RelayError) {
        self.with_pool(|pool| pool.notify(|l| l.on_error(relay, subscription_id, error)));
    }

    fn on_send_response(&self, relay: &Relay, event_id: &EventId, success: bool, message: &str) {
        self.with_pool(|pool| {
            pool.notify(|l| l.on_send_response(relay, event_id, success, message));
        });
    }

    fn on_auth(&self, relay: &Relay, challenge: &str) {
        self.with_pool(|pool| pool.notify(|l| l.on_auth(relay, challenge)));
    }

    fn on_notify(&self, relay: &Relay, message: &str) {
        self.with_pool(|pool| pool.notify(|l| l.on_notify(relay, message)));
    }

    fn on_notice(&self, relay: &Relay, message: &str) {
        self.with_pool(|pool| pool.notify(|l| l.on_notice(relay, message)));
    }

    fn on_closed(&self, relay: &Relay, subscription_id: &str, message: &str) {
        self.with_pool(|pool| pool.notify(|l| l.on_closed(relay, subscription_id, message)));
    }

    fn on_state_change(&self, relay: &Relay, state: RelayState) {
        self.with_pool(|pool| {
            pool.update_status();
            pool.notify(|l| l.on_state_change(relay, state));
        });
    }

    fn on_send(&self, relay: &Relay, frame: &str, success: bool) {
        self.with_pool(|pool| pool.notify(|l| l.on_send(relay, frame, success)));
    }

    fn on_before_send(&self, relay: &Relay, event: &Event) {
        self.with_pool(|pool| pool.notify(|l| l.on_before_send(relay, event)));
    }
}
