//! One relay connection.
//!
//! A [`Relay`] owns a single transport and a worker task that drains the
//! transport's events. It never retries on its own: a dropped connection is
//! re-established only when the owner calls [`Relay::connect`] or when a send
//! arrives after the reconnect cooldown elapsed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use nostr::{Event, EventId, Kind, RelayUrl, Timestamp};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use super::error::RelayError;
use super::listener::RelayListener;
use super::message::{ClientMessage, RelayMessage};
use super::types::{RelayDescriptor, RelayState};
use crate::config::RelayOptions;
use crate::filter::TypedFilter;
use crate::listeners::ListenerSet;
use crate::stats::RelayStat;
use crate::subscription::SubscriptionRegistry;
use crate::transport::{Transport, TransportEvent, TransportFactory};

/// Ack message reported for events a read-only relay refuses to publish.
pub const BLOCKED_NOT_WRITABLE: &str = "blocked: relay is not writable";

/// Prefix of `OK` messages that ask the client to authenticate first.
const AUTH_REQUIRED_PREFIX: &str = "auth-required";

type OnConnected = Box<dyn FnOnce(&Relay) + Send>;

/// Handle to one relay connection. Clones share the connection.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayShared>,
}

struct RelayShared {
    descriptor: RelayDescriptor,
    options: RelayOptions,
    factory: Arc<dyn TransportFactory>,
    registry: Arc<SubscriptionRegistry>,
    stats: Arc<RelayStat>,
    listeners: ListenerSet<dyn RelayListener>,
    state: Mutex<ConnectionState>,
}

#[derive(Default)]
struct ConnectionState {
    socket: Option<Box<dyn Transport>>,
    ready: bool,
    generation: u64,
    worker: Option<JoinHandle<()>>,
    last_connect_attempt: Option<Instant>,
    on_connected: Vec<OnConnected>,
    eose_received: HashSet<String>,
    auth_challenges: HashSet<String>,
    auth_responses: HashMap<EventId, bool>,
    outbox: HashMap<EventId, Event>,
}

impl ConnectionState {
    fn reset_session(&mut self) {
        self.ready = false;
        self.on_connected.clear();
        self.eose_received.clear();
        self.auth_challenges.clear();
        self.auth_responses.clear();
    }
}

impl Drop for RelayShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = state.socket.take() {
            socket.disconnect();
        }
        if let Some(worker) = state.worker.take() {
            worker.abort();
        }
    }
}

impl Relay {
    /// Creates a disconnected relay.
    #[must_use]
    pub fn new(
        descriptor: RelayDescriptor,
        options: RelayOptions,
        factory: Arc<dyn TransportFactory>,
        registry: Arc<SubscriptionRegistry>,
        stats: Arc<RelayStat>,
    ) -> Self {
        Self {
            inner: Arc::new(RelayShared {
                descriptor,
                options,
                factory,
                registry,
                stats,
                listeners: ListenerSet::new(),
                state: Mutex::new(ConnectionState::default()),
            }),
        }
    }

    /// Relay URL.
    #[must_use]
    pub fn url(&self) -> &RelayUrl {
        &self.inner.descriptor.url
    }

    /// Configuration this connection was built from.
    #[must_use]
    pub fn descriptor(&self) -> &RelayDescriptor {
        &self.inner.descriptor
    }

    /// Runtime statistics for this URL.
    #[must_use]
    pub fn stats(&self) -> &Arc<RelayStat> {
        &self.inner.stats
    }

    /// Whether two handles point at the same connection.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Whether the handshake completed and the socket is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().ready
    }

    /// Whether a socket exists, connected or still handshaking.
    #[must_use]
    pub fn has_socket(&self) -> bool {
        self.lock().socket.is_some()
    }

    /// Number of published events still waiting for an `OK`.
    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.lock().outbox.len()
    }

    /// Whether `filter` should be sent to this relay.
    #[must_use]
    pub fn is_match(&self, filter: &TypedFilter) -> bool {
        filter.applies_to(&self.inner.descriptor.feed_types, self.url())
    }

    /// Whether `other` describes exactly this connection.
    #[must_use]
    pub fn is_same_relay_config(&self, other: &RelayDescriptor) -> bool {
        self.inner.descriptor.is_same_relay_config(other)
    }

    /// Adds a listener.
    pub fn register(&self, listener: Arc<dyn RelayListener>) {
        self.inner.listeners.add(listener);
    }

    /// Removes a listener.
    pub fn unregister(&self, listener: &Arc<dyn RelayListener>) {
        self.inner.listeners.remove(listener);
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, f: impl Fn(&dyn RelayListener)) {
        self.inner.listeners.for_each(|listener| f(listener));
    }

    /// Opens the connection if there is none. Idempotent.
    pub fn connect(&self) {
        self.start(None);
    }

    /// Opens the connection if needed and runs `on_connected` once the
    /// handshake completed. Runs it right away if already connected.
    ///
    /// The callback is dropped without running if the connection fails.
    pub fn connect_and_run(&self, on_connected: impl FnOnce(&Self) + Send + 'static) {
        self.start(Some(Box::new(on_connected)));
    }

    fn start(&self, on_connected: Option<OnConnected>) {
        let mut state = self.lock();

        if state.ready {
            drop(state);
            if let Some(callback) = on_connected {
                self.run_on_connected(callback);
            }
            return;
        }

        state.on_connected.extend(on_connected);
        if state.socket.is_some() {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                state.on_connected.clear();
                drop(state);
                self.report_error(&RelayError::Transport(format!("no tokio runtime: {e}")));
                return;
            }
        };

        state.generation += 1;
        state.last_connect_attempt = Some(Instant::now());
        let generation = state.generation;

        log::debug!("Connecting to {}", self.url());

        let (tx, rx) = mpsc::unbounded_channel();
        match self
            .inner
            .factory
            .connect(self.url(), self.inner.descriptor.force_proxy, tx)
        {
            Ok(socket) => {
                state.socket = Some(socket);
                state.worker = Some(runtime.spawn(run_worker(
                    Arc::downgrade(&self.inner),
                    generation,
                    rx,
                )));
            }
            Err(e) => {
                state.on_connected.clear();
                drop(state);
                self.report_error(&e);
            }
        }
    }

    /// Closes the connection. Idempotent.
    ///
    /// Pending `connect_and_run` callbacks are dropped and the reconnect
    /// cooldown is reset, so the next send reconnects immediately.
    pub fn disconnect(&self) {
        let (socket, worker) = {
            let mut state = self.lock();
            state.generation += 1;
            state.last_connect_attempt = None;
            state.reset_session();
            (state.socket.take(), state.worker.take())
        };

        let Some(socket) = socket else {
            return;
        };

        log::debug!("Disconnecting from {}", self.url());
        socket.disconnect();
        drop(socket);
        if let Some(worker) = worker {
            worker.abort();
        }

        self.notify(|l| l.on_state_change(self, RelayState::Disconnected));
    }

    fn reconnect_if_cooled_down(&self) {
        let due = {
            let state = self.lock();
            state.socket.is_none()
                && state
                    .last_connect_attempt
                    .map_or(true, |at| at.elapsed() >= self.inner.options.reconnect_cooldown)
        };

        if due {
            self.connect();
        }
    }

    /// Sends a subscription, keeping only the filters meant for this relay.
    ///
    /// Nothing is sent when the relay is not readable or no filter applies.
    /// A disconnected relay reconnects (subject to the cooldown) and picks
    /// the subscription up from the registry once connected.
    pub fn send_filter(&self, subscription_id: &str, filters: &[TypedFilter]) {
        if !self.inner.descriptor.read {
            return;
        }

        if !self.has_socket() {
            self.reconnect_if_cooled_down();
            return;
        }

        let applicable: Vec<TypedFilter> = filters
            .iter()
            .filter(|f| self.is_match(f))
            .cloned()
            .collect();

        if applicable.is_empty() {
            return;
        }

        let frame = ClientMessage::req(
            subscription_id,
            &applicable,
            self.url(),
            self.inner.options.max_filters_per_request,
        );
        if self.write(&frame) {
            // The relay replays stored events for the new request.
            self.lock().eose_received.remove(subscription_id);
        }
    }

    /// Re-sends every active subscription in the registry.
    pub fn renew_filters(&self) {
        for (id, filters) in self.inner.registry.active() {
            self.send_filter(&id, &filters);
        }
    }

    /// Publishes an event, honoring write permission.
    ///
    /// Authentication responses are always sent. Any other event sent to a
    /// relay that is not writable never reaches the network; listeners get a
    /// failed send response instead so that publish waiters can resolve.
    pub fn send(&self, event: &Event) {
        if event.kind == Kind::Authentication {
            self.send_auth(event);
            return;
        }

        if !self.inner.descriptor.write {
            log::debug!("Not publishing {} to read-only relay {}", event.id, self.url());
            self.notify(|l| l.on_send_response(self, &event.id, false, BLOCKED_NOT_WRITABLE));
            return;
        }

        self.publish(event);
    }

    /// Publishes an event regardless of write permission.
    pub fn send_override(&self, event: &Event) {
        if event.kind == Kind::Authentication {
            self.send_auth(event);
        } else {
            self.publish(event);
        }
    }

    fn send_auth(&self, event: &Event) {
        self.lock().auth_responses.insert(event.id, false);
        self.write(&ClientMessage::Auth(Box::new(event.clone())));
    }

    fn publish(&self, event: &Event) {
        self.notify(|l| l.on_before_send(self, event));

        let connected = {
            let mut state = self.lock();
            state.outbox.insert(event.id, event.clone());
            state.ready
        };

        if connected {
            self.write(&ClientMessage::Event(Box::new(event.clone())));
        } else {
            self.reconnect_if_cooled_down();
        }
    }

    /// Re-sends every event still waiting for an `OK`.
    pub fn send_outbox(&self) {
        let pending: Vec<Event> = self.lock().outbox.values().cloned().collect();
        for event in pending {
            self.write(&ClientMessage::Event(Box::new(event)));
        }
    }

    /// Terminates a subscription on this relay. Skipped when disconnected.
    pub fn close(&self, subscription_id: &str) {
        if self.is_connected() {
            self.write(&ClientMessage::Close(subscription_id.to_string()));
        }
    }

    fn write(&self, message: &ClientMessage) -> bool {
        let frame = message.as_json();
        let sent = {
            let state = self.lock();
            match (&state.socket, state.ready) {
                (Some(socket), true) => socket.send(frame.clone()),
                _ => false,
            }
        };

        if sent {
            self.inner.stats.add_sent_bytes(frame.len());
        }
        self.notify(|l| l.on_send(self, &frame, sent));
        sent
    }

    fn report_error(&self, error: &RelayError) {
        log::warn!("Relay {}: {error}", self.url());
        self.inner.stats.new_error(error.to_string());
        self.notify(|l| l.on_error(self, "", error));
    }

    fn run_on_connected(&self, callback: OnConnected) {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
            log::error!("On-connect callback for {} panicked", self.url());
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Drops the socket if `generation` is still the live connection.
    fn mark_disconnected(&self, generation: u64) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        state.socket = None;
        state.worker = None;
        state.reset_session();
        true
    }

    /// Handles one transport event. Returns whether the worker keeps going.
    fn handle_transport_event(&self, generation: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Open { ping, compression } => {
                let ping_ms = u64::try_from(ping.as_millis()).unwrap_or(u64::MAX);
                self.inner.stats.record_handshake(ping_ms, compression);

                let callbacks = {
                    let mut state = self.lock();
                    state.ready = true;
                    std::mem::take(&mut state.on_connected)
                };

                log::info!("Connected to {} in {ping_ms}ms", self.url());
                self.notify(|l| l.on_state_change(self, RelayState::Connected));
                self.renew_filters();
                self.send_outbox();

                for callback in callbacks {
                    self.run_on_connected(callback);
                }
                true
            }
            TransportEvent::Message(text) => {
                self.inner.stats.add_received_bytes(text.len());
                match RelayMessage::from_json(&text) {
                    Ok(message) => self.handle_message(message),
                    Err(e) => self.report_error(&e),
                }
                true
            }
            TransportEvent::Closing { code, reason } => {
                log::debug!("Relay {} is closing ({code}): {reason}", self.url());
                self.notify(|l| l.on_state_change(self, RelayState::Disconnecting));
                true
            }
            TransportEvent::Closed { code, reason } => {
                log::info!("Relay {} closed ({code}): {reason}", self.url());
                if self.mark_disconnected(generation) {
                    self.notify(|l| l.on_state_change(self, RelayState::Disconnected));
                }
                false
            }
            TransportEvent::Failure { message } => {
                if self.mark_disconnected(generation) {
                    self.report_error(&RelayError::Connection {
                        url: self.url().to_string(),
                        reason: message,
                    });
                    self.notify(|l| l.on_state_change(self, RelayState::Disconnected));
                }
                false
            }
        }
    }

    fn handle_message(&self, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.handle_event(&subscription_id, &event),
            RelayMessage::Eose(subscription_id) => {
                self.lock().eose_received.insert(subscription_id.clone());
                let now = Timestamp::now();
                self.inner
                    .registry
                    .notify_eose(&subscription_id, self.url(), now);
                self.notify(|l| l.on_eose(self, &subscription_id, now));
            }
            RelayMessage::Notice(text) => {
                let notice = RelayError::Notice {
                    url: self.url().to_string(),
                    message: text.clone(),
                };
                log::warn!("{notice}");
                self.inner.stats.new_notice(text.clone());
                self.notify(|l| l.on_notice(self, &text));
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => self.handle_ok(&event_id, success, &message),
            RelayMessage::Auth(challenge) => {
                let first_time = self.lock().auth_challenges.insert(challenge.clone());
                if first_time {
                    self.notify(|l| l.on_auth(self, &challenge));
                }
            }
            RelayMessage::Notify(text) => {
                self.notify(|l| l.on_notify(self, &text));
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                log::debug!("Relay {} closed {subscription_id}: {message}", self.url());
                self.notify(|l| l.on_closed(self, &subscription_id, &message));
            }
        }
    }

    fn handle_event(&self, subscription_id: &str, event: &Event) {
        let filters = self.inner.registry.filters(subscription_id);
        let applicable: Vec<&TypedFilter> = filters.iter().filter(|f| self.is_match(f)).collect();
        if !applicable.is_empty() && !applicable.iter().any(|f| f.filter.matches(event, self.url())) {
            log::debug!(
                "Dropping event {} from {}: it does not match {subscription_id}",
                event.id,
                self.url()
            );
            self.inner.stats.new_spam();
            return;
        }

        let after_eose = self.lock().eose_received.contains(subscription_id);
        self.notify(|l| l.on_event(self, subscription_id, event, after_eose));
    }

    fn handle_ok(&self, event_id: &EventId, success: bool, message: &str) {
        let first_auth = {
            let mut state = self.lock();
            if success || !message.starts_with(AUTH_REQUIRED_PREFIX) {
                state.outbox.remove(event_id);
            }

            let already_authenticated = state.auth_responses.values().any(|ok| *ok);
            match state.auth_responses.get_mut(event_id) {
                Some(answered) if success => {
                    *answered = true;
                    !already_authenticated
                }
                _ => false,
            }
        };

        if !success {
            let rejection = RelayError::Rejected {
                relay: self.url().to_string(),
                reason: format!("{event_id}: {message}"),
            };
            log::debug!("{rejection}");
            self.inner.stats.new_error(rejection.to_string());
        }

        self.notify(|l| l.on_send_response(self, event_id, success, message));

        if first_auth {
            log::debug!("Authenticated with {}", self.url());
            self.renew_filters();
            self.send_outbox();
        }
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("url", &self.url().to_string())
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn run_worker(
    relay: Weak<RelayShared>,
    generation: u64,
    mut events: UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = relay.upgrade() else {
            break;
        };
        let relay = Relay { inner };
        if !relay.is_current(generation) || !relay.handle_transport_event(generation, event) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use nostr::{EventBuilder, Keys, Tag};
    use serde_json::json;

    use super::*;
    use crate::filter::{FeedType, Filter};
    use crate::transport::MockTransportFactory;

    const URL: &str = "wss://relay.example.com";

    fn relay_with(descriptor: RelayDescriptor) -> (Relay, MockTransportFactory, Arc<SubscriptionRegistry>) {
        let factory = MockTransportFactory::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let relay = Relay::new(
            descriptor,
            RelayOptions::default(),
            Arc::new(factory.clone()),
            Arc::clone(&registry),
            Arc::new(RelayStat::default()),
        );
        (relay, factory, registry)
    }

    fn descriptor() -> RelayDescriptor {
        RelayDescriptor::parse(URL).unwrap()
    }

    async fn connected(relay: &Relay) {
        relay.connect();
        for _ in 0..200 {
            if relay.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("relay did not connect");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    fn note(keys: &Keys) -> Event {
        EventBuilder::text_note("hello").sign_with_keys(keys).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        events: AtomicUsize,
        after_eose: AtomicUsize,
        auths: AtomicUsize,
        acks: Mutex<Vec<(EventId, bool, String)>>,
        states: Mutex<Vec<RelayState>>,
    }

    impl RelayListener for Recorder {
        fn on_event(&self, _: &Relay, _: &str, _: &Event, after_eose: bool) {
            self.events.fetch_add(1, Ordering::SeqCst);
            if after_eose {
                self.after_eose.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_auth(&self, _: &Relay, _: &str) {
            self.auths.fetch_add(1, Ordering::SeqCst);
        }

        fn on_send_response(&self, _: &Relay, id: &EventId, success: bool, message: &str) {
            self.acks.lock().unwrap().push((*id, success, message.to_string()));
        }

        fn on_state_change(&self, _: &Relay, state: RelayState) {
            self.states.lock().unwrap().push(state);
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (relay, factory, _) = relay_with(descriptor());
        connected(&relay).await;
        relay.connect();
        relay.connect();

        assert_eq!(factory.connect_count(relay.url()), 1);
    }

    #[tokio::test]
    async fn filters_for_other_feeds_are_not_sent() {
        let (relay, factory, _) =
            relay_with(descriptor().with_feed_types([FeedType::Global]));
        connected(&relay).await;

        let follows = TypedFilter::new(Filter::new(), [FeedType::Follows]);
        relay.send_filter("sub", &[follows]);

        let global = TypedFilter::new(Filter::new(), [FeedType::Global]);
        relay.send_filter("sub", &[global]);

        let reqs = factory.latest(relay.url()).unwrap().sent_of_type("REQ");
        assert_eq!(reqs.len(), 1);
    }

    #[tokio::test]
    async fn unreadable_relay_receives_no_filters() {
        let (relay, factory, _) = relay_with(descriptor().write_only());
        connected(&relay).await;

        relay.send_filter("sub", &[TypedFilter::new(Filter::new(), [FeedType::Global])]);

        assert!(factory.sent_frames(relay.url()).is_empty());
    }

    #[tokio::test]
    async fn read_only_relay_blocks_events_but_not_auth() {
        let (relay, factory, _) = relay_with(descriptor().read_only());
        let recorder = Arc::new(Recorder::default());
        relay.register(recorder.clone());
        connected(&relay).await;

        let keys = Keys::generate();
        let event = note(&keys);
        relay.send(&event);
        assert!(factory.sent_frames(relay.url()).is_empty());
        assert!(!recorder.acks.lock().unwrap()[0].1);

        let auth = EventBuilder::new(Kind::Authentication, "")
            .tags([Tag::parse(["challenge", "abc"]).unwrap()])
            .sign_with_keys(&keys)
            .unwrap();
        relay.send(&auth);
        assert_eq!(factory.latest(relay.url()).unwrap().sent_of_type("AUTH").len(), 1);
    }

    #[tokio::test]
    async fn outbox_is_kept_until_ok() {
        let (relay, factory, _) = relay_with(descriptor());
        connected(&relay).await;

        let event = note(&Keys::generate());
        relay.send(&event);
        assert_eq!(relay.outbox_len(), 1);

        let connection = factory.latest(relay.url()).unwrap();
        connection.push_json(&json!(["OK", event.id.to_hex(), false, "auth-required: sign in"]));
        settle().await;
        assert_eq!(relay.outbox_len(), 1);

        connection.push_json(&json!(["OK", event.id.to_hex(), true, ""]));
        settle().await;
        assert_eq!(relay.outbox_len(), 0);
    }

    #[tokio::test]
    async fn rejections_and_notices_are_recorded() {
        let (relay, factory, _) = relay_with(descriptor());
        let recorder = Arc::new(Recorder::default());
        relay.register(recorder.clone());
        connected(&relay).await;

        let event = note(&Keys::generate());
        relay.send(&event);
        let connection = factory.latest(relay.url()).unwrap();
        connection.push_json(&json!(["OK", event.id.to_hex(), false, "blocked: spam"]));
        connection.push_json(&json!(["NOTICE", "slow down"]));
        settle().await;

        let snapshot = relay.stats().snapshot();
        let error = &snapshot.last_error().unwrap().message;
        assert!(error.contains("rejected event"));
        assert!(error.ends_with("blocked: spam"));
        assert_eq!(snapshot.last_notice().unwrap().message, "slow down");
        assert!(!recorder.acks.lock().unwrap()[0].1);
    }

    #[tokio::test]
    async fn events_published_while_disconnected_go_out_on_connect() {
        let (relay, factory, _) = relay_with(descriptor());

        relay.send(&note(&Keys::generate()));
        settle().await;

        assert!(relay.is_connected());
        assert_eq!(factory.latest(relay.url()).unwrap().sent_of_type("EVENT").len(), 1);
    }

    #[tokio::test]
    async fn active_subscriptions_are_sent_on_connect() {
        let (relay, factory, registry) = relay_with(descriptor());
        registry.add("feed", vec![TypedFilter::new(Filter::new(), [FeedType::Global])]);

        connected(&relay).await;
        settle().await;

        let reqs = factory.latest(relay.url()).unwrap().sent_of_type("REQ");
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0][1], "feed");
    }

    #[tokio::test]
    async fn after_eose_flag_follows_eose() {
        let (relay, factory, _) = relay_with(descriptor());
        let recorder = Arc::new(Recorder::default());
        relay.register(recorder.clone());
        connected(&relay).await;

        let event = note(&Keys::generate());
        let connection = factory.latest(relay.url()).unwrap();
        connection.push_json(&json!(["EVENT", "sub", event]));
        connection.push_json(&json!(["EOSE", "sub"]));
        connection.push_json(&json!(["EVENT", "sub", event]));
        settle().await;

        assert_eq!(recorder.events.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.after_eose.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_request_resets_after_eose_flag() {
        let (relay, factory, _) = relay_with(descriptor());
        let recorder = Arc::new(Recorder::default());
        relay.register(recorder.clone());
        connected(&relay).await;

        let connection = factory.latest(relay.url()).unwrap();
        connection.push_json(&json!(["EOSE", "sub"]));
        settle().await;

        relay.send_filter("sub", &[TypedFilter::new(Filter::new(), [FeedType::Global])]);
        connection.push_json(&json!(["EVENT", "sub", note(&Keys::generate())]));
        settle().await;

        assert_eq!(recorder.events.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.after_eose.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_eose_callback_keeps_worker_alive() {
        let (relay, factory, registry) = relay_with(descriptor());
        let recorder = Arc::new(Recorder::default());
        relay.register(recorder.clone());
        let id = registry.create(Some(Arc::new(|_: &RelayUrl, _: Timestamp| {
            panic!("subscriber failed");
        })));
        registry.add(&id, vec![TypedFilter::new(Filter::new(), [FeedType::Global])]);
        connected(&relay).await;

        let connection = factory.latest(relay.url()).unwrap();
        connection.push_json(&json!(["EOSE", id]));
        connection.push_json(&json!(["EVENT", "other", note(&Keys::generate())]));
        settle().await;

        assert!(relay.is_connected());
        assert_eq!(recorder.events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_matching_events_are_dropped() {
        let (relay, factory, registry) = relay_with(descriptor());
        let recorder = Arc::new(Recorder::default());
        relay.register(recorder.clone());
        registry.add(
            "sub",
            vec![TypedFilter::new(Filter::new().kinds([Kind::Metadata]), [FeedType::Global])],
        );
        connected(&relay).await;

        let connection = factory.latest(relay.url()).unwrap();
        connection.push_json(&json!(["EVENT", "sub", note(&Keys::generate())]));
        settle().await;

        assert_eq!(recorder.events.load(Ordering::SeqCst), 0);
        assert_eq!(relay.stats().snapshot().spam_count, 1);
    }

    #[tokio::test]
    async fn auth_challenge_reported_once() {
        let (relay, factory, _) = relay_with(descriptor());
        let recorder = Arc::new(Recorder::default());
        relay.register(recorder.clone());
        connected(&relay).await;

        let connection = factory.latest(relay.url()).unwrap();
        connection.push_json(&json!(["AUTH", "abc"]));
        connection.push_json(&json!(["AUTH", "abc"]));
        connection.push_json(&json!(["AUTH", "def"]));
        settle().await;

        assert_eq!(recorder.auths.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn successful_auth_renews_filters() {
        let (relay, factory, registry) = relay_with(descriptor());
        registry.add("feed", vec![TypedFilter::new(Filter::new(), [FeedType::Global])]);
        connected(&relay).await;
        settle().await;

        let auth = EventBuilder::new(Kind::Authentication, "")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        relay.send(&auth);

        let connection = factory.latest(relay.url()).unwrap();
        connection.push_json(&json!(["OK", auth.id.to_hex(), true, ""]));
        settle().await;

        assert_eq!(connection.sent_of_type("REQ").len(), 2);
    }

    #[tokio::test]
    async fn failure_reports_disconnect_and_respects_cooldown() {
        let (relay, factory, _) = relay_with(descriptor());
        let recorder = Arc::new(Recorder::default());
        relay.register(recorder.clone());
        connected(&relay).await;

        factory.latest(relay.url()).unwrap().fail("reset by peer");
        settle().await;
        assert!(!relay.is_connected());
        assert_eq!(
            recorder.states.lock().unwrap().as_slice(),
            &[RelayState::Connected, RelayState::Disconnected]
        );

        relay.send_filter("sub", &[TypedFilter::new(Filter::new(), [FeedType::Global])]);
        assert_eq!(factory.connect_count(relay.url()), 1);

        relay.disconnect();
        relay.send_filter("sub", &[TypedFilter::new(Filter::new(), [FeedType::Global])]);
        assert_eq!(factory.connect_count(relay.url()), 2);
    }

    #[tokio::test]
    async fn disconnect_closes_transport_once() {
        let (relay, factory, _) = relay_with(descriptor());
        connected(&relay).await;

        relay.disconnect();
        relay.disconnect();

        assert!(!relay.is_connected());
        assert_eq!(factory.latest(relay.url()).unwrap().disconnect_count(), 1);
    }

    #[tokio::test]
    async fn close_skipped_when_disconnected() {
        let (relay, factory, _) = relay_with(descriptor());
        relay.close("sub");
        assert_eq!(factory.connect_count(relay.url()), 0);

        connected(&relay).await;
        relay.close("sub");
        assert_eq!(factory.latest(relay.url()).unwrap().sent_of_type("CLOSE").len(), 1);
    }

    #[tokio::test]
    async fn connect_and_run_waits_for_handshake() {
        let factory = MockTransportFactory::manual();
        let relay = Relay::new(
            descriptor(),
            RelayOptions::default(),
            Arc::new(factory.clone()),
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(RelayStat::default()),
        );
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        relay.connect_and_run(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        settle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        factory.latest(relay.url()).unwrap().open();
        settle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
