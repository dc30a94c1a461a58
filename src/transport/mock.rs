//! Scripted in-memory transport for tests.
//!
//! **DO NOT use in production.** Every connection is recorded so tests can
//! inspect the frames a relay wrote and push relay messages back.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nostr::RelayUrl;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use super::{Transport, TransportEvent, TransportFactory};
use crate::relay::RelayResult;

/// Factory handing out [`MockConnection`]s.
///
/// By default every connection opens immediately. URLs marked with
/// [`MockTransportFactory::set_unreachable`] fail instead, and
/// [`MockTransportFactory::manual`] leaves opening to the test.
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    state: Arc<FactoryState>,
}

#[derive(Debug, Default)]
struct FactoryState {
    manual: AtomicBool,
    connections: Mutex<Vec<MockConnection>>,
    unreachable: Mutex<HashSet<RelayUrl>>,
}

impl MockTransportFactory {
    /// Factory whose connections open on their own.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose connections wait for [`MockConnection::open`].
    #[must_use]
    pub fn manual() -> Self {
        let factory = Self::default();
        factory.state.manual.store(true, Ordering::SeqCst);
        factory
    }

    /// Makes every future connection to `url` fail.
    pub fn set_unreachable(&self, url: &RelayUrl) {
        self.state
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.clone());
    }

    /// All connections ever opened to `url`, oldest first.
    #[must_use]
    pub fn connections_to(&self, url: &RelayUrl) -> Vec<MockConnection> {
        self.connections()
            .into_iter()
            .filter(|c| c.url() == url)
            .collect()
    }

    /// Most recent connection to `url`.
    #[must_use]
    pub fn latest(&self, url: &RelayUrl) -> Option<MockConnection> {
        self.connections_to(url).pop()
    }

    /// Number of connection attempts to `url`.
    #[must_use]
    pub fn connect_count(&self, url: &RelayUrl) -> usize {
        self.connections_to(url).len()
    }

    /// Every connection ever opened.
    #[must_use]
    pub fn connections(&self) -> Vec<MockConnection> {
        self.state
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Frames written to `url` across all of its connections.
    #[must_use]
    pub fn sent_frames(&self, url: &RelayUrl) -> Vec<String> {
        self.connections_to(url)
            .iter()
            .flat_map(MockConnection::sent_frames)
            .collect()
    }
}

impl TransportFactory for MockTransportFactory {
    fn connect(
        &self,
        url: &RelayUrl,
        force_proxy: bool,
        events: UnboundedSender<TransportEvent>,
    ) -> RelayResult<Box<dyn Transport>> {
        let connection = MockConnection {
            state: Arc::new(ConnectionState {
                url: url.clone(),
                force_proxy,
                events,
                sent: Mutex::new(Vec::new()),
                disconnects: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        };

        self.state
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connection.clone());

        let unreachable = self
            .state
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(url);

        if unreachable {
            connection.fail("connection refused");
        } else if !self.state.manual.load(Ordering::SeqCst) {
            connection.open();
        }

        Ok(Box::new(connection))
    }
}

/// One scripted connection.
#[derive(Debug, Clone)]
pub struct MockConnection {
    state: Arc<ConnectionState>,
}

#[derive(Debug)]
struct ConnectionState {
    url: RelayUrl,
    force_proxy: bool,
    events: UnboundedSender<TransportEvent>,
    sent: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
    closed: AtomicBool,
}

impl MockConnection {
    /// Target URL.
    #[must_use]
    pub fn url(&self) -> &RelayUrl {
        &self.state.url
    }

    /// Whether the relay asked for a proxied connection.
    #[must_use]
    pub fn force_proxy(&self) -> bool {
        self.state.force_proxy
    }

    fn emit(&self, event: TransportEvent) {
        if !self.state.closed.load(Ordering::SeqCst) {
            let _ = self.state.events.send(event);
        }
    }

    /// Completes the handshake.
    pub fn open(&self) {
        self.emit(TransportEvent::Open {
            ping: Duration::from_millis(5),
            compression: false,
        });
    }

    /// Delivers a raw relay frame.
    pub fn push(&self, frame: impl Into<String>) {
        self.emit(TransportEvent::Message(frame.into()));
    }

    /// Delivers a JSON relay frame.
    pub fn push_json(&self, frame: &Value) {
        self.push(frame.to_string());
    }

    /// Closes the socket from the server side.
    pub fn close(&self, code: u16, reason: &str) {
        self.emit(TransportEvent::Closing {
            code,
            reason: reason.to_string(),
        });
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        });
        self.state.closed.store(true, Ordering::SeqCst);
    }

    /// Fails the socket.
    pub fn fail(&self, message: &str) {
        self.emit(TransportEvent::Failure {
            message: message.to_string(),
        });
        self.state.closed.store(true, Ordering::SeqCst);
    }

    /// Frames written by the client, oldest first.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<String> {
        self.state
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Parsed frames whose message type is `kind` (`"REQ"`, `"EVENT"`, ...).
    #[must_use]
    pub fn sent_of_type(&self, kind: &str) -> Vec<Value> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| serde_json::from_str::<Value>(frame).ok())
            .filter(|value| value.get(0).and_then(Value::as_str) == Some(kind))
            .collect()
    }

    /// Number of times the client called `disconnect`.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Whether the connection can no longer deliver events.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl Transport for MockConnection {
    fn send(&self, frame: String) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        true
    }

    fn disconnect(&self) {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn url() -> RelayUrl {
        RelayUrl::parse("wss://relay.example.com").unwrap()
    }

    #[tokio::test]
    async fn auto_open_and_record_frames() {
        let factory = MockTransportFactory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let transport = factory.connect(&url(), false, tx).unwrap();
        assert!(matches!(rx.recv().await, Some(TransportEvent::Open { .. })));

        assert!(transport.send(r#"["CLOSE","a"]"#.to_string()));
        assert_eq!(factory.sent_frames(&url()).len(), 1);
        assert_eq!(factory.latest(&url()).unwrap().sent_of_type("CLOSE").len(), 1);
    }

    #[tokio::test]
    async fn unreachable_urls_fail() {
        let factory = MockTransportFactory::new();
        factory.set_unreachable(&url());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let transport = factory.connect(&url(), false, tx).unwrap();

        assert!(matches!(rx.recv().await, Some(TransportEvent::Failure { .. })));
        assert!(!transport.send("[]".to_string()));
    }

    #[tokio::test]
    async fn disconnect_silences_connection() {
        let factory = MockTransportFactory::manual();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let transport = factory.connect(&url(), false, tx).unwrap();
        transport.disconnect();

        let connection = factory.latest(&url()).unwrap();
        connection.push(r#"["NOTICE","late"]"#);
        drop(transport);
        drop(connection);
        drop(factory);

        assert_eq!(rx.recv().await, None);
    }
}
