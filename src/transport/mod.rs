//! Socket layer seam.
//!
//! A [`Relay`](crate::relay::Relay) never touches sockets directly. It asks a
//! [`TransportFactory`] for a [`Transport`], writes raw frames into it, and
//! consumes [`TransportEvent`]s from the channel it handed to the factory.
//!
//! # Implementations
//!
//! - [`WebSocketTransportFactory`]: `tokio-tungstenite` sockets (feature `websocket`)
//! - [`MockTransportFactory`]: scripted in-memory sockets (feature `test-utils`)

#[cfg(any(test, feature = "test-utils"))]
mod mock;
#[cfg(feature = "websocket")]
mod websocket;

use std::time::Duration;

use nostr::RelayUrl;
use tokio::sync::mpsc::UnboundedSender;

use crate::relay::RelayResult;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockConnection, MockTransportFactory};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransportFactory;

/// Something that happened on a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed.
    Open {
        /// Time the handshake took.
        ping: Duration,
        /// Whether `permessage-deflate` was negotiated.
        compression: bool,
    },
    /// A text frame arrived.
    Message(String),
    /// The server started the closing handshake.
    Closing {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The socket closed cleanly.
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The socket failed. No further events follow.
    Failure {
        /// Failure description.
        message: String,
    },
}

/// Write half of a connection.
pub trait Transport: Send + Sync {
    /// Queues a text frame. Returns `false` if the socket can no longer send.
    fn send(&self, frame: String) -> bool;

    /// Closes the socket. No events are delivered afterwards.
    fn disconnect(&self);
}

/// Opens connections.
pub trait TransportFactory: Send + Sync {
    /// Starts connecting to `url`.
    ///
    /// Returns immediately; the handshake outcome arrives on `events` as
    /// [`TransportEvent::Open`] or [`TransportEvent::Failure`].
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot even be attempted.
    fn connect(
        &self,
        url: &RelayUrl,
        force_proxy: bool,
        events: UnboundedSender<TransportEvent>,
    ) -> RelayResult<Box<dyn Transport>>;
}
