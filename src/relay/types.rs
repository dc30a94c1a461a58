//! Types for relay configuration and connection state.

use std::collections::HashSet;

use nostr::RelayUrl;
use serde::{Deserialize, Serialize};

use super::error::{RelayError, RelayResult};
use crate::filter::FeedType;

/// Connection state reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    /// Handshake completed, frames may be sent.
    Connected,

    /// The server started the closing handshake.
    Disconnecting,

    /// The socket is gone.
    Disconnected,
}

/// How the client should use one relay.
///
/// Supplied by the session layer. A descriptor is immutable for the life of
/// a connection; when it changes the connection is rebuilt.
///
/// # Example
///
/// ```
/// use relay_hub::filter::FeedType;
/// use relay_hub::relay::RelayDescriptor;
///
/// let relay = RelayDescriptor::parse("wss://relay.example.com")
///     .unwrap()
///     .read_only()
///     .with_feed_types([FeedType::Global]);
///
/// assert!(relay.read);
/// assert!(!relay.write);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    /// Normalized relay URL.
    pub url: RelayUrl,
    /// Whether subscriptions are sent to this relay.
    pub read: bool,
    /// Whether events are published to this relay.
    pub write: bool,
    /// Whether the connection must go through a proxy.
    pub force_proxy: bool,
    /// Feed types served by this relay.
    pub feed_types: HashSet<FeedType>,
}

impl RelayDescriptor {
    /// Read/write descriptor serving the common feeds.
    #[must_use]
    pub fn new(url: RelayUrl) -> Self {
        Self {
            url,
            read: true,
            write: true,
            force_proxy: false,
            feed_types: crate::filter::COMMON_FEED_TYPES.into_iter().collect(),
        }
    }

    /// Parses `url` and builds a default descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidUrl`] if `url` is not a websocket URL.
    pub fn parse(url: &str) -> RelayResult<Self> {
        RelayUrl::parse(url)
            .map(Self::new)
            .map_err(|e| RelayError::InvalidUrl(format!("{url}: {e}")))
    }

    /// Disables publishing.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read = true;
        self.write = false;
        self
    }

    /// Disables subscriptions.
    #[must_use]
    pub const fn write_only(mut self) -> Self {
        self.read = false;
        self.write = true;
        self
    }

    /// Sets read and write permissions.
    #[must_use]
    pub const fn with_permissions(mut self, read: bool, write: bool) -> Self {
        self.read = read;
        self.write = write;
        self
    }

    /// Requires a proxied connection.
    #[must_use]
    pub const fn with_force_proxy(mut self, force_proxy: bool) -> Self {
        self.force_proxy = force_proxy;
        self
    }

    /// Replaces the served feed types.
    #[must_use]
    pub fn with_feed_types(mut self, feed_types: impl IntoIterator<Item = FeedType>) -> Self {
        self.feed_types = feed_types.into_iter().collect();
        self
    }

    /// Whether two descriptors would produce identical connections.
    #[must_use]
    pub fn is_same_relay_config(&self, other: &Self) -> bool {
        self == other
    }
}
