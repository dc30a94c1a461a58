//! Feed categories used to route filters to relays.

use serde::{Deserialize, Serialize};

/// Category a relay is configured to serve and a filter is meant for.
///
/// A filter reaches a relay only when the two share at least one feed type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    /// Home feed built from followed authors.
    Follows,
    /// Public chat channels.
    PublicChats,
    /// Direct messages.
    PrivateDms,
    /// Unfiltered global feed.
    Global,
    /// Full-text search relays.
    Search,
    /// Wallet connect relays.
    WalletConnect,
}

/// Feed types a general-purpose relay is usually configured with.
pub const COMMON_FEED_TYPES: [FeedType; 4] = [
    FeedType::Follows,
    FeedType::PublicChats,
    FeedType::PrivateDms,
    FeedType::Global,
];

/// Feed types used when looking up single events or profiles.
pub const EVENT_FINDER_TYPES: [FeedType; 3] =
    [FeedType::Follows, FeedType::PublicChats, FeedType::Global];
