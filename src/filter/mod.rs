//! Filter model.
//!
//! Value objects describing what a subscription wants and where it should
//! be routed:
//!
//! - [`Filter`]: the NIP-01 query, with a per-relay `since` checkpoint
//! - [`TypedFilter`]: a filter plus the [`FeedType`]s it belongs to
//!
//! A relay receives a typed filter only when its own feed types intersect
//! the filter's types and the filter is not restricted to other relays.

mod feed;
mod types;

pub use feed::{FeedType, COMMON_FEED_TYPES, EVENT_FINDER_TYPES};
pub use types::{Filter, TypedFilter};
