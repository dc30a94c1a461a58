//! Relay connections.
//!
//! A [`Relay`] owns exactly one connection to one relay URL and projects the
//! client's subscriptions onto what that relay may receive:
//!
//! - **Read gate**: subscriptions are only sent when the descriptor allows reads
//! - **Write gate**: events are only published when it allows writes;
//!   authentication responses are exempt
//! - **Feed routing**: a filter reaches the relay only if their feed types
//!   intersect and the filter is not restricted to other relays
//! - **Checkpoints**: every `since` is narrowed to this relay's own value
//!
//! # Architecture
//!
//! ```text
//! RelayPool
//!     │
//!     ▼
//! Relay ──► RelayListener callbacks
//!     │
//!     ▼
//! TransportFactory (WebSocket / mock)
//!     │
//!     ▼
//! Relay server
//! ```
//!
//! Failures never surface as `Err` from fan-out calls; they arrive as
//! [`RelayListener::on_error`] and [`RelayListener::on_state_change`].

mod connection;
mod error;
mod listener;
mod message;
mod types;

pub use connection::{Relay, BLOCKED_NOT_WRITABLE};
pub use error::{RelayError, RelayResult};
pub use listener::RelayListener;
pub use message::{ClientMessage, RelayMessage};
pub use types::{RelayDescriptor, RelayState};
