//! Relay Hub Core Library
//!
//! Network core of a Nostr client: connections to many independent relays,
//! subscriptions multiplexed across them, and per-relay state (connection,
//! resumption checkpoints, outbox) reconciled behind one listener stream.
//!
//! # Modules
//!
//! - [`filter`]: filters, feed types and per-relay `since` checkpoints
//! - [`subscription`]: subscription ids and the copy-on-write registry
//! - [`relay`]: one relay connection with read/write and feed gating
//! - [`pool`]: the session's relays, fan-out and aggregate status
//! - [`client`]: reconnect diffing, one-shot queries, acknowledged publishing
//! - [`bundle`]: debounce and batching primitives
//! - [`stats`]: passive per-relay counters
//! - [`transport`]: the socket seam (WebSocket and mock implementations)

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

pub mod bundle;
pub mod client;
pub mod config;
pub mod filter;
pub mod listeners;
pub mod pool;
pub mod relay;
pub mod stats;
pub mod subscription;
pub mod transport;

pub use client::{Client, PublishTarget};
pub use config::ClientConfig;
pub use pool::{PoolStatus, RelayPool};
pub use relay::{Relay, RelayDescriptor, RelayError, RelayListener, RelayResult, RelayState};
