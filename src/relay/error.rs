//! Error types for relay operations.
//!
//! This module defines error types that can occur while talking to relays,
//! decoding their messages, and coordinating the pool. Most of them never
//! reach callers as `Err`: relay-level failures are delivered through
//! [`RelayListener::on_error`](super::RelayListener::on_error) instead.

use thiserror::Error;

/// Errors that can occur during relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Connection to relay failed.
    #[error("Failed to connect to relay {url}: {reason}")]
    Connection {
        /// The relay URL that failed.
        url: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Invalid relay URL.
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    /// The relay sent something we could not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The relay sent a NOTICE.
    #[error("Relay {url} sent notice: {message}")]
    Notice {
        /// The relay URL.
        url: String,
        /// The notice text.
        message: String,
    },

    /// Relay rejected the event.
    #[error("Relay {relay} rejected event: {reason}")]
    Rejected {
        /// The relay that rejected the event.
        relay: String,
        /// The rejection reason.
        reason: String,
    },

    /// A pool was loaded with no relays.
    #[error("Relay set must not be empty")]
    EmptyRelaySet,

    /// The transport could not be created or failed mid-stream.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration document.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
