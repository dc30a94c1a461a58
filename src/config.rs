//! Client configuration.
//!
//! Durations are expressed in whole seconds when serialized:
//!
//! ```json
//! {
//!   "send_ack_timeout": 15,
//!   "ephemeral_relay_timeout": 60,
//!   "reconnect_cooldown": 180,
//!   "max_filters_per_request": 20
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::relay::{RelayError, RelayResult};

/// Default wait for per-relay publish acknowledgements.
pub const DEFAULT_SEND_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Default lifetime of a relay opened for a one-off request.
pub const DEFAULT_EPHEMERAL_RELAY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default minimum spacing between send-triggered reconnect attempts.
pub const DEFAULT_RECONNECT_COOLDOWN: Duration = Duration::from_secs(180);

/// Default maximum number of filters in one `REQ`.
pub const DEFAULT_MAX_FILTERS_PER_REQUEST: usize = 20;

/// Settings shared by the client, its pool and its relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long `send_and_wait_for_response` waits when no timeout is given.
    #[serde(with = "duration_secs")]
    pub send_ack_timeout: Duration,
    /// How long an ephemeral relay stays connected.
    #[serde(with = "duration_secs")]
    pub ephemeral_relay_timeout: Duration,
    /// Minimum spacing between reconnects triggered by sends.
    #[serde(with = "duration_secs")]
    pub reconnect_cooldown: Duration,
    /// Maximum number of filters in one `REQ`.
    pub max_filters_per_request: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_ack_timeout: DEFAULT_SEND_ACK_TIMEOUT,
            ephemeral_relay_timeout: DEFAULT_EPHEMERAL_RELAY_TIMEOUT,
            reconnect_cooldown: DEFAULT_RECONNECT_COOLDOWN,
            max_filters_per_request: DEFAULT_MAX_FILTERS_PER_REQUEST,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON configuration document. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if the document is malformed or sets
    /// `max_filters_per_request` to zero.
    pub fn from_json(json: &str) -> RelayResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RelayError::Config(e.to_string()))?;
        if config.max_filters_per_request == 0 {
            return Err(RelayError::Config(
                "max_filters_per_request must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Sets the acknowledgement timeout.
    #[must_use]
    pub const fn with_send_ack_timeout(mut self, timeout: Duration) -> Self {
        self.send_ack_timeout = timeout;
        self
    }

    /// Sets the ephemeral relay lifetime.
    #[must_use]
    pub const fn with_ephemeral_relay_timeout(mut self, timeout: Duration) -> Self {
        self.ephemeral_relay_timeout = timeout;
        self
    }

    /// Sets the reconnect cooldown.
    #[must_use]
    pub const fn with_reconnect_cooldown(mut self, cooldown: Duration) -> Self {
        self.reconnect_cooldown = cooldown;
        self
    }

    /// Sets the per-`REQ` filter cap. Zero is clamped to one.
    #[must_use]
    pub const fn with_max_filters_per_request(mut self, max: usize) -> Self {
        self.max_filters_per_request = if max == 0 { 1 } else { max };
        self
    }

    /// Per-relay view of this configuration.
    #[must_use]
    pub const fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            reconnect_cooldown: self.reconnect_cooldown,
            max_filters_per_request: self.max_filters_per_request,
        }
    }
}

/// Settings a single relay needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Minimum spacing between send-triggered reconnects.
    pub reconnect_cooldown: Duration,
    /// Maximum number of filters in one `REQ`.
    pub max_filters_per_request: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        ClientConfig::default().relay_options()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
