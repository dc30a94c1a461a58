//! Aggregate pool health.

use serde::{Deserialize, Serialize};

/// Connected and loaded relay counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Relays whose handshake completed.
    pub connected: usize,
    /// Relays loaded in the pool.
    pub available: usize,
}

impl PoolStatus {
    /// Creates a status tuple.
    #[must_use]
    pub const fn new(connected: usize, available: usize) -> Self {
        Self {
            connected,
            available,
        }
    }

    /// Whether at least one relay is connected.
    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.connected > 0
    }
}
