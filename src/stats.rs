//! Per-relay runtime statistics.
//!
//! Purely observational: counters are written by relays as frames flow and
//! read by whatever UI wants to show relay health. Nothing in the pool or the
//! client consults them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use nostr::RelayUrl;
use serde::{Deserialize, Serialize};

/// Number of errors and notices kept per relay.
const HISTORY_LIMIT: usize = 100;

/// A timestamped error or notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugMessage {
    /// When the message was recorded.
    pub time: DateTime<Utc>,
    /// Message text.
    pub message: String,
}

/// Counters for one relay.
#[derive(Debug, Default)]
pub struct RelayStat {
    received_bytes: AtomicU64,
    sent_bytes: AtomicU64,
    ping_ms: AtomicU64,
    spam_count: AtomicU64,
    compression: AtomicBool,
    errors: Mutex<VecDeque<DebugMessage>>,
    notices: Mutex<VecDeque<DebugMessage>>,
}

impl RelayStat {
    /// Adds to the received byte counter.
    pub fn add_received_bytes(&self, bytes: usize) {
        self.received_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Adds to the sent byte counter.
    pub fn add_sent_bytes(&self, bytes: usize) {
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records the latest handshake latency and compression state.
    pub fn record_handshake(&self, ping_ms: u64, compression: bool) {
        self.ping_ms.store(ping_ms, Ordering::Relaxed);
        self.compression.store(compression, Ordering::Relaxed);
    }

    /// Counts an event classified as spam.
    pub fn new_spam(&self) {
        self.spam_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an error message.
    pub fn new_error(&self, message: impl Into<String>) {
        push_bounded(&self.errors, message.into());
    }

    /// Records a notice.
    pub fn new_notice(&self, message: impl Into<String>) {
        push_bounded(&self.notices, message.into());
    }

    /// Copies the current values.
    #[must_use]
    pub fn snapshot(&self) -> RelayStatSnapshot {
        let errors = self
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        let notices = self
            .notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        RelayStatSnapshot {
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            ping_ms: self.ping_ms.load(Ordering::Relaxed),
            spam_count: self.spam_count.load(Ordering::Relaxed),
            compression: self.compression.load(Ordering::Relaxed),
            errors,
            notices,
        }
    }
}

fn push_bounded(history: &Mutex<VecDeque<DebugMessage>>, message: String) {
    let mut history = history.lock().unwrap_or_else(PoisonError::into_inner);
    if history.len() == HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(DebugMessage {
        time: Utc::now(),
        message,
    });
}

/// Serializable copy of a [`RelayStat`]. Histories are oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatSnapshot {
    /// Bytes received.
    pub received_bytes: u64,
    /// Bytes sent.
    pub sent_bytes: u64,
    /// Latest handshake latency in milliseconds.
    pub ping_ms: u64,
    /// Events classified as spam.
    pub spam_count: u64,
    /// Whether the latest connection negotiated compression.
    pub compression: bool,
    /// Recent errors.
    pub errors: Vec<DebugMessage>,
    /// Recent notices.
    pub notices: Vec<DebugMessage>,
}

impl RelayStatSnapshot {
    /// Most recent error.
    #[must_use]
    pub fn last_error(&self) -> Option<&DebugMessage> {
        self.errors.last()
    }

    /// Most recent notice.
    #[must_use]
    pub fn last_notice(&self) -> Option<&DebugMessage> {
        self.notices.last()
    }
}

/// Registry of [`RelayStat`]s keyed by URL.
///
/// Stats outlive connections: a relay that is rebuilt keeps accumulating
/// into the same entry.
#[derive(Debug, Default)]
pub struct RelayStats {
    stats: RwLock<HashMap<RelayUrl, Arc<RelayStat>>>,
}

impl RelayStats {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `url`, creating it on first use.
    pub fn get(&self, url: &RelayUrl) -> Arc<RelayStat> {
        if let Some(stat) = self
            .stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
        {
            return Arc::clone(stat);
        }

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(stats.entry(url.clone()).or_default())
    }

    /// Snapshots every relay seen so far.
    #[must_use]
    pub fn snapshot_all(&self) -> HashMap<RelayUrl, RelayStatSnapshot> {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(url, stat)| (url.clone(), stat.snapshot()))
            .collect()
    }
}
