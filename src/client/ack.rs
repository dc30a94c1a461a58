//! Publish acknowledgement tracking.

use std::collections::HashSet;
use std::sync::Arc;

use nostr::{EventId, RelayUrl, Timestamp};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

use crate::pool::RelayPool;
use crate::relay::{Relay, RelayError, RelayListener, RelayState};

/// One relay's contribution to a publish.
#[derive(Debug)]
pub(super) struct AckSignal {
    relay: RelayUrl,
    success: bool,
}

/// Turns relay callbacks into [`AckSignal`]s for one event.
///
/// A relay finishes on whichever comes first: an `OK` for the event, a
/// disconnect, an EOSE, or an error.
pub(super) struct AckListener {
    event_id: EventId,
    targets: HashSet<RelayUrl>,
    signals: UnboundedSender<AckSignal>,
}

impl AckListener {
    pub(super) const fn new(
        event_id: EventId,
        targets: HashSet<RelayUrl>,
        signals: UnboundedSender<AckSignal>,
    ) -> Self {
        Self {
            event_id,
            targets,
            signals,
        }
    }

    fn signal(&self, relay: &Relay, success: bool) {
        if self.targets.contains(relay.url()) {
            let _ = self.signals.send(AckSignal {
                relay: relay.url().clone(),
                success,
            });
        }
    }
}

impl RelayListener for AckListener {
    fn on_send_response(&self, relay: &Relay, event_id: &EventId, success: bool, _: &str) {
        if *event_id == self.event_id {
            self.signal(relay, success);
        }
    }

    fn on_state_change(&self, relay: &Relay, state: RelayState) {
        if state == RelayState::Disconnected {
            self.signal(relay, false);
        }
    }

    fn on_eose(&self, relay: &Relay, _: &str, _: Timestamp) {
        self.signal(relay, false);
    }

    fn on_error(&self, relay: &Relay, _: &str, _: &RelayError) {
        self.signal(relay, false);
    }
}

/// Keeps a listener registered on a pool until dropped.
pub(super) struct Registration {
    pool: RelayPool,
    listener: Arc<dyn RelayListener>,
}

impl Registration {
    pub(super) fn new(pool: &RelayPool, listener: Arc<dyn RelayListener>) -> Self {
        pool.register(Arc::clone(&listener));
        Self {
            pool: pool.clone(),
            listener,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.pool.unregister(&self.listener);
    }
}

/// Waits until every relay in `pending` reported or `deadline` passes.
///
/// Each relay counts once. Returns whether any relay stored the event.
pub(super) async fn wait_for_acks(
    mut signals: UnboundedReceiver<AckSignal>,
    mut pending: HashSet<RelayUrl>,
    deadline: Instant,
) -> bool {
    let mut accepted = false;

    while !pending.is_empty() {
        match tokio::time::timeout_at(deadline, signals.recv()).await {
            Ok(Some(signal)) => {
                accepted |= signal.success;
                pending.remove(&signal.relay);
            }
            Ok(None) => break,
            Err(_) => {
                log::debug!("Publish timed out with {} relays pending", pending.len());
                break;
            }
        }
    }

    accepted
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    fn url(name: &str) -> RelayUrl {
        RelayUrl::parse(&format!("wss://{name}.example.com")).unwrap()
    }

    #[tokio::test]
    async fn each_relay_counts_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: HashSet<_> = [url("a"), url("b")].into_iter().collect();

        tx.send(AckSignal { relay: url("a"), success: false }).unwrap();
        tx.send(AckSignal { relay: url("a"), success: false }).unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let started = Instant::now();
        assert!(!wait_for_acks(rx, pending, deadline).await);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn any_success_wins() {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: HashSet<_> = [url("a"), url("b")].into_iter().collect();

        tx.send(AckSignal { relay: url("a"), success: false }).unwrap();
        tx.send(AckSignal { relay: url("b"), success: true }).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(wait_for_acks(rx, pending, deadline).await);
    }
}
