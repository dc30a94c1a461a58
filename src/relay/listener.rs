//! Callback surface of a relay.

use nostr::{Event, EventId, Timestamp};

use super::connection::Relay;
use super::error::RelayError;
use super::types::RelayState;

/// Receives everything that happens on a relay.
///
/// Every method has an empty default so implementors only override what they
/// need. Callbacks run on the relay's worker task, one at a time and in the
/// order the relay sent its frames. They must not block.
#[allow(unused_variables)]
pub trait RelayListener: Send + Sync {
    /// An event arrived for a subscription. `after_eose` is true once the
    /// relay has finished replaying stored events for it on this connection.
    fn on_event(&self, relay: &Relay, subscription_id: &str, event: &Event, after_eose: bool) {}

    /// The relay finished replaying stored events for a subscription.
    fn on_eose(&self, relay: &Relay, subscription_id: &str, time: Timestamp) {}

    /// Something went wrong on the connection or while decoding a frame.
    /// `subscription_id` is empty when the error is not tied to one.
    fn on_error(&self, relay: &Relay, subscription_id: &str, error: &RelayError) {}

    /// The relay accepted or rejected a published event.
    fn on_send_response(&self, relay: &Relay, event_id: &EventId, success: bool, message: &str) {}

    /// The relay asked for authentication. Each challenge is reported once
    /// per connection.
    fn on_auth(&self, relay: &Relay, challenge: &str) {}

    /// Server-side notification meant for the user.
    fn on_notify(&self, relay: &Relay, message: &str) {}

    /// Human readable server message.
    fn on_notice(&self, relay: &Relay, message: &str) {}

    /// The relay closed a subscription on its own.
    fn on_closed(&self, relay: &Relay, subscription_id: &str, message: &str) {}

    /// The connection changed state.
    fn on_state_change(&self, relay: &Relay, state: RelayState) {}

    /// A frame was handed to the transport.
    fn on_send(&self, relay: &Relay, frame: &str, success: bool) {}

    /// An event is about to be published.
    fn on_before_send(&self, relay: &Relay, event: &Event) {}
}
