//! Reusable test helpers for client and pool integration tests.
//!
//! Relays run over the scripted mock transport, so every frame a relay writes
//! can be inspected and relay messages can be pushed back deterministically.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, EventBuilder, Keys, Kind, RelayUrl, Tag};
use relay_hub::client::Client;
use relay_hub::config::ClientConfig;
use relay_hub::filter::FeedType;
use relay_hub::relay::RelayDescriptor;
use relay_hub::transport::MockTransportFactory;

/// Parses a relay URL.
pub fn url(raw: &str) -> RelayUrl {
    RelayUrl::parse(raw).expect("valid relay url")
}

/// Read/write descriptor serving the common feeds.
pub fn descriptor(raw: &str) -> RelayDescriptor {
    RelayDescriptor::parse(raw).expect("valid relay url")
}

/// Descriptor serving only `feeds`.
pub fn descriptor_for(raw: &str, feeds: &[FeedType]) -> RelayDescriptor {
    descriptor(raw).with_feed_types(feeds.iter().copied())
}

/// Client over a mock transport with a short acknowledgement timeout.
pub fn mock_client() -> (Client, MockTransportFactory) {
    mock_client_with(ClientConfig::default().with_send_ack_timeout(Duration::from_millis(300)))
}

/// Client over a mock transport with `config`.
pub fn mock_client_with(config: ClientConfig) -> (Client, MockTransportFactory) {
    let factory = MockTransportFactory::new();
    let client = Client::new(config, Arc::new(factory.clone()));
    (client, factory)
}

/// Signed text note.
pub fn text_note(keys: &Keys, content: &str) -> Event {
    EventBuilder::text_note(content)
        .sign_with_keys(keys)
        .expect("should sign text note")
}

/// Signed authentication response for `challenge` on `relay`.
pub fn auth_event(keys: &Keys, relay: &RelayUrl, challenge: &str) -> Event {
    let relay = relay.to_string();
    EventBuilder::new(Kind::Authentication, "")
        .tags([
            Tag::parse(["relay", relay.as_str()]).expect("should parse relay tag"),
            Tag::parse(["challenge", challenge]).expect("should parse challenge tag"),
        ])
        .sign_with_keys(keys)
        .expect("should sign auth event")
}

/// Polls `condition` every 5ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Lets relay workers drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(40)).await;
}
