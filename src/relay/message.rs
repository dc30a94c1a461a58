//! Wire messages exchanged with relays.
//!
//! Every frame is a JSON array whose first element names the message type.

use nostr::{Event, EventId, RelayUrl};
use serde_json::{json, Value};

use super::error::{RelayError, RelayResult};
use crate::filter::TypedFilter;

/// Frames the client sends.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Opens or replaces a subscription.
    Req {
        /// Subscription id.
        subscription_id: String,
        /// Filters already projected for the target relay.
        filters: Vec<Value>,
    },
    /// Publishes an event.
    Event(Box<Event>),
    /// Answers an authentication challenge.
    Auth(Box<Event>),
    /// Terminates a subscription.
    Close(String),
}

impl ClientMessage {
    /// Builds a `REQ` for `relay`, carrying at most `max_filters` filters
    /// with each `since` narrowed to that relay's checkpoint.
    #[must_use]
    pub fn req(
        subscription_id: &str,
        filters: &[TypedFilter],
        relay: &RelayUrl,
        max_filters: usize,
    ) -> Self {
        Self::Req {
            subscription_id: subscription_id.to_string(),
            filters: filters
                .iter()
                .take(max_filters)
                .map(|f| f.filter.to_json(relay))
                .collect(),
        }
    }

    /// Serializes the frame.
    #[must_use]
    pub fn as_json(&self) -> String {
        let value = match self {
            Self::Req {
                subscription_id,
                filters,
            } => {
                let mut frame = vec![json!("REQ"), json!(subscription_id)];
                frame.extend(filters.iter().cloned());
                Value::Array(frame)
            }
            Self::Event(event) => json!(["EVENT", event]),
            Self::Auth(event) => json!(["AUTH", event]),
            Self::Close(id) => json!(["CLOSE", id]),
        };
        value.to_string()
    }
}

/// Frames a relay sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// An event for a subscription.
    Event {
        /// Subscription id.
        subscription_id: String,
        /// The event.
        event: Box<Event>,
    },
    /// End of stored events.
    Eose(String),
    /// Human readable server message.
    Notice(String),
    /// Acceptance or rejection of a published event.
    Ok {
        /// Published event id.
        event_id: EventId,
        /// Whether the relay stored the event.
        success: bool,
        /// Machine-prefixed reason.
        message: String,
    },
    /// Authentication challenge.
    Auth(String),
    /// Server-side notification for the user.
    Notify(String),
    /// The relay closed a subscription.
    Closed {
        /// Subscription id.
        subscription_id: String,
        /// Machine-prefixed reason.
        message: String,
    },
}

impl RelayMessage {
    /// Parses a relay frame.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Serialization`] for invalid JSON and
    /// [`RelayError::Protocol`] for well-formed JSON that is not a known
    /// relay message.
    pub fn from_json(text: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Some(parts) = value.as_array() else {
            return Err(RelayError::Protocol("frame is not an array".to_string()));
        };

        let kind = str_at(parts, 0, "message type")?;
        match kind {
            "EVENT" => {
                let subscription_id = str_at(parts, 1, "subscription id")?.to_string();
                let raw = parts
                    .get(2)
                    .ok_or_else(|| missing("event"))?
                    .clone();
                let event: Event = serde_json::from_value(raw)?;
                Ok(Self::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "EOSE" => Ok(Self::Eose(str_at(parts, 1, "subscription id")?.to_string())),
            "NOTICE" => Ok(Self::Notice(str_at(parts, 1, "notice")?.to_string())),
            "OK" => {
                let id = str_at(parts, 1, "event id")?;
                let event_id = EventId::from_hex(id)
                    .map_err(|e| RelayError::Protocol(format!("invalid event id {id}: {e}")))?;
                let success = parts
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| missing("success flag"))?;
                let message = parts
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Self::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "AUTH" => Ok(Self::Auth(str_at(parts, 1, "challenge")?.to_string())),
            "NOTIFY" => Ok(Self::Notify(str_at(parts, 1, "notification")?.to_string())),
            "CLOSED" => Ok(Self::Closed {
                subscription_id: str_at(parts, 1, "subscription id")?.to_string(),
                message: parts
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Err(RelayError::Protocol(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

fn str_at<'a>(parts: &'a [Value], index: usize, what: &str) -> RelayResult<&'a str> {
    parts
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(what))
}

fn missing(what: &str) -> RelayError {
    RelayError::Protocol(format!("missing {what}"))
}
