//! WebSocket transport built on `tokio-tungstenite`.
//!
//! Connections are direct. A relay that must be reached through a proxy is
//! refused with a [`TransportEvent::Failure`] instead of silently falling
//! back to a direct connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use nostr::RelayUrl;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;

use super::{Transport, TransportEvent, TransportFactory};
use crate::relay::{RelayError, RelayResult};

/// Default time allowed for the TCP, TLS and websocket handshakes.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Abnormal closure, used when the stream ends without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

/// Opens `tokio-tungstenite` connections on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct WebSocketTransportFactory {
    connect_timeout: Duration,
}

impl WebSocketTransportFactory {
    /// Creates a factory with the default handshake timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Overrides the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WebSocketTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn connect(
        &self,
        url: &RelayUrl,
        force_proxy: bool,
        events: UnboundedSender<TransportEvent>,
    ) -> RelayResult<Box<dyn Transport>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RelayError::Transport(format!("no tokio runtime: {e}")))?;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        if force_proxy {
            log::warn!("Refusing direct connection to {url}: relay requires a proxy");
            let _ = events.send(TransportEvent::Failure {
                message: "relay requires a proxy and none is configured".to_string(),
            });
            return Ok(Box::new(WebSocketTransport {
                outgoing: outgoing_tx,
                closed,
            }));
        }

        runtime.spawn(run(
            url.to_string(),
            self.connect_timeout,
            Arc::clone(&closed),
            outgoing_rx,
            events,
        ));

        Ok(Box::new(WebSocketTransport {
            outgoing: outgoing_tx,
            closed,
        }))
    }
}

/// Write half handed to the relay. Dropping it ends the socket task.
struct WebSocketTransport {
    outgoing: UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
}

impl Transport for WebSocketTransport {
    fn send(&self, frame: String) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.outgoing.send(Message::Text(frame)).is_ok()
    }

    fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outgoing.send(Message::Close(None));
        }
    }
}

async fn run(
    url: String,
    connect_timeout: Duration,
    closed: Arc<AtomicBool>,
    mut outgoing: UnboundedReceiver<Message>,
    events: UnboundedSender<TransportEvent>,
) {
    let emit = |event: TransportEvent| {
        if !closed.load(Ordering::SeqCst) {
            let _ = events.send(event);
        }
    };

    let started = Instant::now();
    let (socket, response) =
        match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                log::debug!("Handshake with {url} failed: {e}");
                emit(TransportEvent::Failure {
                    message: e.to_string(),
                });
                return;
            }
            Err(_) => {
                emit(TransportEvent::Failure {
                    message: format!("handshake timed out after {}s", connect_timeout.as_secs()),
                });
                return;
            }
        };

    let compression = response
        .headers()
        .get("sec-websocket-extensions")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("permessage-deflate"));

    emit(TransportEvent::Open {
        ping: started.elapsed(),
        compression,
    });

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = sink.send(message).await {
                        emit(TransportEvent::Failure { message: e.to_string() });
                        return;
                    }
                    if closing {
                        return;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => emit(TransportEvent::Message(text)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((CLOSE_ABNORMAL, String::new()), |f| {
                        (u16::from(f.code), f.reason.into_owned())
                    });
                    emit(TransportEvent::Closing { code, reason: reason.clone() });
                    emit(TransportEvent::Closed { code, reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(TransportEvent::Failure { message: e.to_string() });
                    return;
                }
                None => {
                    emit(TransportEvent::Closed { code: CLOSE_ABNORMAL, reason: String::new() });
                    return;
                }
            },
        }
    }
}
