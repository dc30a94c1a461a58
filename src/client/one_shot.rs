//! First-response query listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use nostr::Event;

use super::{Client, ClientInner};
use crate::relay::{Relay, RelayListener};

pub(super) type OnResponse = Box<dyn FnOnce(&Event) + Send>;

/// Delivers the first event of one subscription, then tears it down.
pub(super) struct OneShotListener {
    subscription_id: String,
    fired: AtomicBool,
    on_response: Mutex<Option<OnResponse>>,
    client: Weak<ClientInner>,
    this: Weak<Self>,
}

impl OneShotListener {
    pub(super) fn new(subscription_id: &str, client: &Client, on_response: OnResponse) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            subscription_id: subscription_id.to_string(),
            fired: AtomicBool::new(false),
            on_response: Mutex::new(Some(on_response)),
            client: Arc::downgrade(&client.inner),
            this: this.clone(),
        })
    }
}

impl RelayListener for OneShotListener {
    fn on_event(&self, _: &Relay, subscription_id: &str, event: &Event, _: bool) {
        if subscription_id != self.subscription_id || self.fired.swap(true, Ordering::SeqCst) {
            return;
        }

        let client = self.client.upgrade().map(|inner| Client { inner });

        if let (Some(client), Some(this)) = (&client, self.this.upgrade()) {
            let listener: Arc<dyn RelayListener> = this;
            client.unsubscribe(&listener);
        }

        let callback = self
            .on_response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(event);
        }

        if let Some(client) = client {
            client.close(&self.subscription_id);
        }
    }
}
