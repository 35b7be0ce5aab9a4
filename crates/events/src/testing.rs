//! In-memory sink for exercising relays without a network connection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::relay::{Delivery, MessageSink};
use crate::types::{Message, MessageKind};

/// Records every delivered message while "connected"
pub struct MemorySink {
    messages: Mutex<Vec<Message>>,
    connected: watch::Sender<bool>,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn connected() -> Arc<Self> {
        Self::with_state(true)
    }

    pub fn disconnected() -> Arc<Self> {
        Self::with_state(false)
    }

    fn with_state(connected: bool) -> Arc<Self> {
        let (connected, _) = watch::channel(connected);
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            connected,
            closed: AtomicBool::new(false),
        })
    }

    pub fn connect(&self) {
        self.connected.send_replace(true);
    }

    pub fn disconnect(&self) {
        self.connected.send_replace(false);
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    /// Payloads of all output messages, in order
    pub fn outputs(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.kind() == MessageKind::Output)
            .map(|m| m.data().to_string())
            .collect()
    }

    /// Status values of all status messages, in order
    pub fn statuses(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter_map(|m| m.status_value().map(str::to_string))
            .collect()
    }

    pub fn last_status(&self) -> Option<Message> {
        self.messages()
            .into_iter()
            .rev()
            .find(|m| m.kind() == MessageKind::Status)
    }

    pub fn errors(&self) -> Vec<Message> {
        self.messages()
            .into_iter()
            .filter(|m| m.kind() == MessageKind::Error)
            .collect()
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn deliver(&self, message: &Message) -> Delivery {
        if !*self.connected.borrow() {
            return Delivery::Dropped;
        }
        self.messages.lock().unwrap().push(message.clone());
        Delivery::Delivered
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn wait_connected(&self) {
        let mut rx = self.connected.subscribe();
        let _ = rx.wait_for(|connected| *connected).await;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.send_replace(false);
    }
}
