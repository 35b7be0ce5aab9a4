//! Message relay: frames relay events and pushes them to the observer sink

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{ErrorCode, Message, RunStatus};

/// Outcome of handing a message to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the admitted observer
    Delivered,
    /// No observer admitted, or the write failed and the session was dropped
    Dropped,
}

/// Destination for relay messages.
///
/// Implementations provide "send if connected" semantics: delivering while
/// nobody is connected is a no-op, and a failed write counts as a disconnect
/// rather than an error.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Deliver one message to the current observer, if any
    async fn deliver(&self, message: &Message) -> Delivery;

    /// Whether an observer is currently admitted
    fn is_connected(&self) -> bool;

    /// Resolve once an observer is admitted
    async fn wait_connected(&self);

    /// Close the current session, if any
    async fn close(&self);
}

/// Frames events as [`Message`]s and forwards them in emission order
#[derive(Clone)]
pub struct MessageRelay {
    sink: Arc<dyn MessageSink>,
    delivered: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl MessageRelay {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            delivered: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Forward a message to the sink
    pub async fn emit(&self, message: Message) -> Delivery {
        let delivery = self.sink.deliver(&message).await;
        match delivery {
            Delivery::Delivered => self.delivered.fetch_add(1, Ordering::Relaxed),
            Delivery::Dropped => self.dropped.fetch_add(1, Ordering::Relaxed),
        };
        delivery
    }

    pub async fn output(&self, data: impl Into<String>) -> Delivery {
        self.emit(Message::output(data)).await
    }

    pub async fn status(&self, status: RunStatus) -> Delivery {
        self.emit(Message::status(status)).await
    }

    pub async fn error(&self, message: impl Into<String>, code: ErrorCode) -> Delivery {
        self.emit(Message::error(message, code)).await
    }

    /// Whether an observer is admitted right now.
    ///
    /// Callers must re-check this after every suspension point rather than
    /// caching the answer.
    pub fn is_connected(&self) -> bool {
        self.sink.is_connected()
    }

    pub async fn wait_for_observer(&self) {
        self.sink.wait_connected().await
    }

    pub async fn close(&self) {
        self.sink.close().await
    }

    /// Number of messages written to an observer
    pub fn delivered_count(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Number of messages dropped for lack of an observer
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MessageRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRelay")
            .field("connected", &self.is_connected())
            .field("delivered", &self.delivered_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySink;
    use crate::types::MessageKind;

    #[tokio::test]
    async fn test_emit_preserves_order() {
        let sink = MemorySink::connected();
        let relay = MessageRelay::new(sink.clone());

        relay.output("one").await;
        relay.output("two").await;
        relay.status(RunStatus::Completed).await;

        let messages = sink.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].data(), "one");
        assert_eq!(messages[1].data(), "two");
        assert_eq!(messages[2].kind(), MessageKind::Status);
        assert_eq!(relay.delivered_count(), 3);
    }

    #[tokio::test]
    async fn test_emit_without_observer_is_noop() {
        let sink = MemorySink::disconnected();
        let relay = MessageRelay::new(sink.clone());

        let delivery = relay.output("lost").await;

        assert_eq!(delivery, Delivery::Dropped);
        assert!(sink.messages().is_empty());
        assert_eq!(relay.dropped_count(), 1);
        assert_eq!(relay.delivered_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_observer_resolves_on_connect() {
        let sink = MemorySink::disconnected();
        let relay = MessageRelay::new(sink.clone());

        let waiter = tokio::spawn({
            let relay = relay.clone();
            async move { relay.wait_for_observer().await }
        });

        sink.connect();
        waiter.await.unwrap();
        assert!(relay.is_connected());
    }

    #[tokio::test]
    async fn test_close_disconnects() {
        let sink = MemorySink::connected();
        let relay = MessageRelay::new(sink.clone());

        relay.close().await;

        assert!(!relay.is_connected());
        assert!(sink.was_closed());
    }

    #[test]
    fn test_clone_shares_counters() {
        let relay1 = MessageRelay::new(MemorySink::connected());
        let relay2 = relay1.clone();

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(relay2.output("x"));

        assert_eq!(relay1.delivered_count(), 1);
    }
}
