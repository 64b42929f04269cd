//! Fan-out of UI events and the per-invocation line consumer.

use dispatch_core::{Id, UiEvent};
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Consumer called once per output line of an asynchronous invocation.
pub trait LineSink: Send + Sync {
    fn on_line(&self, execution_id: &Id, line: &str);
}

impl<F> LineSink for F
where
    F: Fn(&Id, &str) + Send + Sync,
{
    fn on_line(&self, execution_id: &Id, line: &str) {
        self(execution_id, line);
    }
}

/// Sink that drops every line.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardLines;

impl LineSink for DiscardLines {
    fn on_line(&self, _execution_id: &Id, _line: &str) {}
}

/// Broadcast channel of UI events.
///
/// Publishing never blocks. A subscriber that falls behind by more than the
/// channel capacity skips the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UiEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: UiEvent) {
        trace!(event = event.event_name(), execution_id = %event.execution_id(), "publish");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
