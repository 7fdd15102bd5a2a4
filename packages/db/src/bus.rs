//! In-process job event stream.

use queue_core::JobEvent;
use tokio::sync::broadcast;

/// Broadcaster for [`JobEvent`]s; clones share the same stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: JobEvent) {
        tracing::trace!("{}", event.description());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
