//! In-process event bus.

use std::sync::RwLock;

use tokio::sync::broadcast;

use crate::bus::{EventBus, PublishError, Subscription};

/// Default number of messages a lagging subscriber may fall behind.
pub const DEFAULT_CAPACITY: usize = 1024;

/// In-memory pub/sub bus backed by a tokio broadcast channel.
///
/// - No IO
/// - Best-effort fan-out
/// - `close()` ends every subscription once its backlog is drained
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    sender: RwLock<Option<broadcast::Sender<M>>>,
}

impl<M: Clone + Send + 'static> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: RwLock::new(Some(sender)),
        }
    }

    /// Drop the sending side. Later publishes fail with [`PublishError::Closed`].
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.write() {
            sender.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().map(|s| s.is_none()).unwrap_or(true)
    }
}

impl<M: Clone + Send + 'static> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn publish(&self, message: M) -> Result<usize, PublishError> {
        let sender = self.sender.read().map_err(|_| PublishError::Closed)?;
        match sender.as_ref() {
            // A send error only means there are no receivers right now.
            Some(tx) => Ok(tx.send(message).unwrap_or(0)),
            None => Err(PublishError::Closed),
        }
    }

    fn subscribe(&self) -> Subscription<M> {
        match self.sender.read().ok().and_then(|s| s.as_ref().map(|tx| tx.subscribe())) {
            Some(rx) => Subscription::new(rx),
            None => {
                // Closed bus: hand out a subscription that ends immediately.
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                Subscription::new(rx)
            }
        }
    }
}
