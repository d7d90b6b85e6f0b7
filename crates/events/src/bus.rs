//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is a broadcast channel:
//!
//! - **Fan-out**: every subscription receives a copy of each message published
//!   after it subscribed
//! - **Best-effort**: a subscriber that falls behind the channel capacity skips
//!   the oldest messages (a warning is logged)
//! - **No persistence**: publishing with no subscribers drops the message
//!
//! Consumers that need the full picture poll the stores instead.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

/// A subscription to a bus.
///
/// Each subscription is consumed by one task; clone the bus and subscribe
/// again for another consumer.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: broadcast::Receiver<M>,
}

impl<M: Clone> Subscription<M> {
    pub fn new(receiver: broadcast::Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the bus is dropped and the backlog is drained.
    pub async fn recv(&mut self) -> Option<M> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscription lagged; messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<M> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscription lagged; messages dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

impl<M: Clone + Send + 'static> Subscription<M> {
    /// Adapt the subscription into a `Stream`, silently skipping lag gaps.
    pub fn into_stream(self) -> impl Stream<Item = M> + Send + Unpin + 'static {
        BroadcastStream::new(self.receiver).filter_map(|item| item.ok())
    }
}

/// Error returned by [`EventBus::publish`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The bus was shut down.
    #[error("event bus closed")]
    Closed,
}

/// Transport-agnostic pub/sub.
///
/// `publish` returns how many subscribers the message was handed to. Zero is
/// not an error: nobody listening is a normal state.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<usize, PublishError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<usize, PublishError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
