//! Event publishing/subscription mechanics.
//!
//! Status-change notifications leave the engine through an [`EventBus`]. The
//! bus is lossy for slow subscribers and keeps nothing: the status and history
//! stores stay the source of truth.

pub mod bus;
pub mod in_memory_bus;

pub use bus::{EventBus, PublishError, Subscription};
pub use in_memory_bus::InMemoryEventBus;
