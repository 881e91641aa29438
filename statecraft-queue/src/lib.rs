//! # statecraft-queue
//!
//! Event queues for statecraft.
//!
//! - [`EventQueue`]: thread-safe FIFO mailbox with blocking dequeue
//! - [`DelayedEventQueue`]: cancellable per-id timers that deliver into an
//!   [`EventQueue`] on expiry

pub mod delayed;
pub mod error;
pub mod queue;

pub use delayed::{DelayedEventQueue, PendingDelayed};
pub use error::QueueError;
pub use queue::EventQueue;
