//! Durable outbound analytics queue.
//!
//! This crate provides:
//! - EventQueue: FIFO queue persisted on every change, drained head-first
//!   with bounded retries and exponential backoff
//! - EventSender: delivery seam, with an HTTP implementation over reqwest
//!   and a tracing implementation for when no collector is configured

mod error;
mod event;
mod queue;
mod sender;

pub use error::{OutboxError, OutboxResult};
pub use event::AnalyticsEvent;
pub use queue::{compute_backoff, DrainReport, EventQueue, QueueConfig};
pub use sender::{EventSender, HttpEventSender, SenderConfig, TracingSender};
