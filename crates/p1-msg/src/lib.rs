//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process fan-out buffers between pipeline stages."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Message buffers decoupling the telegram reader, the field parser and the
//! measurement sinks.
//!
//! A [`MessageBuffer`] accepts items from one producer without ever waiting on
//! consumers and relays each item, in publish order, to every registered
//! handler. Handlers run concurrently with each other on their own worker
//! tasks, so one slow or failing handler never holds back its siblings.
#![warn(missing_docs)]

pub mod buffer;
pub mod metrics;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised while handing items between buffer queues.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// The bounded queue is at capacity; the item was not enqueued.
    #[error("queue '{0}' is full")]
    QueueFull(String),
    /// The receiving side of the queue no longer exists.
    #[error("queue '{0}' is closed")]
    QueueClosed(String),
    /// Buffer metrics could not be registered.
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub use buffer::{BufferOptions, MessageBuffer, PublishOutcome};
pub use metrics::{BufferCounters, BufferMetrics};
