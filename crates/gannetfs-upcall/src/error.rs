//! Error types for upcall submission and delivery

use thiserror::Error;

/// Errors surfaced by upcall submission and handler execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpcallError {
    /// The bounded event queue is full; the caller may retry with backoff.
    #[error("upcall queue full")]
    QueueFull,
    /// The dispatcher is shutting down or already shut down.
    #[error("upcall dispatcher shut down")]
    ShutDown,
    /// A registered handler rejected the event.
    #[error("upcall handler failed: {reason}")]
    Handler {
        /// Handler-supplied failure description.
        reason: String,
    },
}

/// Result type alias using UpcallError as the error type.
pub type Result<T> = std::result::Result<T, UpcallError>;
