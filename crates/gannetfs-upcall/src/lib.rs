#![warn(missing_docs)]

//! GannetFS upcall subsystem: asynchronous backend-to-cache event delivery
//!
//! Backends detect events (an attribute changed underneath us, a lock became
//! available, a layout must be recalled) on their own threads. This crate
//! carries those events to the caching/state layer without blocking the
//! thread that raised them: events are submitted to a bounded queue and
//! processed by a small worker pool, each event exactly once.

pub mod dispatcher;
pub mod error;
pub mod event;

pub use dispatcher::{DispatcherConfig, DispatcherStats, UpcallDispatcher, UpcallHandler};
pub use error::{Result, UpcallError};
pub use event::{EventKind, InvalidateFlags, ObjectKey, UpcallEvent, UpdatedAttributes};
