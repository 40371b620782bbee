#![warn(missing_docs)]

//! GannetFS test & validation infrastructure
//!
//! Shared fixtures wiring the module registry, the in-memory backend, the
//! pNFS engine, and the upcall dispatcher into one server-shaped harness,
//! plus the cross-subsystem scenarios that exercise them end to end.

pub mod harness;

#[cfg(test)]
mod concurrency;
#[cfg(test)]
mod scenarios;
