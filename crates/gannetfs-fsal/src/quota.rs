//! Quota query/set pass-through types
//!
//! The core attaches no semantics beyond validating that the queried path
//! stays on the export's own filesystem; limits and usage are whatever the
//! backend reports.

use serde::{Deserialize, Serialize};

/// What a quota constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuotaKind {
    /// Storage blocks/bytes.
    Block,
    /// Inode count.
    Inode,
}

/// Limits and usage for one (kind, id) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Hard limit; operations beyond it fail.
    pub hard_limit: u64,
    /// Soft limit; may be exceeded during the grace period.
    pub soft_limit: u64,
    /// Seconds the soft limit may be exceeded.
    pub grace_seconds: u64,
    /// Current usage as reported by the backend.
    pub usage: u64,
}
