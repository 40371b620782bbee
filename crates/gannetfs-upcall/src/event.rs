//! Upcall event model
//!
//! An event names a target object by its cache key and the export it was
//! observed under. Every variant owns its payload outright (names are
//! `String`s, keys are owned byte vectors), so a backend may free its own
//! buffers the moment `submit` returns.

use serde::{Deserialize, Serialize};

/// Opaque cache key identifying one object to the caching layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey(pub Vec<u8>);

impl ObjectKey {
    /// Builds a key by copying the given bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// What an invalidation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InvalidateFlags {
    /// Cached attributes (size, times, mode) are stale.
    pub attributes: bool,
    /// Cached file content is stale.
    pub content: bool,
    /// The caching layer should also close any open descriptor it holds.
    pub close: bool,
}

impl InvalidateFlags {
    /// Attributes and content both stale; the usual post-DS-write form.
    pub fn attrs_and_content() -> Self {
        Self {
            attributes: true,
            content: true,
            close: false,
        }
    }
}

/// Attribute values pushed by a backend that learned them out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdatedAttributes {
    /// New object size, if known.
    pub size: Option<u64>,
    /// New modification time (seconds since the epoch), if known.
    pub mtime_seconds: Option<i64>,
}

/// One backend-raised event, consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpcallEvent {
    /// Cached state for an object is stale.
    Invalidate {
        /// Export the event was observed under.
        export_id: u16,
        /// Target object.
        key: ObjectKey,
        /// What is stale.
        flags: InvalidateFlags,
    },
    /// A backend pushes fresh attribute values for an object.
    UpdateAttributes {
        /// Export the event was observed under.
        export_id: u16,
        /// Target object.
        key: ObjectKey,
        /// The values that changed.
        attributes: UpdatedAttributes,
    },
    /// A blocked lock request was granted by the backend.
    LockGrant {
        /// Export the event was observed under.
        export_id: u16,
        /// Target object.
        key: ObjectKey,
        /// Opaque owner cookie from the original lock request.
        owner: u64,
    },
    /// A previously conflicting lock is now available to retry.
    LockAvailable {
        /// Export the event was observed under.
        export_id: u16,
        /// Target object.
        key: ObjectKey,
        /// Opaque owner cookie from the original lock request.
        owner: u64,
    },
    /// A directory gained an entry behind our back.
    Link {
        /// Export the event was observed under.
        export_id: u16,
        /// Directory that changed.
        dir_key: ObjectKey,
        /// Name of the new entry.
        name: String,
        /// Key of the linked object, when the backend knows it.
        target_key: Option<ObjectKey>,
    },
    /// A directory lost an entry behind our back.
    Unlink {
        /// Export the event was observed under.
        export_id: u16,
        /// Directory that changed.
        dir_key: ObjectKey,
        /// Name of the removed entry.
        name: String,
    },
    /// An entry was renamed within a directory behind our back.
    Rename {
        /// Export the event was observed under.
        export_id: u16,
        /// Directory that changed.
        dir_key: ObjectKey,
        /// Previous entry name.
        old_name: String,
        /// New entry name.
        new_name: String,
    },
    /// The backend needs a granted layout back.
    LayoutRecall {
        /// Export the event was observed under.
        export_id: u16,
        /// Target object.
        key: ObjectKey,
        /// Layout type the recall applies to.
        layout_type: u32,
        /// True when the file's placement changed and cached device
        /// mappings must not be reused.
        changed: bool,
    },
    /// The backend asks the server to shed some recallable state.
    RecallAny {
        /// Export the event was observed under.
        export_id: u16,
        /// How many delegations the server may keep.
        keep: u32,
    },
    /// A device id's address list changed or was deleted.
    NotifyDevice {
        /// Layout type the device belongs to.
        layout_type: u32,
        /// Wire form of the device id.
        device_id: [u8; 16],
        /// True when clients must stop using the device immediately.
        immediate: bool,
    },
    /// The backend needs a delegation back.
    DelegationRecall {
        /// Export the event was observed under.
        export_id: u16,
        /// Target object.
        key: ObjectKey,
    },
}

/// Event family tag, used for handler dispatch and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Invalidate cached state.
    Invalidate,
    /// Push fresh attributes.
    UpdateAttributes,
    /// Lock granted.
    LockGrant,
    /// Lock available.
    LockAvailable,
    /// Directory entry added.
    Link,
    /// Directory entry removed.
    Unlink,
    /// Directory entry renamed.
    Rename,
    /// Layout recall.
    LayoutRecall,
    /// Recall-any request.
    RecallAny,
    /// Device notification.
    NotifyDevice,
    /// Delegation recall.
    DelegationRecall,
}

impl UpcallEvent {
    /// The family this event belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            UpcallEvent::Invalidate { .. } => EventKind::Invalidate,
            UpcallEvent::UpdateAttributes { .. } => EventKind::UpdateAttributes,
            UpcallEvent::LockGrant { .. } => EventKind::LockGrant,
            UpcallEvent::LockAvailable { .. } => EventKind::LockAvailable,
            UpcallEvent::Link { .. } => EventKind::Link,
            UpcallEvent::Unlink { .. } => EventKind::Unlink,
            UpcallEvent::Rename { .. } => EventKind::Rename,
            UpcallEvent::LayoutRecall { .. } => EventKind::LayoutRecall,
            UpcallEvent::RecallAny { .. } => EventKind::RecallAny,
            UpcallEvent::NotifyDevice { .. } => EventKind::NotifyDevice,
            UpcallEvent::DelegationRecall { .. } => EventKind::DelegationRecall,
        }
    }
}
