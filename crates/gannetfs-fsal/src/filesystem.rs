//! Underlying-filesystem identities and export claims
//!
//! An export is responsible for one or more underlying filesystems; the
//! claim registry records that relationship so sub-exports can share a
//! filesystem and the last export to leave triggers its unclaim. Claims
//! are tracked many-to-many: any number of Subtree/Child claims may
//! coexist, but at most one export holds the Root claim on a filesystem.
//!
//! Lock ordering: the per-filesystem lock is acquired before any
//! per-export lock, never the reverse.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::attr::FsId;
use crate::error::{ErrorKind, FsalError, Result};

/// How an export is attached to a filesystem. Exactly one claim type
/// applies per filesystem per export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimType {
    /// The export is rooted at this filesystem; exclusive.
    Root,
    /// The export covers a subtree of this filesystem.
    Subtree,
    /// The filesystem was reached as a child mount under the export root.
    Child,
    /// Short-lived claim taken while probing during export creation.
    Temporary,
}

/// One filesystem an export spans, as reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct FilesystemInfo {
    /// Filesystem identity.
    pub fsid: FsId,
    /// Mount path of the filesystem.
    pub path: String,
    /// How the export claims it.
    pub claim: ClaimType,
}

#[derive(Debug, Clone)]
struct Claim {
    export_id: u16,
    claim: ClaimType,
}

struct FilesystemEntry {
    path: String,
    claims: Vec<Claim>,
}

/// Process-wide registry of known filesystems and their claims.
pub struct FilesystemRegistry {
    filesystems: Mutex<HashMap<FsId, Arc<Mutex<FilesystemEntry>>>>,
}

impl Default for FilesystemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesystemRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            filesystems: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, fsid: FsId, path: &str) -> Arc<Mutex<FilesystemEntry>> {
        let mut map = self.filesystems.lock();
        map.entry(fsid)
            .or_insert_with(|| {
                Arc::new(Mutex::new(FilesystemEntry {
                    path: path.to_string(),
                    claims: Vec::new(),
                }))
            })
            .clone()
    }

    /// Claims a filesystem for an export.
    ///
    /// A Root claim is exclusive: a second export attempting Root on the
    /// same filesystem is rejected. Re-claiming by the same export
    /// replaces its previous claim type (one claim type per filesystem per
    /// export).
    pub fn claim(&self, fsid: FsId, path: &str, export_id: u16, claim: ClaimType) -> Result<()> {
        let entry = self.entry(fsid, path);
        let mut entry = entry.lock();

        if claim == ClaimType::Root {
            if let Some(other) = entry
                .claims
                .iter()
                .find(|c| c.claim == ClaimType::Root && c.export_id != export_id)
            {
                tracing::warn!(
                    path = entry.path,
                    holder = other.export_id,
                    contender = export_id,
                    "filesystem already root-claimed"
                );
                return Err(FsalError::new(ErrorKind::Exists));
            }
        }

        if let Some(existing) = entry.claims.iter_mut().find(|c| c.export_id == export_id) {
            existing.claim = claim;
        } else {
            entry.claims.push(Claim { export_id, claim });
        }
        tracing::debug!(
            fsid_major = fsid.major,
            fsid_minor = fsid.minor,
            export_id,
            ?claim,
            "filesystem claimed"
        );
        Ok(())
    }

    /// Releases one export's claim on one filesystem.
    ///
    /// Returns true when this was the last claim and the filesystem is now
    /// unclaimed.
    pub fn unclaim(&self, fsid: FsId, export_id: u16) -> bool {
        let entry = {
            let map = self.filesystems.lock();
            match map.get(&fsid) {
                Some(entry) => entry.clone(),
                None => return false,
            }
        };
        let mut entry = entry.lock();
        let before = entry.claims.len();
        entry.claims.retain(|c| c.export_id != export_id);
        if entry.claims.len() < before && entry.claims.is_empty() {
            tracing::debug!(path = entry.path, "last claim released, filesystem unclaimed");
            true
        } else {
            false
        }
    }

    /// Releases every claim held by an export. Returns the identities of
    /// filesystems left unclaimed as a result.
    pub fn unclaim_export(&self, export_id: u16) -> Vec<FsId> {
        let entries: Vec<(FsId, Arc<Mutex<FilesystemEntry>>)> = {
            let map = self.filesystems.lock();
            map.iter().map(|(k, v)| (*k, v.clone())).collect()
        };
        let mut freed = Vec::new();
        for (fsid, entry) in entries {
            let mut entry = entry.lock();
            let before = entry.claims.len();
            entry.claims.retain(|c| c.export_id != export_id);
            if entry.claims.len() < before && entry.claims.is_empty() {
                tracing::debug!(path = entry.path, "last claim released, filesystem unclaimed");
                freed.push(fsid);
            }
        }
        freed
    }

    /// Current claimants of a filesystem.
    pub fn claimants(&self, fsid: FsId) -> Vec<(u16, ClaimType)> {
        let entry = {
            let map = self.filesystems.lock();
            match map.get(&fsid) {
                Some(entry) => entry.clone(),
                None => return Vec::new(),
            }
        };
        let entry = entry.lock();
        entry.claims.iter().map(|c| (c.export_id, c.claim)).collect()
    }

    /// True while any export claims the filesystem.
    pub fn is_claimed(&self, fsid: FsId) -> bool {
        !self.claimants(fsid).is_empty()
    }
}
