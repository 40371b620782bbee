//! Export lifecycle: one mounted backend instance
//!
//! An export binds a backend module to a mount path. Creating it claims
//! the underlying filesystems the backend reports, proves the storage is
//! reachable by fetching the root handle, and records the export on its
//! module (holding a module reference for the export's lifetime).
//! `unexport` undoes all of that. An export, once created, is assumed
//! durable until explicitly unexported.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use gannetfs_upcall::UpcallDispatcher;

use crate::attr::FsId;
use crate::error::{ErrorKind, FsalError, Result};
use crate::filesystem::{FilesystemInfo, FilesystemRegistry};
use crate::handle::{decode_wire, CacheKey, DsDataPlane, HostHandle, ObjectHandle};
use crate::quota::{QuotaKind, QuotaLimits};
use crate::registry::ModuleRef;

/// Mount configuration for one export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Backend path being exported.
    pub mount_path: String,
    /// Path as seen by clients.
    pub pseudo_path: String,
    /// Whether writes are refused at the export level.
    pub read_only: bool,
}

impl ExportConfig {
    /// A read-only export of `mount_path`, visible at `pseudo_path`.
    pub fn new(mount_path: &str, pseudo_path: &str) -> Self {
        Self {
            mount_path: mount_path.to_string(),
            pseudo_path: pseudo_path.to_string(),
            read_only: true,
        }
    }

    /// Enables writes.
    pub fn read_write(mut self) -> Self {
        self.read_only = false;
        self
    }
}

/// Space and file counts for an export; a pure query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DynamicInfo {
    /// Total bytes in the filesystem.
    pub total_bytes: u64,
    /// Free bytes.
    pub free_bytes: u64,
    /// Bytes available to unprivileged callers.
    pub avail_bytes: u64,
    /// Total file slots.
    pub total_files: u64,
    /// Free file slots.
    pub free_files: u64,
    /// File slots available to unprivileged callers.
    pub avail_files: u64,
}

/// Backend-private operations behind one export.
///
/// `create_handle_from_host` must fetch enough attributes to determine at
/// least object type, file id and filesystem id; if attributes cannot be
/// fetched, handle creation fails as a whole. There is no handle without
/// attributes.
pub trait ExportOps: Send + Sync {
    /// The export's root object. Fetching it at create time doubles as
    /// the reachability probe for the underlying storage.
    fn root_handle(&self) -> Result<Arc<dyn ObjectHandle>>;

    /// The underlying filesystems this export spans and how it claims
    /// them.
    fn filesystems(&self) -> Vec<FilesystemInfo>;

    /// Rebuilds a live object handle from its host-handle identity.
    fn create_handle_from_host(&self, host: &HostHandle) -> Result<Arc<dyn ObjectHandle>>;

    /// Space and file counts.
    fn get_dynamic_info(&self) -> Result<DynamicInfo>;

    /// The filesystem a path resolves to, used to reject quota queries
    /// that cross onto a different filesystem.
    fn fsid_of_path(&self, path: &str) -> Result<FsId> {
        let _ = path;
        Err(FsalError::new(ErrorKind::NotSupported))
    }

    /// Backend quota query; pass-through.
    fn get_quota(&self, path: &str, kind: QuotaKind, id: u32) -> Result<QuotaLimits> {
        let _ = (path, kind, id);
        Err(FsalError::new(ErrorKind::NotSupported))
    }

    /// Backend quota update; pass-through. Returns the limits now in
    /// effect.
    fn set_quota(
        &self,
        path: &str,
        kind: QuotaKind,
        id: u32,
        limits: &QuotaLimits,
    ) -> Result<QuotaLimits> {
        let _ = (path, kind, id, limits);
        Err(FsalError::new(ErrorKind::NotSupported))
    }

    /// DS-side I/O entry point, bypassing the object tree. `None` for
    /// backends without pNFS data-server support.
    fn ds_data_plane(&self) -> Option<Arc<dyn DsDataPlane>> {
        None
    }

    /// pNFS layout block size preference.
    fn layout_blocksize(&self) -> u32 {
        0x400000
    }

    /// Maximum layout segments granted per request.
    fn maximum_segments(&self) -> u32 {
        1
    }

    /// Buffer-size hint for encoding one layout body.
    fn loc_body_size_hint(&self) -> usize {
        0x100
    }
}

/// One live export.
pub struct Export {
    id: u16,
    module: ModuleRef,
    ops: Arc<dyn ExportOps>,
    config: ExportConfig,
    filesystems: Arc<FilesystemRegistry>,
    upcalls: Arc<UpcallDispatcher>,
    root: Mutex<Option<Arc<dyn ObjectHandle>>>,
    claimed: Mutex<Vec<FsId>>,
}

impl Export {
    /// Creates an export of `module` and attaches it to the module's
    /// export list.
    ///
    /// Failure at any step (backend instantiation, filesystem claims, root
    /// fetch) unwinds completely: claims are released and nothing is left
    /// attached.
    pub fn create(
        module: ModuleRef,
        id: u16,
        config: ExportConfig,
        filesystems: Arc<FilesystemRegistry>,
        upcalls: Arc<UpcallDispatcher>,
    ) -> Result<Arc<Export>> {
        let ops = module.backend().create_export(id, &config)?;

        let mut claimed = Vec::new();
        for info in ops.filesystems() {
            match filesystems.claim(info.fsid, &info.path, id, info.claim) {
                Ok(()) => claimed.push(info.fsid),
                Err(err) => {
                    for fsid in &claimed {
                        filesystems.unclaim(*fsid, id);
                    }
                    return Err(err);
                }
            }
        }

        let root = match ops.root_handle() {
            Ok(root) => root,
            Err(err) => {
                for fsid in &claimed {
                    filesystems.unclaim(*fsid, id);
                }
                tracing::warn!(export_id = id, error = %err, "export create failed to reach storage");
                return Err(err);
            }
        };

        module.module().attach_export(id);
        tracing::info!(
            export_id = id,
            module = module.module().name(),
            path = config.mount_path,
            "export created"
        );

        Ok(Arc::new(Export {
            id,
            module,
            ops,
            config,
            filesystems,
            upcalls,
            root: Mutex::new(Some(root)),
            claimed: Mutex::new(claimed),
        }))
    }

    /// Export id, the scope of every wire handle this export produces.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Mount configuration.
    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Backend operations.
    pub fn ops(&self) -> &Arc<dyn ExportOps> {
        &self.ops
    }

    /// The upcall channel handed to this export's backend.
    pub fn upcalls(&self) -> &Arc<UpcallDispatcher> {
        &self.upcalls
    }

    /// The root object handle.
    pub fn root_handle(&self) -> Result<Arc<dyn ObjectHandle>> {
        self.root
            .lock()
            .clone()
            .ok_or_else(|| FsalError::new(ErrorKind::StaleHandle))
    }

    /// Decodes a client wire handle into the backend host handle.
    ///
    /// A handle scoped to a different export is as malformed as a
    /// truncated one.
    pub fn wire_to_host(&self, bytes: &[u8], big_endian: bool) -> Result<HostHandle> {
        let (export_id, host) = decode_wire(bytes, big_endian)?;
        if export_id != self.id {
            return Err(FsalError::new(ErrorKind::BadHandle));
        }
        Ok(host)
    }

    /// Derives the caching layer's key for a host handle.
    pub fn host_to_key(&self, host: &HostHandle) -> CacheKey {
        CacheKey::from_host(self.id, host)
    }

    /// Rebuilds a live handle (attributes included) from a host handle.
    pub fn create_handle_from_host(&self, host: &HostHandle) -> Result<Arc<dyn ObjectHandle>> {
        self.ops.create_handle_from_host(host)
    }

    /// Space and file counts; no side effects.
    pub fn get_dynamic_info(&self) -> Result<DynamicInfo> {
        self.ops.get_dynamic_info()
    }

    /// DS data plane, when the backend has one.
    pub fn ds_data_plane(&self) -> Option<Arc<dyn DsDataPlane>> {
        self.ops.ds_data_plane()
    }

    fn validate_quota_path(&self, path: &str) -> Result<()> {
        if !path.starts_with(&self.config.mount_path) {
            return Err(FsalError::new(ErrorKind::InvalidArgument));
        }
        // When the backend can resolve paths to filesystems, reject a path
        // that crosses onto a filesystem other than the export root's.
        match self.ops.fsid_of_path(path) {
            Ok(fsid) => {
                let root_fsid = self.ops.fsid_of_path(&self.config.mount_path)?;
                if fsid != root_fsid {
                    return Err(FsalError::new(ErrorKind::InvalidArgument));
                }
                Ok(())
            }
            Err(err) if err.kind == ErrorKind::NotSupported => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Quota query pass-through.
    pub fn get_quota(&self, path: &str, kind: QuotaKind, id: u32) -> Result<QuotaLimits> {
        self.validate_quota_path(path)?;
        self.ops.get_quota(path, kind, id)
    }

    /// Quota update pass-through.
    pub fn set_quota(
        &self,
        path: &str,
        kind: QuotaKind,
        id: u32,
        limits: &QuotaLimits,
    ) -> Result<QuotaLimits> {
        self.validate_quota_path(path)?;
        self.ops.set_quota(path, kind, id, limits)
    }

    /// Detaches from the module, releases this export's filesystem
    /// claims, and releases the root object handle.
    pub fn unexport(&self) {
        self.root.lock().take();
        let claimed: Vec<FsId> = self.claimed.lock().drain(..).collect();
        for fsid in claimed {
            self.filesystems.unclaim(fsid, self.id);
        }
        self.module.module().detach_export(self.id);
        tracing::info!(export_id = self.id, "export removed");
    }
}

/// Table of live exports, keyed by export id.
pub struct ExportRegistry {
    filesystems: Arc<FilesystemRegistry>,
    upcalls: Arc<UpcallDispatcher>,
    exports: DashMap<u16, Arc<Export>>,
}

impl ExportRegistry {
    /// An empty export table sharing the given claim registry and upcall
    /// dispatcher.
    pub fn new(filesystems: Arc<FilesystemRegistry>, upcalls: Arc<UpcallDispatcher>) -> Self {
        Self {
            filesystems,
            upcalls,
            exports: DashMap::new(),
        }
    }

    /// Creates an export and registers it under its id.
    pub fn create_export(
        &self,
        module: ModuleRef,
        id: u16,
        config: ExportConfig,
    ) -> Result<Arc<Export>> {
        if self.exports.contains_key(&id) {
            return Err(FsalError::new(ErrorKind::Exists));
        }
        let export = Export::create(
            module,
            id,
            config,
            self.filesystems.clone(),
            self.upcalls.clone(),
        )?;
        self.exports.insert(id, export.clone());
        Ok(export)
    }

    /// Looks up a live export.
    pub fn get(&self, id: u16) -> Option<Arc<Export>> {
        self.exports.get(&id).map(|e| e.value().clone())
    }

    /// Unexports and removes an export.
    pub fn remove(&self, id: u16) -> Result<()> {
        let (_, export) = self
            .exports
            .remove(&id)
            .ok_or_else(|| FsalError::new(ErrorKind::NotFound))?;
        export.unexport();
        Ok(())
    }

    /// Number of live exports.
    pub fn count(&self) -> usize {
        self.exports.len()
    }
}
