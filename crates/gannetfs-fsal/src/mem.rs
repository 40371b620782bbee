//! In-memory reference backend
//!
//! A complete backend over an in-process object tree. It exists so every
//! contract in this crate (and the pNFS crates above it) can be exercised
//! without real storage: the server ships it compiled in, registered
//! through the normal load handshake like any other backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::attr::{Attributes, FsId, ObjectType, Timespec};
use crate::error::{ErrorKind, FsalError, Result};
use crate::export::{DynamicInfo, ExportConfig, ExportOps};
use crate::filesystem::{ClaimType, FilesystemInfo};
use crate::handle::{DsDataPlane, DsDescriptor, HostHandle, ObjectHandle};
use crate::module::{Backend, BackendInit};
use crate::quota::{QuotaKind, QuotaLimits};
use crate::registry::{ModuleRegistry, RegistryError, FSAL_MAJOR_VERSION, FSAL_MINOR_VERSION};

/// Name the in-memory backend registers under.
pub const MEM_BACKEND_NAME: &str = "MEM";

/// Advertised filesystem capacity. The backend never enforces it;
/// dynamic-info arithmetic needs a ceiling.
const MEM_CAPACITY_BYTES: u64 = 1 << 30;

const ROOT_FILEID: u64 = 1;

struct MemNode {
    generation: u32,
    object_type: ObjectType,
    mode: u32,
    uid: u32,
    gid: u32,
    numlinks: u32,
    mtime: Timespec,
    ctime: Timespec,
    data: Vec<u8>,
    children: BTreeMap<String, u64>,
}

impl MemNode {
    fn new(object_type: ObjectType, mode: u32) -> Self {
        let now = Timespec::now();
        Self {
            generation: 1,
            object_type,
            mode,
            uid: 0,
            gid: 0,
            numlinks: 1,
            mtime: now,
            ctime: now,
            data: Vec::new(),
            children: BTreeMap::new(),
        }
    }
}

struct MemFs {
    export_id: u16,
    fsid: FsId,
    mount_path: String,
    read_only: bool,
    nodes: RwLock<HashMap<u64, MemNode>>,
    next_fileid: AtomicU64,
    quotas: RwLock<HashMap<(QuotaKind, u32), QuotaLimits>>,
}

impl MemFs {
    fn new(export_id: u16, config: &ExportConfig) -> Arc<Self> {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_FILEID, MemNode::new(ObjectType::Directory, 0o755));
        Arc::new(Self {
            export_id,
            // Derive a stable fsid from the export id so two mem exports
            // get distinct filesystems.
            fsid: FsId::new(0x6d656d00 + export_id as u64, 0),
            mount_path: config.mount_path.clone(),
            read_only: config.read_only,
            nodes: RwLock::new(nodes),
            next_fileid: AtomicU64::new(ROOT_FILEID + 1),
            quotas: RwLock::new(HashMap::new()),
        })
    }

    fn attributes_of(&self, fileid: u64) -> Result<Attributes> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(&fileid)
            .ok_or_else(|| FsalError::new(ErrorKind::StaleHandle))?;
        Ok(Attributes {
            object_type: node.object_type,
            fileid,
            fsid: self.fsid,
            size: node.data.len() as u64,
            space_used: node.data.len() as u64,
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            numlinks: node.numlinks,
            mtime: node.mtime,
            ctime: node.ctime,
        })
    }

    fn handle_for(self: &Arc<Self>, fileid: u64) -> Result<Arc<dyn ObjectHandle>> {
        let (object_type, generation) = {
            let nodes = self.nodes.read();
            let node = nodes
                .get(&fileid)
                .ok_or_else(|| FsalError::new(ErrorKind::StaleHandle))?;
            (node.object_type, node.generation)
        };
        Ok(Arc::new(MemHandle {
            fs: self.clone(),
            fileid,
            generation,
            object_type,
        }))
    }

    fn create_child(
        self: &Arc<Self>,
        parent: u64,
        name: &str,
        object_type: ObjectType,
        mode: u32,
    ) -> Result<Arc<dyn ObjectHandle>> {
        if self.read_only {
            return Err(FsalError::new(ErrorKind::ReadOnly));
        }
        if name.is_empty() || name.contains('/') {
            return Err(FsalError::new(ErrorKind::InvalidArgument));
        }
        let fileid = {
            let mut nodes = self.nodes.write();
            {
                let dir = nodes
                    .get(&parent)
                    .ok_or_else(|| FsalError::new(ErrorKind::StaleHandle))?;
                if dir.object_type != ObjectType::Directory {
                    return Err(FsalError::new(ErrorKind::NotDirectory));
                }
                if dir.children.contains_key(name) {
                    return Err(FsalError::new(ErrorKind::Exists));
                }
            }
            let fileid = self.next_fileid.fetch_add(1, Ordering::SeqCst);
            nodes.insert(fileid, MemNode::new(object_type, mode));
            let dir = nodes.get_mut(&parent).expect("parent vanished under write lock");
            dir.children.insert(name.to_string(), fileid);
            dir.mtime = Timespec::now();
            fileid
        };
        self.handle_for(fileid)
    }
}

struct MemHandle {
    fs: Arc<MemFs>,
    fileid: u64,
    generation: u32,
    object_type: ObjectType,
}

impl ObjectHandle for MemHandle {
    fn export_id(&self) -> u16 {
        self.fs.export_id
    }

    fn object_type(&self) -> ObjectType {
        self.object_type
    }

    fn attributes(&self) -> Result<Attributes> {
        self.fs.attributes_of(self.fileid)
    }

    fn host_handle(&self) -> HostHandle {
        HostHandle {
            fsid: self.fs.fsid,
            fileid: self.fileid,
            generation: self.generation,
            opaque: Vec::new(),
        }
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn ObjectHandle>> {
        let child = {
            let nodes = self.fs.nodes.read();
            let node = nodes
                .get(&self.fileid)
                .ok_or_else(|| FsalError::new(ErrorKind::StaleHandle))?;
            if node.object_type != ObjectType::Directory {
                return Err(FsalError::new(ErrorKind::NotDirectory));
            }
            *node
                .children
                .get(name)
                .ok_or_else(|| FsalError::new(ErrorKind::NotFound))?
        };
        self.fs.handle_for(child)
    }

    fn create_file(&self, name: &str, mode: u32) -> Result<Arc<dyn ObjectHandle>> {
        self.fs
            .create_child(self.fileid, name, ObjectType::Regular, mode)
    }

    fn mkdir(&self, name: &str, mode: u32) -> Result<Arc<dyn ObjectHandle>> {
        self.fs
            .create_child(self.fileid, name, ObjectType::Directory, mode)
    }

    fn read(&self, offset: u64, length: usize) -> Result<(Vec<u8>, bool)> {
        let nodes = self.fs.nodes.read();
        let node = nodes
            .get(&self.fileid)
            .ok_or_else(|| FsalError::new(ErrorKind::StaleHandle))?;
        if node.object_type == ObjectType::Directory {
            return Err(FsalError::new(ErrorKind::IsDirectory));
        }
        let size = node.data.len() as u64;
        if offset >= size {
            return Ok((Vec::new(), true));
        }
        let start = offset as usize;
        let end = (start + length).min(node.data.len());
        let data = node.data[start..end].to_vec();
        let eof = data.len() < length;
        Ok((data, eof))
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<u64> {
        if self.fs.read_only {
            return Err(FsalError::new(ErrorKind::ReadOnly));
        }
        let mut nodes = self.fs.nodes.write();
        let node = nodes
            .get_mut(&self.fileid)
            .ok_or_else(|| FsalError::new(ErrorKind::StaleHandle))?;
        if node.object_type == ObjectType::Directory {
            return Err(FsalError::new(ErrorKind::IsDirectory));
        }
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        node.mtime = Timespec::now();
        Ok(data.len() as u64)
    }

    fn setattr(&self, new_size: Option<u64>, new_mtime: Option<Timespec>) -> Result<()> {
        if self.fs.read_only {
            return Err(FsalError::new(ErrorKind::ReadOnly));
        }
        let mut nodes = self.fs.nodes.write();
        let node = nodes
            .get_mut(&self.fileid)
            .ok_or_else(|| FsalError::new(ErrorKind::StaleHandle))?;
        if let Some(size) = new_size {
            node.data.resize(size as usize, 0);
        }
        if let Some(mtime) = new_mtime {
            node.mtime = mtime;
        }
        node.ctime = Timespec::now();
        Ok(())
    }
}

/// The export-side operations over one in-memory tree.
pub struct MemExport {
    fs: Arc<MemFs>,
}

impl ExportOps for MemExport {
    fn root_handle(&self) -> Result<Arc<dyn ObjectHandle>> {
        self.fs.handle_for(ROOT_FILEID)
    }

    fn filesystems(&self) -> Vec<FilesystemInfo> {
        vec![FilesystemInfo {
            fsid: self.fs.fsid,
            path: self.fs.mount_path.clone(),
            claim: ClaimType::Root,
        }]
    }

    fn create_handle_from_host(&self, host: &HostHandle) -> Result<Arc<dyn ObjectHandle>> {
        if host.fsid != self.fs.fsid {
            return Err(FsalError::new(ErrorKind::StaleHandle));
        }
        // handle_for reads the node (the attribute fetch); a missing node
        // or stale generation fails handle creation as a whole.
        let handle = self.fs.handle_for(host.fileid)?;
        if handle.host_handle().generation != host.generation {
            return Err(FsalError::new(ErrorKind::StaleHandle));
        }
        Ok(handle)
    }

    fn get_dynamic_info(&self) -> Result<DynamicInfo> {
        let nodes = self.fs.nodes.read();
        let used: u64 = nodes.values().map(|n| n.data.len() as u64).sum();
        let free = MEM_CAPACITY_BYTES.saturating_sub(used);
        Ok(DynamicInfo {
            total_bytes: MEM_CAPACITY_BYTES,
            free_bytes: free,
            avail_bytes: free,
            total_files: u64::MAX,
            free_files: u64::MAX - nodes.len() as u64,
            avail_files: u64::MAX - nodes.len() as u64,
        })
    }

    fn fsid_of_path(&self, path: &str) -> Result<FsId> {
        if path.starts_with(&self.fs.mount_path) {
            Ok(self.fs.fsid)
        } else {
            Err(FsalError::new(ErrorKind::NotFound))
        }
    }

    fn get_quota(&self, _path: &str, kind: QuotaKind, id: u32) -> Result<QuotaLimits> {
        let quotas = self.fs.quotas.read();
        quotas
            .get(&(kind, id))
            .copied()
            .ok_or_else(|| FsalError::new(ErrorKind::NotFound))
    }

    fn set_quota(
        &self,
        _path: &str,
        kind: QuotaKind,
        id: u32,
        limits: &QuotaLimits,
    ) -> Result<QuotaLimits> {
        let mut quotas = self.fs.quotas.write();
        quotas.insert((kind, id), *limits);
        Ok(*limits)
    }

    fn ds_data_plane(&self) -> Option<Arc<dyn DsDataPlane>> {
        Some(Arc::new(MemDataPlane {
            fs: self.fs.clone(),
        }))
    }
}

struct MemDataPlane {
    fs: Arc<MemFs>,
}

impl DsDataPlane for MemDataPlane {
    fn open(&self, host: &HostHandle) -> Result<Arc<dyn DsDescriptor>> {
        if host.fsid != self.fs.fsid {
            return Err(FsalError::new(ErrorKind::StaleHandle));
        }
        let nodes = self.fs.nodes.read();
        let node = nodes
            .get(&host.fileid)
            .ok_or_else(|| FsalError::new(ErrorKind::StaleHandle))?;
        if node.generation != host.generation {
            return Err(FsalError::new(ErrorKind::StaleHandle));
        }
        if node.object_type != ObjectType::Regular {
            return Err(FsalError::new(ErrorKind::InvalidArgument));
        }
        Ok(Arc::new(MemDescriptor {
            fs: self.fs.clone(),
            fileid: host.fileid,
        }))
    }
}

struct MemDescriptor {
    fs: Arc<MemFs>,
    fileid: u64,
}

impl DsDescriptor for MemDescriptor {
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let nodes = self.fs.nodes.read();
        let node = nodes
            .get(&self.fileid)
            .ok_or_else(|| FsalError::new(ErrorKind::StaleHandle))?;
        if offset >= node.data.len() as u64 {
            return Ok(Vec::new());
        }
        let start = offset as usize;
        let end = (start + length).min(node.data.len());
        Ok(node.data[start..end].to_vec())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        if self.fs.read_only {
            return Err(FsalError::new(ErrorKind::ReadOnly));
        }
        let mut nodes = self.fs.nodes.write();
        let node = nodes
            .get_mut(&self.fileid)
            .ok_or_else(|| FsalError::new(ErrorKind::StaleHandle))?;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        node.mtime = Timespec::now();
        Ok(data.len())
    }

    fn flush(&self) -> Result<()> {
        // Memory is as stable as this backend gets.
        Ok(())
    }
}

/// The in-memory backend module.
pub struct MemBackend;

impl Backend for MemBackend {
    fn name(&self) -> &str {
        MEM_BACKEND_NAME
    }

    fn create_export(&self, export_id: u16, config: &ExportConfig) -> Result<Arc<dyn ExportOps>> {
        Ok(Arc::new(MemExport {
            fs: MemFs::new(export_id, config),
        }))
    }

    fn supported_layout_types(&self) -> Vec<u32> {
        vec![1]
    }
}

/// Load-handshake hook registering the in-memory backend.
pub struct MemBackendInit;

impl BackendInit for MemBackendInit {
    fn init(&self, registry: &ModuleRegistry) -> std::result::Result<(), RegistryError> {
        registry.register(
            Arc::new(MemBackend),
            MEM_BACKEND_NAME,
            FSAL_MAJOR_VERSION,
            FSAL_MINOR_VERSION,
        )
    }
}
