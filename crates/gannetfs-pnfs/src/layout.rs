//! MDS-side layout engine
//!
//! Grants, returns, and commits layout segments per (object, client,
//! layout type). The policy matches what file-layout backends actually
//! do: one whole-file segment per grant, `last_segment` set,
//! `return_on_close` set, commit going through the MDS. The types permit
//! multiple segments per call; the engine just never produces them today.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use gannetfs_fsal::{CacheKey, ErrorKind, FsalError, ObjectHandle, Timespec};

use crate::device::{DeviceId, DeviceRegistry, DsAddr};
use crate::error::{PnfsError, Result};
use crate::xdr::XdrEncoder;

/// NFSv4.1 files layout type number.
pub const LAYOUT4_NFSV4_1_FILES: u32 = 1;

/// nfl_util flag: dense stripe packing.
pub const NFL4_UFLG_DENSE: u32 = 0x1;

/// nfl_util flag: COMMIT must go through the MDS, not the DS.
pub const NFL4_UFLG_COMMIT_THRU_MDS: u32 = 0x2;

/// nfl_util mask holding the stripe unit size (low 6 bits are flags).
pub const NFL4_UFLG_STRIPE_UNIT_SIZE_MASK: u32 = 0xFFFF_FFC0;

/// Most data servers one layout encoding will name.
pub const WIRE_STRIPE_LIMIT: usize = 16;

/// Layout types this engine can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LayoutType {
    /// NFSv4.1 file layout (RFC 5661).
    Nfsv41Files = LAYOUT4_NFSV4_1_FILES,
}

impl LayoutType {
    /// Validates a wire layout-type number.
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            LAYOUT4_NFSV4_1_FILES => Ok(LayoutType::Nfsv41Files),
            other => Err(PnfsError::UnsupportedLayoutType { layout_type: other }),
        }
    }
}

/// Layout I/O mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IoMode {
    /// Read-only access.
    Read = 1,
    /// Read-write access.
    ReadWrite = 2,
    /// Either mode; valid on return paths, not on grants.
    Any = 3,
}

impl IoMode {
    /// Converts a wire value, `None` for anything undefined.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(IoMode::Read),
            2 => Some(IoMode::ReadWrite),
            3 => Some(IoMode::Any),
            _ => None,
        }
    }

    /// Whether two modes may coexist on overlapping segments.
    pub fn compatible_with(&self, other: IoMode) -> bool {
        *self == other || *self == IoMode::Any || other == IoMode::Any
    }
}

/// Per-(object, client, layout-type) protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutState {
    /// No layout has been granted.
    Unlayouted,
    /// At least one segment is outstanding.
    Granted,
    /// Every granted segment has been returned.
    Returned,
    /// A commit is being applied.
    CommittedPending,
    /// Client-reported size/mtime have been folded in.
    Committed,
}

/// One granted layout segment, carrying everything needed to encode its
/// wire form.
#[derive(Debug, Clone)]
pub struct LayoutSegment {
    /// Layout type.
    pub layout_type: LayoutType,
    /// Granted I/O mode.
    pub io_mode: IoMode,
    /// Byte offset the segment covers.
    pub offset: u64,
    /// Covered length; `u64::MAX` means to end of file.
    pub length: u64,
    /// The client must return this segment on close.
    pub return_on_close: bool,
    /// No further segments follow in this grant.
    pub last_segment: bool,
    /// Device the client resolves via GETDEVICEINFO.
    pub device_id: DeviceId,
    /// Striping pattern word: stripe unit size OR'd with flags.
    pub nfl_util: u32,
    /// Index of the first stripe for this file.
    pub first_stripe_index: u32,
    /// Offset the striping pattern starts at.
    pub pattern_offset: u64,
    /// Per-stripe opaque data-server file handles.
    pub ds_handles: Vec<Vec<u8>>,
}

impl LayoutSegment {
    /// True when the segment covers the given byte range.
    pub fn covers(&self, offset: u64, length: u64) -> bool {
        if offset < self.offset {
            return false;
        }
        if self.length == u64::MAX {
            return true;
        }
        let seg_end = self.offset.saturating_add(self.length);
        offset.saturating_add(length) <= seg_end
    }

    /// Encodes the layout-type-specific body: device id, nfl_util, first
    /// stripe index, pattern offset, then the count-prefixed handle list.
    pub fn encode_loc_body(&self) -> Bytes {
        let mut enc = XdrEncoder::new();
        enc.encode_opaque_fixed(&self.device_id.to_bytes());
        enc.encode_u32(self.nfl_util);
        enc.encode_u32(self.first_stripe_index);
        enc.encode_u64(self.pattern_offset);
        enc.encode_u32(self.ds_handles.len() as u32);
        for fh in &self.ds_handles {
            enc.encode_opaque_variable(fh);
        }
        enc.finish()
    }
}

/// Result of a layout commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutCommitResult {
    /// The size now recorded, when the commit grew the file.
    pub new_size: Option<u64>,
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct LayoutEngineConfig {
    /// Backend id stamped into minted device ids.
    pub backend_id: u8,
    /// Stripe unit in bytes; must leave the low six nfl_util flag bits
    /// clear.
    pub stripe_unit: u32,
    /// Data servers per layout (clamped to `WIRE_STRIPE_LIMIT`).
    pub stripe_width: usize,
    /// Whether COMMIT is the MDS's job rather than the data servers'.
    pub commit_through_mds: bool,
}

impl Default for LayoutEngineConfig {
    fn default() -> Self {
        Self {
            backend_id: 1,
            stripe_unit: 0x100000,
            stripe_width: 1,
            commit_through_mds: true,
        }
    }
}

fn ranges_overlap(a_off: u64, a_len: u64, b_off: u64, b_len: u64) -> bool {
    let a_end = if a_len == u64::MAX {
        u64::MAX
    } else {
        a_off.saturating_add(a_len)
    };
    let b_end = if b_len == u64::MAX {
        u64::MAX
    } else {
        b_off.saturating_add(b_len)
    };
    a_off < b_end && b_off < a_end
}

/// Picks the data-server indices filling a layout's stripe slots.
///
/// Candidates are ordered canonically by rotating them by a content hash
/// of the object's identity, so every MDS instance picks the same subset
/// when placement names more candidates than the wire allows. Slots left
/// over when placement names fewer candidates than the pattern wants are
/// filled round-robin over all known servers. The result is always a
/// complete, valid slot list, never a truncation or a failure.
pub(crate) fn plan_stripes(
    hash: u64,
    candidates: &[usize],
    known_count: usize,
    slots: usize,
) -> Vec<usize> {
    let rotation = (hash % candidates.len() as u64) as usize;
    let mut picked: Vec<usize> = (0..candidates.len().min(slots))
        .map(|i| candidates[(rotation + i) % candidates.len()])
        .collect();
    while picked.len() < slots {
        let fill = (hash as usize + picked.len()) % known_count;
        picked.push(fill);
    }
    picked
}

#[derive(Debug, Clone)]
struct GrantedSegment {
    io_mode: IoMode,
    offset: u64,
    length: u64,
    returned: bool,
}

#[derive(Debug, Default)]
struct LayoutRecord {
    committed: bool,
    pending_commit: bool,
    segments: Vec<GrantedSegment>,
}

impl LayoutRecord {
    fn state(&self) -> LayoutState {
        if self.pending_commit {
            return LayoutState::CommittedPending;
        }
        if self.segments.is_empty() {
            if self.committed {
                return LayoutState::Committed;
            }
            return LayoutState::Unlayouted;
        }
        if self.segments.iter().all(|s| s.returned) {
            return LayoutState::Returned;
        }
        if self.committed {
            LayoutState::Committed
        } else {
            LayoutState::Granted
        }
    }
}

type LayoutKey = (Vec<u8>, u64, u32);

/// The MDS-side layout engine for one backend family.
pub struct LayoutEngine {
    config: LayoutEngineConfig,
    devices: Arc<DeviceRegistry>,
    data_servers: RwLock<Vec<DsAddr>>,
    records: DashMap<LayoutKey, LayoutRecord>,
    object_locks: DashMap<Vec<u8>, Arc<RwLock<()>>>,
}

impl LayoutEngine {
    /// An engine with no data servers yet.
    pub fn new(config: LayoutEngineConfig, devices: Arc<DeviceRegistry>) -> Result<Self> {
        if config.stripe_unit & !NFL4_UFLG_STRIPE_UNIT_SIZE_MASK != 0 {
            return Err(PnfsError::Io(FsalError::new(ErrorKind::InvalidArgument)));
        }
        if config.stripe_width == 0 {
            return Err(PnfsError::Io(FsalError::new(ErrorKind::InvalidArgument)));
        }
        Ok(Self {
            config,
            devices,
            data_servers: RwLock::new(Vec::new()),
            records: DashMap::new(),
            object_locks: DashMap::new(),
        })
    }

    /// Registers a data server with the placement pool.
    pub fn add_data_server(&self, addr: DsAddr) {
        self.data_servers.write().push(addr);
    }

    /// Number of known data servers.
    pub fn server_count(&self) -> usize {
        self.data_servers.read().len()
    }

    fn object_lock(&self, key_bytes: &[u8]) -> Arc<RwLock<()>> {
        self.object_locks
            .entry(key_bytes.to_vec())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn key_hash(key: &CacheKey) -> u64 {
        let digest = blake3::hash(key.as_bytes());
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_be_bytes(first)
    }

    /// Grants a layout for an object.
    ///
    /// Resolves a device id, chooses the striping pattern, and returns the
    /// one whole-file segment the policy grants, marked last and
    /// return-on-close. A request already fully covered by a granted
    /// compatible segment is re-granted rather than refused; an overlap
    /// with an incompatible io-mode for the same client is a protocol
    /// error.
    pub fn layout_get(
        &self,
        object: &Arc<dyn ObjectHandle>,
        client_id: u64,
        layout_type: u32,
        offset: u64,
        length: u64,
        io_mode: IoMode,
    ) -> Result<LayoutSegment> {
        let lt = LayoutType::from_u32(layout_type)?;
        if io_mode == IoMode::Any {
            return Err(PnfsError::Io(FsalError::new(ErrorKind::InvalidArgument)));
        }

        let servers = self.data_servers.read().clone();
        if servers.is_empty() {
            return Err(PnfsError::NoDataServers);
        }

        let key = object.handle_to_key();
        let hash = Self::key_hash(&key);

        // Placement metadata: this engine considers every known server a
        // candidate; a backend with real placement would narrow the list.
        let candidates: Vec<usize> = (0..servers.len()).collect();
        let slots = self.config.stripe_width.min(WIRE_STRIPE_LIMIT);
        let stripes = plan_stripes(hash, &candidates, servers.len(), slots);
        let addrs: Vec<DsAddr> = stripes.iter().map(|i| servers[*i]).collect();

        // The device id names the DS set, not the file: objects striped
        // over the same servers share one device, and a changed pool
        // mints a fresh id instead of mutating a registered one.
        let mut hasher = blake3::Hasher::new();
        for ds in &addrs {
            hasher.update(&ds.addr.octets());
            hasher.update(&ds.port.to_be_bytes());
            hasher.update(&[ds.proto]);
        }
        let mut devid_bytes = [0u8; 8];
        devid_bytes.copy_from_slice(&hasher.finalize().as_bytes()[..8]);

        let device_id = DeviceId {
            backend_id: self.config.backend_id,
            export_id: object.export_id(),
            device_index: stripes[0] as u32,
            devid: u64::from_be_bytes(devid_bytes),
        };
        self.devices.register(&device_id, addrs)?;

        let wire = object
            .handle_to_wire(true)
            .map_err(PnfsError::Io)?
            .as_bytes()
            .to_vec();
        let ds_handles: Vec<Vec<u8>> = stripes.iter().map(|_| wire.clone()).collect();

        let mut nfl_util = self.config.stripe_unit & NFL4_UFLG_STRIPE_UNIT_SIZE_MASK;
        nfl_util |= NFL4_UFLG_DENSE;
        if self.config.commit_through_mds {
            nfl_util |= NFL4_UFLG_COMMIT_THRU_MDS;
        }

        let record_key = (key.as_bytes().to_vec(), client_id, layout_type);
        let mut record = self.records.entry(record_key).or_default();

        for seg in record.segments.iter().filter(|s| !s.returned) {
            if ranges_overlap(seg.offset, seg.length, offset, length)
                && !seg.io_mode.compatible_with(io_mode)
            {
                tracing::debug!(
                    client_id,
                    ?io_mode,
                    existing = ?seg.io_mode,
                    "refusing overlapping layout with incompatible io-mode"
                );
                return Err(PnfsError::ConflictingLayout);
            }
        }

        // Whole-file grant; an identical outstanding segment means this is
        // a re-grant and nothing new is recorded.
        let already = record
            .segments
            .iter()
            .any(|s| !s.returned && s.io_mode == io_mode && s.offset == 0 && s.length == u64::MAX);
        if !already {
            record.segments.push(GrantedSegment {
                io_mode,
                offset: 0,
                length: u64::MAX,
                returned: false,
            });
        }

        tracing::debug!(
            client_id,
            fileid = object.host_handle().fileid,
            stripes = ds_handles.len(),
            "layout granted"
        );

        Ok(LayoutSegment {
            layout_type: lt,
            io_mode,
            offset: 0,
            length: u64::MAX,
            return_on_close: true,
            last_segment: true,
            device_id,
            nfl_util,
            first_stripe_index: 0,
            pattern_offset: 0,
            ds_handles,
        })
    }

    /// Marks a segment returned.
    ///
    /// Idempotent: returning an already-returned (or never-granted)
    /// segment is not an error. `reclaim` marks returns driven by grace
    /// recovery rather than the client's own close.
    pub fn layout_return(
        &self,
        object_key: &CacheKey,
        client_id: u64,
        layout_type: u32,
        offset: u64,
        length: u64,
        reclaim: bool,
    ) -> Result<()> {
        LayoutType::from_u32(layout_type)?;
        let record_key = (object_key.as_bytes().to_vec(), client_id, layout_type);
        if let Some(mut record) = self.records.get_mut(&record_key) {
            for seg in record.segments.iter_mut() {
                if !seg.returned && ranges_overlap(seg.offset, seg.length, offset, length) {
                    seg.returned = true;
                }
            }
        }
        tracing::debug!(client_id, reclaim, "layout returned");
        Ok(())
    }

    /// Folds client-reported size/mtime into the MDS's view of the object.
    ///
    /// Size only grows and mtime only advances; a stale commit regresses
    /// nothing. The per-object lock is held across the compare-and-update
    /// (the attribute read and conditional write), serializing racing
    /// commits; it is not held across any other backend call.
    pub fn layout_commit(
        &self,
        object: &Arc<dyn ObjectHandle>,
        client_id: u64,
        layout_type: u32,
        new_size: Option<u64>,
        new_mtime: Option<Timespec>,
    ) -> Result<LayoutCommitResult> {
        LayoutType::from_u32(layout_type)?;

        let key = object.handle_to_key();
        let record_key = (key.as_bytes().to_vec(), client_id, layout_type);
        if let Some(mut record) = self.records.get_mut(&record_key) {
            record.pending_commit = true;
        }

        let lock = self.object_lock(key.as_bytes());
        let result = {
            let _guard = lock.write();
            let attrs = object.attributes().map_err(PnfsError::Io)?;

            let grow = match new_size {
                Some(size) if size > attrs.size => Some(size),
                _ => None,
            };
            let advance = match new_mtime {
                Some(mtime) if mtime.is_later_than(&attrs.mtime) => Some(mtime),
                _ => None,
            };
            if grow.is_some() || advance.is_some() {
                object.setattr(grow, advance).map_err(PnfsError::Io)?;
            }
            LayoutCommitResult { new_size: grow }
        };

        if let Some(mut record) = self.records.get_mut(&record_key) {
            record.pending_commit = false;
            record.committed = true;
        }
        tracing::debug!(client_id, accepted = ?result.new_size, "layout committed");
        Ok(result)
    }

    /// Protocol state for one (object, client, layout type).
    pub fn state(&self, object_key: &CacheKey, client_id: u64, layout_type: u32) -> LayoutState {
        let record_key = (object_key.as_bytes().to_vec(), client_id, layout_type);
        self.records
            .get(&record_key)
            .map(|r| r.state())
            .unwrap_or(LayoutState::Unlayouted)
    }
}
