//! DS-side handles: bare I/O capabilities decoded from wire handles
//!
//! A data server receives READ/WRITE/COMMIT against a wire handle and must
//! serve them without walking the MDS object tree. `DataServer` validates
//! the handle bytes, finds the owning export's data plane, and hands back
//! a `DsHandle` that opens its descriptor lazily through the bounded
//! handle cache.

use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::Mutex;

use gannetfs_fsal::handle::decode_wire;
use gannetfs_fsal::{
    CacheEntry, DsDataPlane, DsDescriptor, ErrorKind, ExportRegistry, FsalError, HandleCache,
    HandleCacheConfig, HostHandle,
};
use gannetfs_upcall::{InvalidateFlags, ObjectKey, UpcallDispatcher, UpcallEvent, UpcallError};

use crate::error::{PnfsError, Result};

/// How many expired cache entries a DS operation drains on its way out.
const DRAIN_PER_RELEASE: usize = 5;
const DRAIN_PER_OPEN: usize = 2;

/// Write stability levels, least to most durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Stability {
    /// Data may sit in volatile buffers.
    Unstable = 0,
    /// Data is durable; metadata may not be.
    DataSync = 1,
    /// Data and metadata are durable.
    FileSync = 2,
}

impl Stability {
    /// Converts a wire value, `None` for anything undefined.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Stability::Unstable),
            1 => Some(Stability::DataSync),
            2 => Some(Stability::FileSync),
            _ => None,
        }
    }
}

/// The 8-byte verifier a client compares across WRITE and COMMIT replies.
///
/// One verifier per server boot: a reboot changes it, telling clients
/// their unstable writes may have been lost. `write` and `commit` within
/// one boot epoch therefore always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteVerifier(pub [u8; 8]);

static BOOT_VERIFIER: OnceLock<WriteVerifier> = OnceLock::new();

/// The process-wide write verifier for this boot epoch.
pub fn boot_verifier() -> WriteVerifier {
    *BOOT_VERIFIER.get_or_init(|| WriteVerifier(rand::random::<u64>().to_be_bytes()))
}

type DsCacheKey = (u16, u64);
type DsCache = HandleCache<DsCacheKey, Arc<dyn DsDescriptor>>;

enum DsState {
    Unbound,
    Bound(Arc<CacheEntry<DsCacheKey, Arc<dyn DsDescriptor>>>),
    Closed,
}

/// The data-server side of the house: decodes wire handles, owns the
/// descriptor cache shared by every DS handle it mints.
pub struct DataServer {
    exports: Arc<ExportRegistry>,
    cache: Arc<DsCache>,
    upcalls: Arc<UpcallDispatcher>,
}

impl DataServer {
    /// A data server over the given export table.
    pub fn new(
        exports: Arc<ExportRegistry>,
        cache_config: HandleCacheConfig,
        upcalls: Arc<UpcallDispatcher>,
    ) -> Self {
        Self {
            exports,
            cache: Arc::new(HandleCache::new(cache_config)),
            upcalls,
        }
    }

    /// Decodes a client wire handle into a DS handle.
    ///
    /// Length and endianness-sensitive header fields are validated before
    /// any of the payload is trusted; malformed input is a `BadHandle`
    /// protocol error, never a panic. The big-endian flag comes from the
    /// transport that carried the handle.
    pub fn make_ds_handle(&self, wire: &[u8], big_endian: bool) -> Result<DsHandle> {
        let (export_id, host) = decode_wire(wire, big_endian).map_err(PnfsError::Io)?;
        let export = self
            .exports
            .get(export_id)
            .ok_or_else(|| PnfsError::Io(FsalError::new(ErrorKind::StaleHandle)))?;
        let plane = export
            .ds_data_plane()
            .ok_or_else(|| PnfsError::Io(FsalError::new(ErrorKind::NotSupported)))?;
        Ok(DsHandle {
            export_id,
            host,
            plane,
            cache: self.cache.clone(),
            upcalls: self.upcalls.clone(),
            state: Mutex::new(DsState::Unbound),
            last_stability: Mutex::new(None),
        })
    }

    /// Resident descriptor-cache entries, for observability.
    pub fn cached_descriptors(&self) -> usize {
        self.cache.len()
    }
}

/// A bare I/O capability for one object, scoped to nothing but its wire
/// handle. Holds at most one cached descriptor.
pub struct DsHandle {
    export_id: u16,
    host: HostHandle,
    plane: Arc<dyn DsDataPlane>,
    cache: Arc<DsCache>,
    upcalls: Arc<UpcallDispatcher>,
    state: Mutex<DsState>,
    last_stability: Mutex<Option<Stability>>,
}

impl std::fmt::Debug for DsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsHandle")
            .field("export_id", &self.export_id)
            .finish_non_exhaustive()
    }
}

impl DsHandle {
    /// The export this handle is scoped to.
    pub fn export_id(&self) -> u16 {
        self.export_id
    }

    /// The decoded host identity.
    pub fn host(&self) -> &HostHandle {
        &self.host
    }

    /// The stability level the last write on this handle negotiated.
    pub fn last_stability(&self) -> Option<Stability> {
        *self.last_stability.lock()
    }

    fn drain_expired(&self, count: usize) {
        for _ in 0..count {
            match self.cache.pop_expired() {
                Some(entry) => {
                    tracing::debug!(key = ?entry.key(), "closing expired DS descriptor");
                    drop(entry);
                }
                None => break,
            }
        }
    }

    /// Opens or reuses the descriptor, binding this handle.
    fn bind(&self) -> Result<Arc<dyn DsDescriptor>> {
        let mut state = self.state.lock();
        match &*state {
            DsState::Closed => Err(PnfsError::Io(FsalError::new(ErrorKind::StaleHandle))),
            DsState::Bound(entry) => match entry.descriptor() {
                Some(descriptor) => Ok(descriptor),
                None => Err(PnfsError::Io(FsalError::server_fault(
                    "bound DS handle lost its descriptor",
                ))),
            },
            DsState::Unbound => {
                self.drain_expired(DRAIN_PER_OPEN);
                let entry = self.cache.acquire((self.export_id, self.host.fileid));
                let descriptor = match entry.descriptor() {
                    Some(descriptor) => descriptor,
                    None => match self.plane.open(&self.host) {
                        Ok(descriptor) => {
                            entry.attach(descriptor.clone());
                            descriptor
                        }
                        Err(err) => {
                            // The entry never got a usable descriptor;
                            // nobody may reuse it.
                            self.cache.erase(&entry);
                            tracing::warn!(error = %err, "DS open failed");
                            return Err(PnfsError::Io(FsalError::server_fault(
                                "underlying DS open failed",
                            )));
                        }
                    },
                };
                *state = DsState::Bound(entry);
                Ok(descriptor)
            }
        }
    }

    /// Positioned read. `end_of_file` is true when zero bytes were read
    /// or fewer than requested were available.
    pub fn read(&self, offset: u64, length: usize) -> Result<(Vec<u8>, bool)> {
        let descriptor = self.bind()?;
        let data = descriptor.read_at(offset, length).map_err(PnfsError::Io)?;
        let eof = data.len() < length;
        Ok((data, eof))
    }

    /// Positioned write.
    ///
    /// `stability_got` is always at least as durable as requested: any
    /// request above Unstable flushes before returning. A successful
    /// write raises an Invalidate upcall so the caching layer never
    /// serves stale size or mtime for this object.
    pub fn write(
        &self,
        offset: u64,
        data: &[u8],
        stability_wanted: Stability,
    ) -> Result<(u64, Stability, WriteVerifier)> {
        let descriptor = self.bind()?;
        let written = descriptor.write_at(offset, data).map_err(PnfsError::Io)?;

        let stability_got = if stability_wanted == Stability::Unstable {
            Stability::Unstable
        } else {
            descriptor.flush().map_err(PnfsError::Io)?;
            stability_wanted
        };
        *self.last_stability.lock() = Some(stability_got);

        let event = UpcallEvent::Invalidate {
            export_id: self.export_id,
            key: ObjectKey::from_bytes(
                gannetfs_fsal::CacheKey::from_host(self.export_id, &self.host).as_bytes(),
            ),
            flags: InvalidateFlags::attrs_and_content(),
        };
        match self.upcalls.submit(event) {
            Ok(()) => {}
            Err(UpcallError::QueueFull) => {
                tracing::warn!("invalidate upcall dropped: queue full");
            }
            Err(err) => {
                tracing::warn!(error = %err, "invalidate upcall not submitted");
            }
        }

        Ok((written as u64, stability_got, boot_verifier()))
    }

    /// Commits a byte range.
    ///
    /// With commit-through-MDS backends the data server has nothing to
    /// make durable, so this degrades to a no-op success; a bound
    /// descriptor is still flushed so the verifier's promise holds. The
    /// verifier matches the one `write` returned this boot epoch.
    pub fn commit(&self, offset: u64, length: u64) -> Result<WriteVerifier> {
        let _ = (offset, length);
        let state = self.state.lock();
        if let DsState::Bound(entry) = &*state {
            if let Some(descriptor) = entry.descriptor() {
                descriptor.flush().map_err(PnfsError::Io)?;
            }
        }
        Ok(boot_verifier())
    }

    /// Releases the handle and the cache entry it held, then drains a few
    /// expired entries to keep total open descriptors bounded.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if let DsState::Bound(entry) = &*state {
            self.cache.release(entry);
        }
        *state = DsState::Closed;
        drop(state);
        self.drain_expired(DRAIN_PER_RELEASE);
    }
}
