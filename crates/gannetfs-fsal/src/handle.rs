//! The three handle representations and the object-handle contract
//!
//! A filesystem object is known in three forms:
//!
//! - the *wire handle*, opaque bytes exchanged with an NFS client;
//! - the *host handle*, the backend-native identity (fsid + fileid +
//!   generation + backend-private opaque);
//! - the *cache key*, the derivative of the host handle the caching layer
//!   indexes by.
//!
//! The invariant every backend must preserve:
//! `key(wire_to_host(handle_to_wire(h))) == key(h)` for every live handle.
//!
//! Multi-byte header fields in the wire form are written in the byte order
//! selected by a single big-endian flag supplied by the transport, and
//! normalized the same way on decode.

use std::sync::Arc;

use crate::attr::{Attributes, FsId, ObjectType, Timespec};
use crate::error::{ErrorKind, FsalError, Result};

/// Hard cap on the wire-handle payload, protocol-defined.
pub const WIRE_HANDLE_MAX: usize = 64;

/// Wire-format version tag, first byte of every handle.
pub const WIRE_HANDLE_VERSION: u8 = 1;

/// Fixed header bytes preceding the backend opaque.
pub const WIRE_HEADER_LEN: usize = 32;

/// Maximum number of bytes a cache key may exceed its host handle by.
pub const KEY_EXTRA_MAX: usize = 8;

/// Backend-native identity of one object, sufficient to re-derive a live
/// handle through `create_handle_from_host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostHandle {
    /// Owning filesystem.
    pub fsid: FsId,
    /// File id within the filesystem.
    pub fileid: u64,
    /// Generation counter disambiguating fileid reuse.
    pub generation: u32,
    /// Backend-private identity bytes, at most
    /// `WIRE_HANDLE_MAX - WIRE_HEADER_LEN` of them.
    pub opaque: Vec<u8>,
}

impl HostHandle {
    /// Builds a host handle with no backend opaque.
    pub fn new(fsid: FsId, fileid: u64, generation: u32) -> Self {
        Self {
            fsid,
            fileid,
            generation,
            opaque: Vec::new(),
        }
    }
}

/// The caching layer's index for one object: host-handle identity scoped
/// by export id, with the backend opaque dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Vec<u8>);

impl CacheKey {
    /// Derives the key for a host handle under one export.
    ///
    /// The key is smaller than the host handle (the opaque is dropped) plus
    /// two export-id bytes, well inside `KEY_EXTRA_MAX`.
    pub fn from_host(export_id: u16, host: &HostHandle) -> Self {
        let mut bytes = Vec::with_capacity(30);
        bytes.extend_from_slice(&export_id.to_be_bytes());
        bytes.extend_from_slice(&host.fsid.major.to_be_bytes());
        bytes.extend_from_slice(&host.fsid.minor.to_be_bytes());
        bytes.extend_from_slice(&host.fileid.to_be_bytes());
        bytes.extend_from_slice(&host.generation.to_be_bytes());
        Self(bytes)
    }

    /// Key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the key, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// An encoded wire handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHandle(Vec<u8>);

impl WireHandle {
    /// Raw handle bytes as sent to the client.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Handle length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the handle is empty (never produced by a valid encode).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16, big_endian: bool) {
    if big_endian {
        buf.extend_from_slice(&v.to_be_bytes());
    } else {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32, big_endian: bool) {
    if big_endian {
        buf.extend_from_slice(&v.to_be_bytes());
    } else {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn put_u64(buf: &mut Vec<u8>, v: u64, big_endian: bool) {
    if big_endian {
        buf.extend_from_slice(&v.to_be_bytes());
    } else {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn get_u16(bytes: &[u8], big_endian: bool) -> u16 {
    let arr = [bytes[0], bytes[1]];
    if big_endian {
        u16::from_be_bytes(arr)
    } else {
        u16::from_le_bytes(arr)
    }
}

fn get_u32(bytes: &[u8], big_endian: bool) -> u32 {
    let arr = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if big_endian {
        u32::from_be_bytes(arr)
    } else {
        u32::from_le_bytes(arr)
    }
}

fn get_u64(bytes: &[u8], big_endian: bool) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    if big_endian {
        u64::from_be_bytes(arr)
    } else {
        u64::from_le_bytes(arr)
    }
}

/// Encodes a host handle into its wire form under one export.
///
/// Layout: version byte, opaque length byte, export id (u16), fsid major
/// and minor (u64 each), fileid (u64), generation (u32), then the backend
/// opaque. Multi-byte fields follow the transport's endianness flag.
pub fn encode_wire(export_id: u16, host: &HostHandle, big_endian: bool) -> Result<WireHandle> {
    if WIRE_HEADER_LEN + host.opaque.len() > WIRE_HANDLE_MAX {
        return Err(FsalError::new(ErrorKind::FileTooBig));
    }
    let mut buf = Vec::with_capacity(WIRE_HEADER_LEN + host.opaque.len());
    buf.push(WIRE_HANDLE_VERSION);
    buf.push(host.opaque.len() as u8);
    put_u16(&mut buf, export_id, big_endian);
    put_u64(&mut buf, host.fsid.major, big_endian);
    put_u64(&mut buf, host.fsid.minor, big_endian);
    put_u64(&mut buf, host.fileid, big_endian);
    put_u32(&mut buf, host.generation, big_endian);
    buf.extend_from_slice(&host.opaque);
    Ok(WireHandle(buf))
}

/// Decodes wire bytes back into the export id and host handle.
///
/// Length or header mismatch is a protocol error (`BadHandle`), never a
/// panic: the input came off the network.
pub fn decode_wire(bytes: &[u8], big_endian: bool) -> Result<(u16, HostHandle)> {
    if bytes.len() < WIRE_HEADER_LEN || bytes.len() > WIRE_HANDLE_MAX {
        return Err(FsalError::new(ErrorKind::BadHandle));
    }
    if bytes[0] != WIRE_HANDLE_VERSION {
        return Err(FsalError::new(ErrorKind::BadHandle));
    }
    let opaque_len = bytes[1] as usize;
    if bytes.len() != WIRE_HEADER_LEN + opaque_len {
        return Err(FsalError::new(ErrorKind::BadHandle));
    }
    let export_id = get_u16(&bytes[2..4], big_endian);
    let fsid = FsId::new(
        get_u64(&bytes[4..12], big_endian),
        get_u64(&bytes[12..20], big_endian),
    );
    let fileid = get_u64(&bytes[20..28], big_endian);
    let generation = get_u32(&bytes[28..32], big_endian);
    let opaque = bytes[WIRE_HEADER_LEN..].to_vec();
    Ok((
        export_id,
        HostHandle {
            fsid,
            fileid,
            generation,
            opaque,
        },
    ))
}

/// Per-object operations every backend implements.
///
/// A handle is created by lookup/create operations and destroyed when its
/// last holder drops it; reference lifetime is scope-based (`Arc`), so no
/// explicit put call exists to forget.
pub trait ObjectHandle: Send + Sync {
    /// The export this handle belongs to.
    fn export_id(&self) -> u16;

    /// Object type, known from creation time.
    fn object_type(&self) -> ObjectType;

    /// Current attributes, fetched from the backend.
    fn attributes(&self) -> Result<Attributes>;

    /// Backend-native identity for this object.
    fn host_handle(&self) -> HostHandle;

    /// Encodes this handle's wire form.
    fn handle_to_wire(&self, big_endian: bool) -> Result<WireHandle> {
        encode_wire(self.export_id(), &self.host_handle(), big_endian)
    }

    /// Derives this handle's cache key.
    fn handle_to_key(&self) -> CacheKey {
        CacheKey::from_host(self.export_id(), &self.host_handle())
    }

    /// Looks up a child by name. Only meaningful on directories.
    fn lookup(&self, name: &str) -> Result<Arc<dyn ObjectHandle>>;

    /// Creates a regular file child. Only meaningful on directories.
    fn create_file(&self, name: &str, mode: u32) -> Result<Arc<dyn ObjectHandle>>;

    /// Creates a directory child. Only meaningful on directories.
    fn mkdir(&self, name: &str, mode: u32) -> Result<Arc<dyn ObjectHandle>>;

    /// Positioned read. Returns the data and an end-of-file flag that is
    /// set when zero bytes were read or fewer than requested were
    /// available.
    fn read(&self, offset: u64, length: usize) -> Result<(Vec<u8>, bool)>;

    /// Positioned write. Returns the number of bytes written.
    fn write(&self, offset: u64, data: &[u8]) -> Result<u64>;

    /// Applies a size and/or mtime update.
    fn setattr(&self, new_size: Option<u64>, new_mtime: Option<Timespec>) -> Result<()>;
}

/// Factory for bare DS-side I/O descriptors, reachable without the MDS
/// object tree.
pub trait DsDataPlane: Send + Sync {
    /// Opens (or re-opens) an I/O descriptor for the object named by a
    /// host handle.
    fn open(&self, host: &HostHandle) -> Result<Arc<dyn DsDescriptor>>;
}

/// A bare I/O capability over one object's bytes.
pub trait DsDescriptor: Send + Sync {
    /// Positioned read of up to `length` bytes.
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Positioned write; returns bytes written.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize>;

    /// Forces written data down to stable storage.
    fn flush(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("export_id", &self.export_id())
            .field("object_type", &self.object_type())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for dyn DsDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsDescriptor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_host() -> HostHandle {
        HostHandle {
            fsid: FsId::new(0x1122334455667788, 0x99aabbccddeeff00),
            fileid: 424242,
            generation: 7,
            opaque: vec![0xde, 0xad, 0xbe, 0xef],
        }
    }

    #[test]
    fn test_encode_decode_round_trip_big_endian() {
        let host = sample_host();
        let wire = encode_wire(12, &host, true).unwrap();
        let (export_id, decoded) = decode_wire(wire.as_bytes(), true).unwrap();
        assert_eq!(export_id, 12);
        assert_eq!(decoded, host);
    }

    #[test]
    fn test_encode_decode_round_trip_little_endian() {
        let host = sample_host();
        let wire = encode_wire(12, &host, false).unwrap();
        let (export_id, decoded) = decode_wire(wire.as_bytes(), false).unwrap();
        assert_eq!(export_id, 12);
        assert_eq!(decoded, host);
    }

    #[test]
    fn test_endianness_flag_changes_header_bytes() {
        let host = sample_host();
        let be = encode_wire(0x1234, &host, true).unwrap();
        let le = encode_wire(0x1234, &host, false).unwrap();
        assert_eq!(&be.as_bytes()[2..4], &[0x12, 0x34]);
        assert_eq!(&le.as_bytes()[2..4], &[0x34, 0x12]);
    }

    #[test]
    fn test_decode_short_buffer_is_bad_handle() {
        let host = sample_host();
        let wire = encode_wire(1, &host, true).unwrap();
        let truncated = &wire.as_bytes()[..wire.len() - 1];
        let err = decode_wire(truncated, true).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadHandle);
    }

    #[test]
    fn test_decode_wrong_version_is_bad_handle() {
        let host = sample_host();
        let mut bytes = encode_wire(1, &host, true).unwrap().as_bytes().to_vec();
        bytes[0] = 0xFF;
        let err = decode_wire(&bytes, true).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadHandle);
    }

    #[test]
    fn test_decode_oversized_is_bad_handle() {
        let bytes = vec![WIRE_HANDLE_VERSION; WIRE_HANDLE_MAX + 1];
        let err = decode_wire(&bytes, true).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadHandle);
    }

    #[test]
    fn test_encode_rejects_oversized_opaque() {
        let mut host = sample_host();
        host.opaque = vec![0u8; WIRE_HANDLE_MAX - WIRE_HEADER_LEN + 1];
        assert!(encode_wire(1, &host, true).is_err());
    }

    #[test]
    fn test_wire_handle_fits_cap() {
        let mut host = sample_host();
        host.opaque = vec![0u8; WIRE_HANDLE_MAX - WIRE_HEADER_LEN];
        let wire = encode_wire(1, &host, true).unwrap();
        assert_eq!(wire.len(), WIRE_HANDLE_MAX);
    }

    #[test]
    fn test_cache_key_drops_opaque() {
        let mut host = sample_host();
        let key1 = CacheKey::from_host(3, &host);
        host.opaque = vec![1, 2, 3];
        let key2 = CacheKey::from_host(3, &host);
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_cache_key_scoped_by_export() {
        let host = sample_host();
        let key1 = CacheKey::from_host(3, &host);
        let key2 = CacheKey::from_host(4, &host);
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_cache_key_bounded_growth() {
        let host = sample_host();
        let host_len = 8 + 8 + 8 + 4 + host.opaque.len();
        let key = CacheKey::from_host(1, &host);
        assert!(key.as_bytes().len() <= host_len + KEY_EXTRA_MAX);
    }

    #[test]
    fn test_round_trip_law_through_wire() {
        // key(wire_to_host(handle_to_wire(h))) == key(h)
        let host = sample_host();
        let export_id = 9;
        let key_direct = CacheKey::from_host(export_id, &host);
        let wire = encode_wire(export_id, &host, true).unwrap();
        let (decoded_export, decoded_host) = decode_wire(wire.as_bytes(), true).unwrap();
        let key_round = CacheKey::from_host(decoded_export, &decoded_host);
        assert_eq!(key_direct, key_round);
    }
}
