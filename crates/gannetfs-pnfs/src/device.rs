//! Device identities and the device registry
//!
//! A device id names, within one layout type and export, the data server
//! (or striped set of data servers) backing a file. It travels as a fixed
//! 16-byte token; the registry resolves it back to addresses for
//! GETDEVICEINFO. The registry is authoritative-map-plus-front-cache, both
//! mutated under one lock: a front-cache miss costs an extra map lookup,
//! never a wrong answer.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{PnfsError, Result};
use crate::xdr::XdrEncoder;

/// Wire size of a device id.
pub const DEVICE_ID_SIZE: usize = 16;

/// IPv4 address family number used on the wire.
pub const ADDR_FAMILY_INET: u32 = 2;

/// TCP transport protocol number used on the wire.
pub const PROTO_TCP: u32 = 6;

const FRONT_CACHE_SLOTS: usize = 32;

/// Fixed-size device identity.
///
/// Wire layout, big-endian: backend id (u8), reserved zero byte,
/// export-scoped id (u16), backend device number (u32), backend private
/// value (u64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// Which backend family minted the id.
    pub backend_id: u8,
    /// Export scope.
    pub export_id: u16,
    /// Backend device number.
    pub device_index: u32,
    /// Backend private value.
    pub devid: u64,
}

impl DeviceId {
    /// Encodes to the 16-byte wire token.
    pub fn to_bytes(&self) -> [u8; DEVICE_ID_SIZE] {
        let mut out = [0u8; DEVICE_ID_SIZE];
        out[0] = self.backend_id;
        out[1] = 0;
        out[2..4].copy_from_slice(&self.export_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.device_index.to_be_bytes());
        out[8..16].copy_from_slice(&self.devid.to_be_bytes());
        out
    }

    /// Decodes from the 16-byte wire token.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != DEVICE_ID_SIZE {
            return Err(PnfsError::XdrDecode {
                reason: format!("device id length {} != {}", bytes.len(), DEVICE_ID_SIZE),
            });
        }
        Ok(Self {
            backend_id: bytes[0],
            export_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            device_index: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            devid: u64::from_be_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
        })
    }
}

/// One data server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DsAddr {
    /// IPv4 address.
    pub addr: Ipv4Addr,
    /// TCP/UDP port.
    pub port: u16,
    /// Transport protocol number (6 for TCP).
    pub proto: u8,
}

impl DsAddr {
    /// A TCP data server endpoint.
    pub fn tcp(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            addr,
            port,
            proto: PROTO_TCP as u8,
        }
    }
}

struct RegistryInner {
    devices: HashMap<[u8; DEVICE_ID_SIZE], Arc<Vec<DsAddr>>>,
    front: Vec<Option<([u8; DEVICE_ID_SIZE], Arc<Vec<DsAddr>>)>>,
}

/// Registry mapping device ids to data-server address lists.
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

fn front_slot(key: &[u8; DEVICE_ID_SIZE]) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % FRONT_CACHE_SLOTS
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                devices: HashMap::new(),
                front: vec![None; FRONT_CACHE_SLOTS],
            }),
        }
    }

    /// Registers a device id with its address list.
    ///
    /// A device id is stable for its lifetime: registering the same id
    /// again with the same addresses is idempotent, with different
    /// addresses an error.
    pub fn register(&self, id: &DeviceId, addrs: Vec<DsAddr>) -> Result<()> {
        if addrs.is_empty() {
            return Err(PnfsError::NoDataServers);
        }
        let key = id.to_bytes();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.devices.get(&key) {
            if **existing != addrs {
                tracing::warn!(?id, "conflicting re-registration of device id");
                return Err(PnfsError::Io(gannetfs_fsal::FsalError::new(
                    gannetfs_fsal::ErrorKind::InvalidArgument,
                )));
            }
            return Ok(());
        }
        let addrs = Arc::new(addrs);
        let slot = front_slot(&key);
        inner.front[slot] = Some((key, addrs.clone()));
        inner.devices.insert(key, addrs);
        Ok(())
    }

    /// Resolves a device id to its address list.
    ///
    /// The front cache is consulted first and revalidated against the
    /// authoritative map under the same lock.
    pub fn resolve(&self, id: &DeviceId) -> Option<Arc<Vec<DsAddr>>> {
        let key = id.to_bytes();
        let mut inner = self.inner.lock();
        let slot = front_slot(&key);
        if let Some((cached_key, cached)) = &inner.front[slot] {
            if *cached_key == key && inner.devices.contains_key(&key) {
                return Some(cached.clone());
            }
        }
        match inner.devices.get(&key).cloned() {
            Some(addrs) => {
                inner.front[slot] = Some((key, addrs.clone()));
                Some(addrs)
            }
            None => None,
        }
    }

    /// Removes a device id (its addresses became invalid). Returns true
    /// when it existed.
    pub fn remove(&self, id: &DeviceId) -> bool {
        let key = id.to_bytes();
        let mut inner = self.inner.lock();
        let slot = front_slot(&key);
        if let Some((cached_key, _)) = &inner.front[slot] {
            if *cached_key == key {
                inner.front[slot] = None;
            }
        }
        inner.devices.remove(&key).is_some()
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.inner.lock().devices.len()
    }

    /// True when no devices are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().devices.is_empty()
    }

    /// Encodes the GETDEVICEINFO reply body for a device id.
    ///
    /// Wire form: count-prefixed stripe-index array (index i names entry i
    /// of the following list), then a count-prefixed list of
    /// (address family, IPv4 address, port, transport protocol) tuples.
    /// Stable for the lifetime of the device id.
    pub fn getdeviceinfo(&self, id: &DeviceId) -> Result<Bytes> {
        let addrs = self.resolve(id).ok_or(PnfsError::UnknownDevice)?;
        let mut enc = XdrEncoder::new();
        enc.encode_u32(addrs.len() as u32);
        for index in 0..addrs.len() as u32 {
            enc.encode_u32(index);
        }
        enc.encode_u32(addrs.len() as u32);
        for ds in addrs.iter() {
            enc.encode_u32(ADDR_FAMILY_INET);
            enc.encode_u32(u32::from_be_bytes(ds.addr.octets()));
            enc.encode_u32(ds.port as u32);
            enc.encode_u32(ds.proto as u32);
        }
        Ok(enc.finish())
    }

    /// Degenerate GETDEVICELIST: no enumeration, end-of-list immediately.
    pub fn getdevicelist(&self) -> (Vec<u64>, bool) {
        (Vec::new(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xdr::XdrDecoder;

    fn device_id(n: u64) -> DeviceId {
        DeviceId {
            backend_id: 3,
            export_id: 12,
            device_index: 1,
            devid: n,
        }
    }

    fn addr(last_octet: u8) -> DsAddr {
        DsAddr::tcp(Ipv4Addr::new(10, 0, 0, last_octet), 2049)
    }

    #[test]
    fn test_device_id_wire_round_trip() {
        let id = DeviceId {
            backend_id: 7,
            export_id: 0xBEEF,
            device_index: 0x11223344,
            devid: 0x5566778899AABBCC,
        };
        let bytes = id.to_bytes();
        assert_eq!(bytes.len(), DEVICE_ID_SIZE);
        assert_eq!(DeviceId::from_bytes(&bytes).unwrap(), id);
    }

    #[test]
    fn test_device_id_wrong_length_rejected() {
        assert!(DeviceId::from_bytes(&[0u8; 15]).is_err());
        assert!(DeviceId::from_bytes(&[0u8; 17]).is_err());
    }

    #[test]
    fn test_register_and_resolve() {
        let reg = DeviceRegistry::new();
        let id = device_id(1);
        reg.register(&id, vec![addr(1), addr(2)]).unwrap();
        let addrs = reg.resolve(&id).unwrap();
        assert_eq!(addrs.len(), 2);
    }

    #[test]
    fn test_register_idempotent_same_addrs() {
        let reg = DeviceRegistry::new();
        let id = device_id(1);
        reg.register(&id, vec![addr(1)]).unwrap();
        reg.register(&id, vec![addr(1)]).unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_conflicting_addrs_rejected() {
        let reg = DeviceRegistry::new();
        let id = device_id(1);
        reg.register(&id, vec![addr(1)]).unwrap();
        assert!(reg.register(&id, vec![addr(2)]).is_err());
    }

    #[test]
    fn test_register_empty_addrs_rejected() {
        let reg = DeviceRegistry::new();
        assert_eq!(
            reg.register(&device_id(1), vec![]),
            Err(PnfsError::NoDataServers)
        );
    }

    #[test]
    fn test_resolve_unknown_is_none() {
        let reg = DeviceRegistry::new();
        assert!(reg.resolve(&device_id(9)).is_none());
    }

    #[test]
    fn test_remove_invalidates_front_cache() {
        let reg = DeviceRegistry::new();
        let id = device_id(1);
        reg.register(&id, vec![addr(1)]).unwrap();
        assert!(reg.resolve(&id).is_some());
        assert!(reg.remove(&id));
        assert!(reg.resolve(&id).is_none());
        assert!(!reg.remove(&id));
    }

    #[test]
    fn test_front_cache_never_wrong_after_rebind() {
        // Two ids landing anywhere in the front cache must never alias.
        let reg = DeviceRegistry::new();
        for n in 0..128u64 {
            let id = device_id(n);
            reg.register(&id, vec![addr((n % 250) as u8)]).unwrap();
        }
        for n in 0..128u64 {
            let id = device_id(n);
            let addrs = reg.resolve(&id).unwrap();
            assert_eq!(addrs[0], addr((n % 250) as u8));
        }
    }

    #[test]
    fn test_getdeviceinfo_encoding() {
        let reg = DeviceRegistry::new();
        let id = device_id(1);
        reg.register(&id, vec![addr(7), addr(8)]).unwrap();

        let body = reg.getdeviceinfo(&id).unwrap();
        let mut dec = XdrDecoder::new(body);
        assert_eq!(dec.decode_u32().unwrap(), 2); // stripe index count
        assert_eq!(dec.decode_u32().unwrap(), 0);
        assert_eq!(dec.decode_u32().unwrap(), 1);
        assert_eq!(dec.decode_u32().unwrap(), 2); // ds count
        assert_eq!(dec.decode_u32().unwrap(), ADDR_FAMILY_INET);
        assert_eq!(
            dec.decode_u32().unwrap(),
            u32::from_be_bytes(Ipv4Addr::new(10, 0, 0, 7).octets())
        );
        assert_eq!(dec.decode_u32().unwrap(), 2049);
        assert_eq!(dec.decode_u32().unwrap(), PROTO_TCP);
    }

    #[test]
    fn test_getdeviceinfo_unknown_device() {
        let reg = DeviceRegistry::new();
        assert_eq!(
            reg.getdeviceinfo(&device_id(1)).unwrap_err(),
            PnfsError::UnknownDevice
        );
    }

    #[test]
    fn test_getdevicelist_is_eof() {
        let reg = DeviceRegistry::new();
        let (devices, eof) = reg.getdevicelist();
        assert!(devices.is_empty());
        assert!(eof);
    }

    #[test]
    fn test_getdeviceinfo_stable_across_calls() {
        let reg = DeviceRegistry::new();
        let id = device_id(4);
        reg.register(&id, vec![addr(9)]).unwrap();
        let a = reg.getdeviceinfo(&id).unwrap();
        let b = reg.getdeviceinfo(&id).unwrap();
        assert_eq!(a, b);
    }
}
