#![warn(missing_docs)]

//! GannetFS pNFS subsystem: layout grants on the metadata side, bare wire
//! handles on the data side
//!
//! The MDS half ([`layout::LayoutEngine`]) resolves a file to a device id
//! and striping pattern, grants/returns/commits layout segments, and
//! encodes the wire forms a client consumes. The DS half
//! ([`ds::DataServer`]) decodes a wire handle into a bare I/O capability
//! and performs read/write/commit against it without ever touching the
//! MDS object tree, reusing descriptors through the bounded handle cache.

pub mod device;
pub mod ds;
pub mod error;
pub mod layout;
pub mod xdr;

pub use device::{DeviceId, DeviceRegistry, DsAddr, DEVICE_ID_SIZE};
pub use ds::{DataServer, DsHandle, Stability, WriteVerifier};
pub use error::{PnfsError, Result};
pub use layout::{
    IoMode, LayoutCommitResult, LayoutEngine, LayoutEngineConfig, LayoutSegment, LayoutState,
    LayoutType,
};
pub use xdr::{XdrDecoder, XdrEncoder};
