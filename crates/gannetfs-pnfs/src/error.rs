//! pNFS error types
//!
//! Layout-protocol errors are a family of their own, distinct from plain
//! I/O errors, so a client can tell "ask the MDS again" apart from "this
//! read genuinely failed".

use thiserror::Error;

use gannetfs_fsal::FsalError;

/// NFSv4.1 status: bad I/O mode for the requested layout
pub const NFS4ERR_BADIOMODE: u32 = 10049;
/// NFSv4.1 status: layout specified is invalid
pub const NFS4ERR_BADLAYOUT: u32 = 10058;
/// NFSv4.1 status: layout unavailable for this file
pub const NFS4ERR_LAYOUTUNAVAILABLE: u32 = 10059;
/// NFSv4.1 status: unknown layout type
pub const NFS4ERR_UNKNOWN_LAYOUTTYPE: u32 = 10062;
/// NFSv4 status: no such device
pub const NFS4ERR_NOENT: u32 = 2;
/// NFSv4 status: illegal file handle
pub const NFS4ERR_BADHANDLE: u32 = 10001;

/// Errors from layout and data-server operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PnfsError {
    /// The requested layout type is not served here.
    #[error("unsupported layout type: {layout_type:#x}")]
    UnsupportedLayoutType {
        /// The rejected layout type number.
        layout_type: u32,
    },
    /// No device is registered under this id.
    #[error("unknown device id")]
    UnknownDevice,
    /// The layout being operated on is no longer current.
    #[error("stale layout")]
    StaleLayout,
    /// An overlapping segment with an incompatible io-mode is already
    /// granted to this client.
    #[error("conflicting layout io-mode for overlapping segment")]
    ConflictingLayout,
    /// No data server can serve this file.
    #[error("no data servers available")]
    NoDataServers,
    /// Malformed XDR input.
    #[error("XDR decode error: {reason}")]
    XdrDecode {
        /// What went wrong.
        reason: String,
    },
    /// Encoding failed (buffer policy violation).
    #[error("XDR encode error: {reason}")]
    XdrEncode {
        /// What went wrong.
        reason: String,
    },
    /// A plain I/O or handle error from the backend layer.
    #[error(transparent)]
    Io(#[from] FsalError),
}

impl PnfsError {
    /// Protocol status code for this error.
    pub fn status(&self) -> u32 {
        match self {
            PnfsError::UnsupportedLayoutType { .. } => NFS4ERR_UNKNOWN_LAYOUTTYPE,
            PnfsError::UnknownDevice => NFS4ERR_NOENT,
            PnfsError::StaleLayout => NFS4ERR_BADLAYOUT,
            PnfsError::ConflictingLayout => NFS4ERR_BADIOMODE,
            PnfsError::NoDataServers => NFS4ERR_LAYOUTUNAVAILABLE,
            PnfsError::XdrDecode { .. } => NFS4ERR_BADHANDLE,
            PnfsError::XdrEncode { .. } => gannetfs_fsal::error::NFS4ERR_SERVERFAULT,
            PnfsError::Io(err) => err.status(),
        }
    }

    /// True for errors that mean "re-drive the layout protocol at the
    /// MDS" rather than "the I/O itself failed".
    pub fn is_layout_protocol_error(&self) -> bool {
        matches!(
            self,
            PnfsError::UnsupportedLayoutType { .. }
                | PnfsError::UnknownDevice
                | PnfsError::StaleLayout
                | PnfsError::ConflictingLayout
                | PnfsError::NoDataServers
        )
    }
}

/// Result type alias using PnfsError as the error type.
pub type Result<T> = std::result::Result<T, PnfsError>;
