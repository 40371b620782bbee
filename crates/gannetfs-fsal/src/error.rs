//! Error taxonomy and the canonical errno translation table
//!
//! Every backend reports failures through one [`FsalError`]: a single
//! error kind plus the originating POSIX errno when there is one. All
//! backends translate errno through the same table so that two backends
//! hitting the same underlying condition produce the same protocol-level
//! error.

use std::fmt;

use thiserror::Error;

/// NFSv4 status: OK (success)
pub const NFS4_OK: u32 = 0;
/// NFSv4 status: permission denied
pub const NFS4ERR_ACCESS: u32 = 13;
/// NFSv4 status: file exists
pub const NFS4ERR_EXIST: u32 = 17;
/// NFSv4 status: no such file or directory
pub const NFS4ERR_NOENT: u32 = 2;
/// NFSv4 status: I/O error
pub const NFS4ERR_IO: u32 = 5;
/// NFSv4 status: not a directory
pub const NFS4ERR_NOTDIR: u32 = 20;
/// NFSv4 status: is a directory
pub const NFS4ERR_ISDIR: u32 = 21;
/// NFS4 status: invalid argument
pub const NFS4ERR_INVAL: u32 = 22;
/// NFSv4 status: file too large
pub const NFS4ERR_FBIG: u32 = 27;
/// NFSv4 status: no space left on device
pub const NFS4ERR_NOSPC: u32 = 28;
/// NFSv4 status: read-only filesystem
pub const NFS4ERR_ROFS: u32 = 30;
/// NFSv4 status: quota hard limit reached
pub const NFS4ERR_DQUOT: u32 = 69;
/// NFSv4 status: stale file handle
pub const NFS4ERR_STALE: u32 = 70;
/// NFSv4 status: illegal file handle
pub const NFS4ERR_BADHANDLE: u32 = 10001;
/// NFSv4 status: operation not supported
pub const NFS4ERR_NOTSUPP: u32 = 10004;
/// NFSv4 status: server fault
pub const NFS4ERR_SERVERFAULT: u32 = 10006;
/// NFSv4 status: slow down / retry later
pub const NFS4ERR_DELAY: u32 = 10008;
/// NFSv4 status: layout type not supported by server
pub const NFS4ERR_UNKNOWN_LAYOUTTYPE: u32 = 10062;

/// The one error kind attached to every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation is meaningless for this backend.
    NotSupported,
    /// Object is no longer resolvable from its handle.
    StaleHandle,
    /// Malformed wire input.
    BadHandle,
    /// Caller lacks permission.
    AccessDenied,
    /// Conflicting create.
    Exists,
    /// Object does not exist.
    NotFound,
    /// Directory operation applied to a directory target.
    IsDirectory,
    /// Directory operation applied to a non-directory.
    NotDirectory,
    /// Backend is out of space.
    NoSpace,
    /// Quota hard limit reached.
    QuotaExceeded,
    /// Object would exceed the backend's size limit.
    FileTooBig,
    /// Filesystem is read-only.
    ReadOnly,
    /// Transient condition; the caller may retry with backoff.
    RetryLater,
    /// Internal inconsistency. Always logged, never silently swallowed.
    ServerFault,
    /// Caller-supplied argument is invalid.
    InvalidArgument,
    /// Requested pNFS layout type is not supported.
    UnsupportedLayoutType,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotSupported => "operation not supported",
            ErrorKind::StaleHandle => "stale file handle",
            ErrorKind::BadHandle => "malformed file handle",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::Exists => "object exists",
            ErrorKind::NotFound => "no such object",
            ErrorKind::IsDirectory => "is a directory",
            ErrorKind::NotDirectory => "not a directory",
            ErrorKind::NoSpace => "no space left on device",
            ErrorKind::QuotaExceeded => "quota exceeded",
            ErrorKind::FileTooBig => "file too large",
            ErrorKind::ReadOnly => "read-only filesystem",
            ErrorKind::RetryLater => "temporarily unavailable, retry later",
            ErrorKind::ServerFault => "server fault",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::UnsupportedLayoutType => "unsupported layout type",
        };
        f.write_str(s)
    }
}

/// One failure: a kind plus the backend detail errno that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}")]
pub struct FsalError {
    /// Protocol-level classification.
    pub kind: ErrorKind,
    /// Originating POSIX errno, when the failure came from the OS or a
    /// backend library that reports errno.
    pub errno: Option<i32>,
}

impl FsalError {
    /// An error with no errno detail.
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, errno: None }
    }

    /// Translates a POSIX errno through the canonical table, keeping the
    /// errno as the detail code.
    pub fn from_errno(errno: i32) -> Self {
        Self {
            kind: posix_to_kind(errno),
            errno: Some(errno),
        }
    }

    /// A server fault. The inconsistency is logged here so no caller can
    /// swallow it silently.
    pub fn server_fault(detail: &str) -> Self {
        tracing::error!(detail, "server fault");
        Self::new(ErrorKind::ServerFault)
    }

    /// Protocol status code for this error.
    pub fn status(&self) -> u32 {
        match self.kind {
            ErrorKind::NotSupported => NFS4ERR_NOTSUPP,
            ErrorKind::StaleHandle => NFS4ERR_STALE,
            ErrorKind::BadHandle => NFS4ERR_BADHANDLE,
            ErrorKind::AccessDenied => NFS4ERR_ACCESS,
            ErrorKind::Exists => NFS4ERR_EXIST,
            ErrorKind::NotFound => NFS4ERR_NOENT,
            ErrorKind::IsDirectory => NFS4ERR_ISDIR,
            ErrorKind::NotDirectory => NFS4ERR_NOTDIR,
            ErrorKind::NoSpace => NFS4ERR_NOSPC,
            ErrorKind::QuotaExceeded => NFS4ERR_DQUOT,
            ErrorKind::FileTooBig => NFS4ERR_FBIG,
            ErrorKind::ReadOnly => NFS4ERR_ROFS,
            ErrorKind::RetryLater => NFS4ERR_DELAY,
            ErrorKind::ServerFault => NFS4ERR_SERVERFAULT,
            ErrorKind::InvalidArgument => NFS4ERR_INVAL,
            ErrorKind::UnsupportedLayoutType => NFS4ERR_UNKNOWN_LAYOUTTYPE,
        }
    }

    /// True only for the single kind a caller may retry automatically
    /// (with backoff).
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::RetryLater
    }
}

impl From<std::io::Error> for FsalError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => FsalError::from_errno(errno),
            None => FsalError::server_fault("I/O error without errno"),
        }
    }
}

/// The canonical POSIX-errno-to-kind translation table.
///
/// Used by every backend so the same underlying condition always maps to
/// the same protocol error. An errno with no sensible protocol mapping
/// becomes a server fault.
pub fn posix_to_kind(errno: i32) -> ErrorKind {
    match errno {
        libc::EPERM | libc::EACCES => ErrorKind::AccessDenied,
        libc::ENOENT => ErrorKind::NotFound,
        libc::ESTALE => ErrorKind::StaleHandle,
        libc::EEXIST => ErrorKind::Exists,
        libc::EISDIR => ErrorKind::IsDirectory,
        libc::ENOTDIR => ErrorKind::NotDirectory,
        libc::ENOSPC => ErrorKind::NoSpace,
        libc::EDQUOT => ErrorKind::QuotaExceeded,
        libc::EFBIG => ErrorKind::FileTooBig,
        libc::EROFS => ErrorKind::ReadOnly,
        libc::EAGAIN | libc::EBUSY | libc::ETIMEDOUT => ErrorKind::RetryLater,
        libc::EINVAL | libc::ENAMETOOLONG => ErrorKind::InvalidArgument,
        libc::ENOTSUP | libc::ENOSYS => ErrorKind::NotSupported,
        libc::EBADF | libc::EFAULT => ErrorKind::ServerFault,
        libc::EIO => ErrorKind::ServerFault,
        _ => ErrorKind::ServerFault,
    }
}

/// Result type alias using FsalError as the error type.
pub type Result<T> = std::result::Result<T, FsalError>;
