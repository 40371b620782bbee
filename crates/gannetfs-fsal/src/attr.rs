//! Object types, filesystem identities, and the attribute set

use serde::{Deserialize, Serialize};

/// Identity of one underlying filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FsId {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
}

impl FsId {
    /// Builds an FsId from its two components.
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }
}

/// Filesystem object type. All seven POSIX types are representable; a
/// backend that cannot host some of them simply never produces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Block device node
    BlockDevice,
    /// Character device node
    CharDevice,
    /// Unix-domain socket
    Socket,
    /// Named pipe
    Fifo,
}

impl ObjectType {
    /// True for regular files, the only type DS I/O applies to.
    pub fn is_regular(&self) -> bool {
        matches!(self, ObjectType::Regular)
    }
}

/// Seconds + nanoseconds timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timespec {
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Nanoseconds within the second.
    pub nanoseconds: u32,
}

impl Timespec {
    /// Builds a timestamp.
    pub fn new(seconds: i64, nanoseconds: u32) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => Self::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(_) => Self::default(),
        }
    }

    /// Strictly-later comparison. A commit may only advance time, never
    /// regress it, so equality does not count as later.
    pub fn is_later_than(&self, other: &Timespec) -> bool {
        (self.seconds, self.nanoseconds) > (other.seconds, other.nanoseconds)
    }
}

/// The attribute set an object handle can report.
///
/// `create_handle_from_host` must be able to fill at least `object_type`,
/// `fileid`, and `fsid`; handle creation fails as a whole otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    /// Object type.
    pub object_type: ObjectType,
    /// File id, unique within the filesystem.
    pub fileid: u64,
    /// Owning filesystem identity.
    pub fsid: FsId,
    /// Size in bytes.
    pub size: u64,
    /// Bytes of backing storage consumed.
    pub space_used: u64,
    /// Permission bits.
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Hard-link count.
    pub numlinks: u32,
    /// Last modification time.
    pub mtime: Timespec,
    /// Last status-change time.
    pub ctime: Timespec,
}

impl Attributes {
    /// A minimal attribute set for a fresh object.
    pub fn new(object_type: ObjectType, fileid: u64, fsid: FsId) -> Self {
        let now = Timespec::now();
        Self {
            object_type,
            fileid,
            fsid,
            size: 0,
            space_used: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            numlinks: 1,
            mtime: now,
            ctime: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timespec_later_by_seconds() {
        let a = Timespec::new(10, 0);
        let b = Timespec::new(9, 999_999_999);
        assert!(a.is_later_than(&b));
        assert!(!b.is_later_than(&a));
    }

    #[test]
    fn test_timespec_later_by_nanoseconds() {
        let a = Timespec::new(10, 500);
        let b = Timespec::new(10, 499);
        assert!(a.is_later_than(&b));
    }

    #[test]
    fn test_timespec_equal_is_not_later() {
        let a = Timespec::new(10, 500);
        assert!(!a.is_later_than(&a));
    }

    #[test]
    fn test_object_type_is_regular() {
        assert!(ObjectType::Regular.is_regular());
        assert!(!ObjectType::Directory.is_regular());
        assert!(!ObjectType::Symlink.is_regular());
        assert!(!ObjectType::Fifo.is_regular());
    }

    #[test]
    fn test_attributes_new_defaults() {
        let attrs = Attributes::new(ObjectType::Regular, 42, FsId::new(1, 2));
        assert_eq!(attrs.fileid, 42);
        assert_eq!(attrs.fsid, FsId::new(1, 2));
        assert_eq!(attrs.size, 0);
        assert_eq!(attrs.numlinks, 1);
    }
}
