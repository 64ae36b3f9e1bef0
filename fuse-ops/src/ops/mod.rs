//! FUSE operations

mod file;
mod inode;

pub use self::file::*;
pub use self::inode::*;

use crate::decode::{DecodeError, Decoder};
use crate::encode::OutMessage;
use crate::kernel;
use crate::request::ProtocolVersion;

use std::any;
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// inode number
pub type InodeId = u64;

/// file handle
pub type HandleId = u64;

/// The inode of the mount point
pub const ROOT_INODE_ID: InodeId = kernel::FUSE_ROOT_ID;

/// A concrete operation.
///
/// Decoded from a kernel request, filled in by the filesystem, and encoded
/// into the kernel's reply by [`Op::kernel_response`].
pub trait Op: Send + 'static {
    /// The type name used to describe the operation in logs and traces
    #[inline]
    fn type_name(&self) -> &'static str {
        any::type_name::<Self>()
    }

    /// The inode the operation acts on, if it has one
    #[inline]
    fn inode(&self) -> Option<InodeId> {
        None
    }

    /// Appends the success reply body to `out`
    fn kernel_response(&self, proto: ProtocolVersion, out: &mut OutMessage);
}

/// Attributes of an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAttributes {
    /// size in bytes
    pub size: u64,
    /// number of hard links
    pub nlink: u32,
    /// file type and permission bits, as in `st_mode`
    pub mode: u32,
    /// last access
    pub atime: SystemTime,
    /// last modification
    pub mtime: SystemTime,
    /// last status change
    pub ctime: SystemTime,
    /// owner
    pub uid: u32,
    /// group
    pub gid: u32,
    /// device number
    pub rdev: u32,
}

impl Default for InodeAttributes {
    #[inline]
    fn default() -> Self {
        Self {
            size: 0,
            nlink: 0,
            mode: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            uid: 0,
            gid: 0,
            rdev: 0,
        }
    }
}

/// splits a time into seconds and nanoseconds since the epoch, clamping earlier times to it
fn split_time(time: SystemTime) -> (u64, u32) {
    let d = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    (d.as_secs(), d.subsec_nanos())
}

/// joins seconds and nanoseconds since the epoch
pub(crate) fn join_time(secs: u64, nsecs: u32) -> Result<SystemTime, DecodeError> {
    Duration::from_secs(secs)
        .checked_add(Duration::from_nanos(nsecs.into()))
        .and_then(|d| UNIX_EPOCH.checked_add(d))
        .ok_or(DecodeError::InvalidValue)
}

impl InodeAttributes {
    /// block unit of `st_blocks`
    const BLOCK_SIZE: u64 = 512;

    /// Converts into the kernel representation of `ino`
    #[must_use]
    pub fn to_raw(&self, ino: InodeId) -> kernel::fuse_attr {
        let (atime, atimensec) = split_time(self.atime);
        let (mtime, mtimensec) = split_time(self.mtime);
        let (ctime, ctimensec) = split_time(self.ctime);
        let blocks = self.size / Self::BLOCK_SIZE + u64::from(self.size % Self::BLOCK_SIZE != 0);

        kernel::fuse_attr {
            ino,
            size: self.size,
            blocks,
            atime,
            mtime,
            ctime,
            atimensec,
            mtimensec,
            ctimensec,
            mode: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: 0,
            padding: 0,
        }
    }
}

/// A child of a directory, returned by lookup and creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildInodeEntry {
    /// inode of the child
    pub child: InodeId,
    /// generation of the inode number, `(child, generation)` must be unique for the mount
    pub generation: u64,
    /// attributes of the child
    pub attributes: InodeAttributes,
    /// how long the kernel may cache `attributes`
    pub attributes_expiration: Duration,
    /// how long the kernel may cache the name
    pub entry_expiration: Duration,
}

/// appends a `fuse_entry_out`, truncated for old kernels
pub(crate) fn append_entry(entry: &ChildInodeEntry, proto: ProtocolVersion, out: &mut OutMessage) {
    let raw = kernel::fuse_entry_out {
        nodeid: entry.child,
        generation: entry.generation,
        entry_valid: entry.entry_expiration.as_secs(),
        attr_valid: entry.attributes_expiration.as_secs(),
        entry_valid_nsec: entry.entry_expiration.subsec_nanos(),
        attr_valid_nsec: entry.attributes_expiration.subsec_nanos(),
        attr: entry.attributes.to_raw(entry.child),
    };
    if proto.lt(7, 9) {
        out.append_prefix(&raw, kernel::FUSE_COMPAT_ENTRY_OUT_SIZE as usize);
    } else {
        out.append(&raw);
    }
}

/// appends a `fuse_attr_out`, truncated for old kernels
pub(crate) fn append_attr(
    ino: InodeId,
    attributes: &InodeAttributes,
    expiration: Duration,
    proto: ProtocolVersion,
    out: &mut OutMessage,
) {
    let raw = kernel::fuse_attr_out {
        attr_valid: expiration.as_secs(),
        attr_valid_nsec: expiration.subsec_nanos(),
        dummy: 0,
        attr: attributes.to_raw(ino),
    };
    if proto.lt(7, 9) {
        out.append_prefix(&raw, kernel::FUSE_COMPAT_ATTR_OUT_SIZE as usize);
    } else {
        out.append(&raw);
    }
}

/// fetches a nul-terminated file name
pub(crate) fn fetch_name(de: &mut Decoder<'_>) -> Result<OsString, DecodeError> {
    let bytes = de.fetch_c_bytes()?;
    if bytes.is_empty() {
        return Err(DecodeError::InvalidValue);
    }
    Ok(OsString::from_vec(bytes.to_vec()))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Builds request buffers

    use crate::kernel;
    use crate::request::RequestHeader;

    use std::mem;

    use aligned_bytes::AlignedBytes;

    /// A request: `fuse_in_header` followed by `body`, in an aligned buffer
    pub fn request(opcode: u32, unique: u64, nodeid: u64, body: &[u8]) -> AlignedBytes {
        let header_len = mem::size_of::<kernel::fuse_in_header>();
        let len = header_len + body.len();
        let header = kernel::fuse_in_header {
            len: len as u32,
            opcode,
            unique,
            nodeid,
            uid: 1000,
            gid: 1000,
            pid: 42,
            padding: 0,
        };

        let mut buf = AlignedBytes::new_zeroed(len, 8);
        buf[..header_len].copy_from_slice(crate::abi_marker::as_abi_bytes(&header));
        buf[header_len..].copy_from_slice(body);
        buf
    }

    /// The header of a request built by [`request`]
    pub fn header(opcode: u32, unique: u64, nodeid: u64) -> RequestHeader {
        RequestHeader {
            len: 0,
            opcode,
            unique,
            nodeid,
            uid: 1000,
            gid: 1000,
            pid: 42,
        }
    }

    /// Bytes of a FUSE ABI struct
    pub fn bytes_of<T: crate::abi_marker::FuseAbiData>(raw: &T) -> Vec<u8> {
        crate::abi_marker::as_abi_bytes(raw).to_vec()
    }

    /// Aligns a request body by itself
    pub fn body(data: &[u8]) -> AlignedBytes {
        let mut buf = AlignedBytes::new_zeroed(data.len(), 8);
        buf.copy_from_slice(data);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_to_raw() {
        let attrs = InodeAttributes {
            size: 1025,
            nlink: 1,
            mode: libc::S_IFREG | 0o644,
            mtime: UNIX_EPOCH + Duration::new(1_600_000_000, 5),
            ..InodeAttributes::default()
        };
        let raw = attrs.to_raw(7);
        assert_eq!(raw.ino, 7);
        assert_eq!(raw.blocks, 3);
        assert_eq!((raw.mtime, raw.mtimensec), (1_600_000_000, 5));
        assert_eq!((raw.atime, raw.atimensec), (0, 0));
        assert_eq!(raw.mode, libc::S_IFREG | 0o644);
    }

    #[test]
    fn blocks_round_up_without_overflow() {
        let blocks = |size| InodeAttributes { size, ..InodeAttributes::default() }.to_raw(1).blocks;
        assert_eq!(blocks(0), 0);
        assert_eq!(blocks(512), 1);
        assert_eq!(blocks(513), 2);
        assert_eq!(blocks(u64::MAX), u64::MAX / 512 + 1);
    }

    #[test]
    fn pre_epoch_time_is_clamped() {
        let attrs = InodeAttributes {
            ctime: UNIX_EPOCH - Duration::from_secs(10),
            ..InodeAttributes::default()
        };
        assert_eq!(attrs.to_raw(1).ctime, 0);
    }

    #[test]
    fn entry_is_truncated_for_old_kernels() {
        let entry = ChildInodeEntry {
            child: 3,
            ..ChildInodeEntry::default()
        };

        let mut out = OutMessage::new();
        append_entry(&entry, ProtocolVersion { major: 7, minor: 8 }, &mut out);
        assert_eq!(out.body_len(), kernel::FUSE_COMPAT_ENTRY_OUT_SIZE as usize);

        let mut out = OutMessage::new();
        append_entry(&entry, ProtocolVersion::CURRENT, &mut out);
        assert_eq!(out.body_len(), std::mem::size_of::<kernel::fuse_entry_out>());
    }

    #[test]
    fn empty_name_is_invalid() {
        let data = testing::body(b"\0");
        let mut de = Decoder::new(&*data);
        assert_eq!(fetch_name(&mut de).unwrap_err(), DecodeError::InvalidValue);
    }
}
