//! The kernel side of a FUSE request

use crate::kernel;

/// protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// major version number
    pub major: u32,
    /// minor version number
    pub minor: u32,
}

impl ProtocolVersion {
    /// The version implemented by this crate
    pub const CURRENT: Self = Self {
        major: kernel::FUSE_KERNEL_VERSION,
        minor: kernel::FUSE_KERNEL_MINOR_VERSION,
    };

    /// Returns true if `self` is older than `major.minor`
    #[must_use]
    #[inline]
    pub const fn lt(self, major: u32, minor: u32) -> bool {
        self.major < major || (self.major == major && self.minor < minor)
    }
}

/// The request header assigned by the kernel.
///
/// An envelope keeps it until the reply is sent; `unique` correlates the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// length of the request, header included
    pub len: u32,
    /// `fuse_opcode`
    pub opcode: u32,
    /// request id
    pub unique: u64,
    /// the inode the request acts on
    pub nodeid: u64,
    /// uid of the calling process
    pub uid: u32,
    /// gid of the calling process
    pub gid: u32,
    /// pid of the calling process
    pub pid: u32,
}

impl RequestHeader {
    /// copies the fields of a raw header
    pub(crate) const fn from_raw(raw: &kernel::fuse_in_header) -> Self {
        Self {
            len: raw.len,
            opcode: raw.opcode,
            unique: raw.unique,
            nodeid: raw.nodeid,
            uid: raw.uid,
            gid: raw.gid,
            pid: raw.pid,
        }
    }
}
