//! Operations on inodes and directory entries

use super::{append_attr, append_entry, fetch_name, join_time};
use super::{ChildInodeEntry, HandleId, InodeAttributes, InodeId, Op};

use crate::decode::{Decode, DecodeError, Decoder};
use crate::encode::OutMessage;
use crate::kernel;
use crate::request::{ProtocolVersion, RequestHeader};

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime};

/// Looks up a child by name and returns its attributes
#[derive(Debug)]
pub struct LookUpInodeOp {
    /// the directory
    pub parent: InodeId,
    /// name of the child
    pub name: OsString,

    /// filled by the filesystem
    pub entry: ChildInodeEntry,
}

impl Decode for LookUpInodeOp {
    fn decode(
        header: &RequestHeader,
        _: ProtocolVersion,
        de: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError> {
        let name = de.all_consuming(fetch_name)?;
        Ok(Self {
            parent: header.nodeid,
            name,
            entry: ChildInodeEntry::default(),
        })
    }
}

impl Op for LookUpInodeOp {
    fn kernel_response(&self, proto: ProtocolVersion, out: &mut OutMessage) {
        append_entry(&self.entry, proto, out)
    }
}

/// Refreshes the attributes of an inode
#[derive(Debug)]
pub struct GetInodeAttributesOp {
    /// the inode
    pub inode: InodeId,
    /// set if the kernel asks through an open file
    pub handle: Option<HandleId>,

    /// filled by the filesystem
    pub attributes: InodeAttributes,
    /// how long the kernel may cache `attributes`
    pub attributes_expiration: Duration,
}

impl Decode for GetInodeAttributesOp {
    fn decode(
        header: &RequestHeader,
        proto: ProtocolVersion,
        de: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError> {
        // the body is added in 7.9
        let handle = if proto.lt(7, 9) {
            None
        } else {
            let arg: &kernel::fuse_getattr_in = de.fetch()?;
            if arg.getattr_flags & kernel::FUSE_GETATTR_FH != 0 {
                Some(arg.fh)
            } else {
                None
            }
        };
        Ok(Self {
            inode: header.nodeid,
            handle,
            attributes: InodeAttributes::default(),
            attributes_expiration: Duration::default(),
        })
    }
}

impl Op for GetInodeAttributesOp {
    #[inline]
    fn inode(&self) -> Option<InodeId> {
        Some(self.inode)
    }

    fn kernel_response(&self, proto: ProtocolVersion, out: &mut OutMessage) {
        append_attr(
            self.inode,
            &self.attributes,
            self.attributes_expiration,
            proto,
            out,
        )
    }
}

/// Changes some attributes of an inode. `None` fields are left unchanged.
#[derive(Debug)]
pub struct SetInodeAttributesOp {
    /// the inode
    pub inode: InodeId,
    /// set if the change is made through an open file
    pub handle: Option<HandleId>,
    /// new size
    pub size: Option<u64>,
    /// new permission bits
    pub mode: Option<u32>,
    /// new owner
    pub uid: Option<u32>,
    /// new group
    pub gid: Option<u32>,
    /// new access time
    pub atime: Option<SystemTime>,
    /// new modification time
    pub mtime: Option<SystemTime>,

    /// the attributes after the change, filled by the filesystem
    pub attributes: InodeAttributes,
    /// how long the kernel may cache `attributes`
    pub attributes_expiration: Duration,
}

/// returns `Some(value)` if `bit` is set in `valid`
fn field<T>(valid: u32, bit: u32, value: T) -> Option<T> {
    if valid & bit != 0 {
        Some(value)
    } else {
        None
    }
}

impl Decode for SetInodeAttributesOp {
    fn decode(
        header: &RequestHeader,
        _: ProtocolVersion,
        de: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError> {
        let arg: &kernel::fuse_setattr_in = de.fetch()?;
        let valid = arg.valid;

        let atime = if valid & kernel::FATTR_ATIME_NOW != 0 {
            Some(SystemTime::now())
        } else if valid & kernel::FATTR_ATIME != 0 {
            Some(join_time(arg.atime, arg.atimensec)?)
        } else {
            None
        };
        let mtime = if valid & kernel::FATTR_MTIME_NOW != 0 {
            Some(SystemTime::now())
        } else if valid & kernel::FATTR_MTIME != 0 {
            Some(join_time(arg.mtime, arg.mtimensec)?)
        } else {
            None
        };

        Ok(Self {
            inode: header.nodeid,
            handle: field(valid, kernel::FATTR_FH, arg.fh),
            size: field(valid, kernel::FATTR_SIZE, arg.size),
            mode: field(valid, kernel::FATTR_MODE, arg.mode),
            uid: field(valid, kernel::FATTR_UID, arg.uid),
            gid: field(valid, kernel::FATTR_GID, arg.gid),
            atime,
            mtime,
            attributes: InodeAttributes::default(),
            attributes_expiration: Duration::default(),
        })
    }
}

impl Op for SetInodeAttributesOp {
    #[inline]
    fn inode(&self) -> Option<InodeId> {
        Some(self.inode)
    }

    fn kernel_response(&self, proto: ProtocolVersion, out: &mut OutMessage) {
        append_attr(
            self.inode,
            &self.attributes,
            self.attributes_expiration,
            proto,
            out,
        )
    }
}

/// Creates a directory
#[derive(Debug)]
pub struct MkDirOp {
    /// the parent directory
    pub parent: InodeId,
    /// name of the new directory
    pub name: OsString,
    /// permission bits, with the umask of the caller applied by the kernel
    pub mode: u32,

    /// the new directory, filled by the filesystem
    pub entry: ChildInodeEntry,
}

impl Decode for MkDirOp {
    fn decode(
        header: &RequestHeader,
        _: ProtocolVersion,
        de: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError> {
        let arg: &kernel::fuse_mkdir_in = de.fetch()?;
        let name = de.all_consuming(fetch_name)?;
        Ok(Self {
            parent: header.nodeid,
            name,
            mode: arg.mode,
            entry: ChildInodeEntry::default(),
        })
    }
}

impl Op for MkDirOp {
    fn kernel_response(&self, proto: ProtocolVersion, out: &mut OutMessage) {
        append_entry(&self.entry, proto, out)
    }
}

/// Removes a non-directory entry
#[derive(Debug)]
pub struct UnlinkOp {
    /// the parent directory
    pub parent: InodeId,
    /// name of the entry
    pub name: OsString,
}

/// Removes an empty directory
#[derive(Debug)]
pub struct RmDirOp {
    /// the parent directory
    pub parent: InodeId,
    /// name of the directory
    pub name: OsString,
}

macro_rules! impl_remove_op {
    ($($op:ident,)+) => {$(
        impl Decode for $op {
            fn decode(
                header: &RequestHeader,
                _: ProtocolVersion,
                de: &mut Decoder<'_>,
            ) -> Result<Self, DecodeError> {
                let name = de.all_consuming(fetch_name)?;
                Ok(Self {
                    parent: header.nodeid,
                    name,
                })
            }
        }

        impl Op for $op {
            #[inline]
            fn kernel_response(&self, _: ProtocolVersion, _: &mut OutMessage) {}
        }
    )+};
}

impl_remove_op!(UnlinkOp, RmDirOp,);

/// Reads the target of a symbolic link
#[derive(Debug)]
pub struct ReadSymlinkOp {
    /// the link
    pub inode: InodeId,

    /// filled by the filesystem
    pub target: OsString,
}

impl Decode for ReadSymlinkOp {
    fn decode(
        header: &RequestHeader,
        _: ProtocolVersion,
        _: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError> {
        Ok(Self {
            inode: header.nodeid,
            target: OsString::new(),
        })
    }
}

impl Op for ReadSymlinkOp {
    #[inline]
    fn inode(&self) -> Option<InodeId> {
        Some(self.inode)
    }

    fn kernel_response(&self, _: ProtocolVersion, out: &mut OutMessage) {
        out.append_bytes(self.target.as_bytes())
    }
}
