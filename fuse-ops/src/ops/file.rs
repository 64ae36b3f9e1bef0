//! Operations on open files and on the filesystem

use super::{HandleId, InodeId, Op};

use crate::decode::{Decode, DecodeError, Decoder};
use crate::encode::OutMessage;
use crate::kernel;
use crate::request::{ProtocolVersion, RequestHeader};

use std::convert::TryFrom;

/// Opens a file
#[derive(Debug)]
pub struct OpenFileOp {
    /// the file
    pub inode: InodeId,
    /// flags passed to `open(2)`
    pub flags: u32,

    /// the new handle, filled by the filesystem
    pub handle: HandleId,
    /// keep the page cache of the file
    pub keep_page_cache: bool,
    /// bypass the page cache for this handle
    pub use_direct_io: bool,
}

impl Decode for OpenFileOp {
    fn decode(
        header: &RequestHeader,
        _: ProtocolVersion,
        de: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError> {
        let arg: &kernel::fuse_open_in = de.fetch()?;
        Ok(Self {
            inode: header.nodeid,
            flags: arg.flags,
            handle: 0,
            keep_page_cache: false,
            use_direct_io: false,
        })
    }
}

impl Op for OpenFileOp {
    #[inline]
    fn inode(&self) -> Option<InodeId> {
        Some(self.inode)
    }

    fn kernel_response(&self, _: ProtocolVersion, out: &mut OutMessage) {
        let mut open_flags = 0;
        if self.keep_page_cache {
            open_flags |= kernel::FOPEN_KEEP_CACHE;
        }
        if self.use_direct_io {
            open_flags |= kernel::FOPEN_DIRECT_IO;
        }
        out.append(&kernel::fuse_open_out {
            fh: self.handle,
            open_flags,
            padding: 0,
        })
    }
}

/// Reads data from an open file
#[derive(Debug)]
pub struct ReadFileOp {
    /// the file
    pub inode: InodeId,
    /// the handle returned by open
    pub handle: HandleId,
    /// offset to read from
    pub offset: u64,
    /// maximum number of bytes to return
    pub size: u32,

    /// filled by the filesystem, a short read means end of file
    pub data: Vec<u8>,
}

impl Decode for ReadFileOp {
    fn decode(
        header: &RequestHeader,
        proto: ProtocolVersion,
        de: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError> {
        let arg: kernel::fuse_read_in = if proto.lt(7, 9) {
            de.fetch_compat(kernel::FUSE_COMPAT_READ_IN_SIZE as usize)?
        } else {
            *de.fetch::<kernel::fuse_read_in>()?
        };
        Ok(Self {
            inode: header.nodeid,
            handle: arg.fh,
            offset: arg.offset,
            size: arg.size,
            data: Vec::new(),
        })
    }
}

impl Op for ReadFileOp {
    #[inline]
    fn inode(&self) -> Option<InodeId> {
        Some(self.inode)
    }

    fn kernel_response(&self, _: ProtocolVersion, out: &mut OutMessage) {
        let len = usize::try_from(self.size).unwrap_or(usize::MAX);
        let data = self.data.get(..len).unwrap_or(&self.data[..]);
        out.append_bytes(data)
    }
}

/// Writes data to an open file. A successful reply reports the whole
/// buffer as written.
#[derive(Debug)]
pub struct WriteFileOp {
    /// the file
    pub inode: InodeId,
    /// the handle returned by open
    pub handle: HandleId,
    /// offset to write at
    pub offset: u64,
    /// the data to write
    pub data: Vec<u8>,
}

impl Decode for WriteFileOp {
    fn decode(
        header: &RequestHeader,
        proto: ProtocolVersion,
        de: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError> {
        let arg: kernel::fuse_write_in = if proto.lt(7, 9) {
            de.fetch_compat(kernel::FUSE_COMPAT_WRITE_IN_SIZE as usize)?
        } else {
            *de.fetch::<kernel::fuse_write_in>()?
        };
        let data = de.fetch_all_bytes();
        let size = usize::try_from(arg.size).map_err(|_| DecodeError::InvalidValue)?;
        let data = data.get(..size).ok_or(DecodeError::NotEnough)?;
        Ok(Self {
            inode: header.nodeid,
            handle: arg.fh,
            offset: arg.offset,
            data: data.to_vec(),
        })
    }
}

impl Op for WriteFileOp {
    #[inline]
    fn inode(&self) -> Option<InodeId> {
        Some(self.inode)
    }

    fn kernel_response(&self, _: ProtocolVersion, out: &mut OutMessage) {
        let size = u32::try_from(self.data.len()).unwrap_or(u32::MAX);
        out.append(&kernel::fuse_write_out { size, padding: 0 })
    }
}

/// Called on every `close(2)` of a file descriptor
#[derive(Debug)]
pub struct FlushFileOp {
    /// the file
    pub inode: InodeId,
    /// the handle returned by open
    pub handle: HandleId,
    /// identifies the closing process for lock release
    pub lock_owner: u64,
}

impl Decode for FlushFileOp {
    fn decode(
        header: &RequestHeader,
        _: ProtocolVersion,
        de: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError> {
        let arg: &kernel::fuse_flush_in = de.fetch()?;
        Ok(Self {
            inode: header.nodeid,
            handle: arg.fh,
            lock_owner: arg.lock_owner,
        })
    }
}

impl Op for FlushFileOp {
    #[inline]
    fn inode(&self) -> Option<InodeId> {
        Some(self.inode)
    }

    #[inline]
    fn kernel_response(&self, _: ProtocolVersion, _: &mut OutMessage) {}
}

/// Releases a handle after the last reference to it is gone
#[derive(Debug)]
pub struct ReleaseFileHandleOp {
    /// the handle returned by open
    pub handle: HandleId,
    /// flags the file was opened with
    pub flags: u32,
}

impl Decode for ReleaseFileHandleOp {
    fn decode(
        _: &RequestHeader,
        _: ProtocolVersion,
        de: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError> {
        let arg: &kernel::fuse_release_in = de.fetch()?;
        Ok(Self {
            handle: arg.fh,
            flags: arg.flags,
        })
    }
}

impl Op for ReleaseFileHandleOp {
    #[inline]
    fn kernel_response(&self, _: ProtocolVersion, _: &mut OutMessage) {}
}

/// Reports filesystem statistics
#[derive(Debug, Default)]
pub struct StatFsOp {
    /// block size in bytes
    pub block_size: u32,
    /// total blocks
    pub blocks: u64,
    /// free blocks
    pub blocks_free: u64,
    /// free blocks for unprivileged users
    pub blocks_available: u64,
    /// total inodes
    pub inodes: u64,
    /// free inodes
    pub inodes_free: u64,
}

impl StatFsOp {
    /// longest file name reported
    const NAME_LEN: u32 = 255;
}

impl Decode for StatFsOp {
    fn decode(
        _: &RequestHeader,
        _: ProtocolVersion,
        _: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError> {
        Ok(Self::default())
    }
}

impl Op for StatFsOp {
    fn kernel_response(&self, proto: ProtocolVersion, out: &mut OutMessage) {
        let raw = kernel::fuse_statfs_out {
            st: kernel::fuse_kstatfs {
                blocks: self.blocks,
                bfree: self.blocks_free,
                bavail: self.blocks_available,
                files: self.inodes,
                ffree: self.inodes_free,
                bsize: self.block_size,
                namelen: Self::NAME_LEN,
                frsize: self.block_size,
                ..kernel::fuse_kstatfs::default()
            },
        };
        if proto.lt(7, 4) {
            out.append_prefix(&raw, kernel::FUSE_COMPAT_STATFS_SIZE as usize);
        } else {
            out.append(&raw);
        }
    }
}
