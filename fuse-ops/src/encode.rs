//! Encode replies for the kernel

use crate::abi_marker::{as_abi_bytes, FuseAbiData};
use crate::errno::Errno;
use crate::kernel;

use std::convert::TryFrom;
use std::mem;

use smallvec::SmallVec;

/// header length
const HEADER_LEN: usize = mem::size_of::<kernel::fuse_out_header>();

/// A reply message under construction.
///
/// The first bytes are reserved for a `fuse_out_header`, which is filled by
/// [`OutMessage::finish`] or [`OutMessage::finish_error`].
#[derive(Debug)]
pub struct OutMessage {
    /// header + body
    buf: SmallVec<[u8; 256]>,
}

impl Default for OutMessage {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl OutMessage {
    /// Creates an empty message
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        let mut buf = SmallVec::new();
        buf.resize(HEADER_LEN, 0);
        Self { buf }
    }

    /// Appends a FUSE ABI struct
    #[inline]
    pub fn append<T: FuseAbiData + Sized>(&mut self, raw: &T) {
        self.buf.extend_from_slice(as_abi_bytes(raw));
    }

    /// Appends at most `len` leading bytes of a FUSE ABI struct.
    /// Used for structs which grew in later protocol versions.
    #[inline]
    pub fn append_prefix<T: FuseAbiData + Sized>(&mut self, raw: &T, len: usize) {
        let bytes = as_abi_bytes(raw);
        let len = len.min(bytes.len());
        self.buf.extend_from_slice(&bytes[..len]);
    }

    /// Appends raw bytes
    #[inline]
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the body length
    #[must_use]
    #[inline]
    pub fn body_len(&self) -> usize {
        self.buf.len().wrapping_sub(HEADER_LEN)
    }

    /// Returns the body bytes
    #[must_use]
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.buf[HEADER_LEN..]
    }

    /// Returns true if the message length fits in its header
    #[must_use]
    #[inline]
    pub fn fits(&self) -> bool {
        u32::try_from(self.buf.len()).is_ok()
    }

    /// Writes a success header and returns the whole message
    pub fn finish(&mut self, unique: u64) -> &[u8] {
        self.write_header(unique, 0);
        &self.buf
    }

    /// Drops the body, writes an error header and returns the whole message
    pub fn finish_error(&mut self, unique: u64, errno: Errno) -> &[u8] {
        self.buf.truncate(HEADER_LEN);
        self.write_header(unique, errno.as_raw().wrapping_neg());
        &self.buf
    }

    /// fill the reserved header
    fn write_header(&mut self, unique: u64, error: i32) {
        let total_len = self.buf.len();
        let len = u32::try_from(total_len)
            .unwrap_or_else(|_| panic!("reply length overflow: total_len = {}", total_len));

        let header = kernel::fuse_out_header { len, error, unique };
        self.buf[..HEADER_LEN].copy_from_slice(as_abi_bytes(&header));
    }
}

/// Splits a reply message into its header fields and body
#[cfg(test)]
pub(crate) fn parse_reply(msg: &[u8]) -> (kernel::fuse_out_header, &[u8]) {
    assert!(msg.len() >= HEADER_LEN, "reply is shorter than its header");
    let mut header = kernel::fuse_out_header::default();
    unsafe {
        std::ptr::copy_nonoverlapping(
            msg.as_ptr(),
            <*mut kernel::fuse_out_header>::cast::<u8>(&mut header),
            HEADER_LEN,
        );
    }
    assert_eq!(header.len as usize, msg.len());
    (header, &msg[HEADER_LEN..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_header() {
        let mut msg = OutMessage::new();
        msg.append(&kernel::fuse_write_out {
            size: 42,
            padding: 0,
        });
        assert_eq!(msg.body_len(), 8);
        assert!(msg.fits());

        let (header, body) = parse_reply(msg.finish(7));
        assert_eq!(header.unique, 7);
        assert_eq!(header.error, 0);
        assert_eq!(header.len, 24);
        assert_eq!(&body[..4], &42_u32.to_ne_bytes());
    }

    #[test]
    fn error_header_drops_body() {
        let mut msg = OutMessage::new();
        msg.append_bytes(b"partial");

        let (header, body) = parse_reply(msg.finish_error(9, Errno::ENOENT));
        assert_eq!(header.unique, 9);
        assert_eq!(header.error, -libc::ENOENT);
        assert_eq!(header.len, 16);
        assert!(body.is_empty());
    }

    #[test]
    fn prefix_is_truncated() {
        let mut msg = OutMessage::new();
        let out = kernel::fuse_attr_out::default();
        msg.append_prefix(&out, kernel::FUSE_COMPAT_ATTR_OUT_SIZE as usize);
        assert_eq!(msg.body_len(), 96);

        let mut msg = OutMessage::new();
        msg.append_prefix(&out, usize::MAX);
        assert_eq!(msg.body_len(), mem::size_of::<kernel::fuse_attr_out>());
    }
}
