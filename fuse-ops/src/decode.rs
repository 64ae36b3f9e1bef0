//! Decode FUSE ABI types from bytes

use crate::abi_marker::FuseAbiData;
use crate::request::{ProtocolVersion, RequestHeader};

use std::mem::{self, MaybeUninit};
use std::{ptr, slice};

use memchr::memchr;

/// Decode FUSE ABI types from bytes
#[derive(Debug)]
pub struct Decoder<'b> {
    /// buffer
    bytes: &'b [u8],
}

/// The error returned by [`Decoder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Expected more data
    #[error("NotEnough")]
    NotEnough,

    /// Data is more than expected
    #[error("TooMuchData")]
    TooMuchData,

    /// Pointer's alignment mismatched with the target type
    #[error("AlignMismatch")]
    AlignMismatch,

    /// The value of the target type is invalid
    #[error("InvalidValue")]
    InvalidValue,
}

/// Operations which can be decoded from the body of a request
pub(crate) trait Decode: Sized {
    /// Decodes Self from the bytes following `header`
    fn decode(
        header: &RequestHeader,
        proto: ProtocolVersion,
        de: &mut Decoder<'_>,
    ) -> Result<Self, DecodeError>;
}

#[allow(clippy::as_conversions)]
fn to_address<T: ?Sized>(ptr: *const T) -> usize {
    ptr as *const () as usize
}

impl<'b> Decoder<'b> {
    /// Creates a [`Decoder`]
    #[inline]
    #[must_use]
    pub const fn new(bytes: &'b [u8]) -> Self {
        Self { bytes }
    }

    /// Returns true if the decoder has no data
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// pop some bytes without length checking
    unsafe fn pop_bytes_unchecked(&mut self, len: usize) -> &'b [u8] {
        let bytes = self.bytes.get_unchecked(..len);
        self.bytes = self.bytes.get_unchecked(len..);
        bytes
    }

    /// Fetches a reference to T
    pub(crate) fn fetch<T: FuseAbiData + Sized>(&mut self) -> Result<&'b T, DecodeError> {
        let ty_size: usize = mem::size_of::<T>();
        let ty_align: usize = mem::align_of::<T>();
        debug_assert!(ty_size > 0 && ty_size.wrapping_rem(ty_align) == 0);

        if self.bytes.len() < ty_size {
            return Err(DecodeError::NotEnough);
        }

        let addr = to_address(self.bytes);
        if addr.wrapping_rem(ty_align) != 0 {
            return Err(DecodeError::AlignMismatch);
        }

        unsafe {
            let bytes = self.pop_bytes_unchecked(ty_size);
            let ret = &*(bytes.as_ptr().cast());
            Ok(ret)
        }
    }

    /// Fetches the first `len` bytes of T, which is the layout of T in older
    /// protocol versions. The missing tail is zeroed.
    pub(crate) fn fetch_compat<T: FuseAbiData + Sized>(
        &mut self,
        len: usize,
    ) -> Result<T, DecodeError> {
        let ty_size: usize = mem::size_of::<T>();
        assert!(len <= ty_size, "compat size {} exceeds {}", len, ty_size);

        if self.bytes.len() < len {
            return Err(DecodeError::NotEnough);
        }

        unsafe {
            let bytes = self.pop_bytes_unchecked(len);
            let mut raw = MaybeUninit::<T>::zeroed();
            ptr::copy_nonoverlapping(bytes.as_ptr(), raw.as_mut_ptr().cast::<u8>(), len);
            Ok(raw.assume_init())
        }
    }

    /// Fetches all bytes
    pub(crate) fn fetch_all_bytes(&mut self) -> &'b [u8] {
        unsafe {
            let bytes = self.bytes;
            self.bytes = slice::from_raw_parts(self.bytes.as_ptr(), 0);
            bytes
        }
    }

    /// Fetches nul-terminated bytes, returns them without the nul
    pub(crate) fn fetch_c_bytes(&mut self) -> Result<&'b [u8], DecodeError> {
        let idx = memchr(0, self.bytes).ok_or(DecodeError::NotEnough)?;
        let len = idx.wrapping_add(1);
        assert!(len <= self.bytes.len());

        unsafe {
            let bytes = self.pop_bytes_unchecked(len);
            Ok(bytes.get_unchecked(..idx))
        }
    }

    /// # Errors
    /// Returns `DecodeError::TooMuchData` if the data is not completely consumed
    pub(crate) fn all_consuming<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<T, DecodeError> {
        let ret = f(self)?;
        if !self.is_empty() {
            return Err(DecodeError::TooMuchData);
        }
        Ok(ret)
    }
}
