//! Internal unsafe marker for FUSE ABI types

use std::{mem, slice};

/// FUSE ABI types.
///
/// It is safe to transmute a `&[u8]` to `&T` where `T: FuseAbiData + Sized`,
/// and every bit pattern (including all zeros) is a valid `T`.
///
/// [`FuseAbiData`] can not be implemented for ZSTs.
pub unsafe trait FuseAbiData {}

/// Transmutes `&T` to `&[u8]` where `T: FuseAbiData + Sized`
#[inline]
pub fn as_abi_bytes<T: FuseAbiData + Sized>(raw: &T) -> &[u8] {
    let ty_size = mem::size_of::<T>();
    let base: *const u8 = <*const T>::cast(raw);
    unsafe { slice::from_raw_parts(base, ty_size) }
}

macro_rules! mark_abi_type {
    ($ty: ty) => {
        unsafe impl FuseAbiData for $ty {}
    };
}

macro_rules! mark_sized_types {
    (@kernel $($ty:ident,)+) => {
        $(
            mark_abi_type!(crate::kernel::$ty);
        )+

        #[test]
        fn size_check() {
            $(
                assert!(mem::size_of::<crate::kernel::$ty>() > 0); // ZST makes no sense
            )+
            $(
                assert!(mem::size_of::<crate::kernel::$ty>() <= 256); // detect large types
            )+
        }
    };

    (@primitive $($ty:ty,)+) => {
        $(
            mark_abi_type!($ty);
        )+
    }
}

mark_sized_types!(@primitive
    u8,
    u16,
    u32,
    u64,
    i32,
    i64,
);

mark_sized_types!(@kernel
    fuse_attr,
    fuse_kstatfs,
    fuse_entry_out,
    fuse_getattr_in,
    fuse_attr_out,
    fuse_mkdir_in,
    fuse_setattr_in,
    fuse_open_in,
    fuse_open_out,
    fuse_release_in,
    fuse_flush_in,
    fuse_read_in,
    fuse_write_in,
    fuse_write_out,
    fuse_statfs_out,
    fuse_init_in,
    fuse_init_out,
    fuse_interrupt_in,
    fuse_in_header,
    fuse_out_header,
);

#[cfg(test)]
mod tests {
    use crate::kernel;

    use std::mem;

    #[test]
    fn compat_sizes_are_prefixes() {
        let compat = [
            (kernel::FUSE_COMPAT_ATTR_OUT_SIZE, mem::size_of::<kernel::fuse_attr_out>()),
            (kernel::FUSE_COMPAT_ENTRY_OUT_SIZE, mem::size_of::<kernel::fuse_entry_out>()),
            (kernel::FUSE_COMPAT_STATFS_SIZE, mem::size_of::<kernel::fuse_statfs_out>()),
            (kernel::FUSE_COMPAT_READ_IN_SIZE, mem::size_of::<kernel::fuse_read_in>()),
            (kernel::FUSE_COMPAT_WRITE_IN_SIZE, mem::size_of::<kernel::fuse_write_in>()),
            (kernel::FUSE_COMPAT_22_INIT_OUT_SIZE, mem::size_of::<kernel::fuse_init_out>()),
        ];
        for &(compat_size, full_size) in &compat {
            assert!((compat_size as usize) < full_size);
        }
        assert_eq!(mem::size_of::<kernel::fuse_out_header>(), 16);
        assert_eq!(mem::size_of::<kernel::fuse_in_header>(), 40);
    }
}
