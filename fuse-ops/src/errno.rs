//! Kernel error numbers

use std::fmt::{self, Display};
use std::io;

/// An error number which is sent to the kernel in a reply header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl Errno {
    /// Wraps a raw error number
    #[must_use]
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw error number
    #[must_use]
    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

macro_rules! errno_consts {
    ($($name:ident,)+) => {
        impl Errno {
            $(
                #[allow(missing_docs)]
                pub const $name: Self = Self(libc::$name);
            )+
        }
    };
}

errno_consts!(
    EPERM,
    ENOENT,
    EINTR,
    EIO,
    EBADF,
    EACCES,
    EEXIST,
    ENOTDIR,
    EISDIR,
    EINVAL,
    ENOSPC,
    EROFS,
    ENAMETOOLONG,
    ENOSYS,
    ENOTEMPTY,
    EPROTO,
);

impl Display for Errno {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // strips the " (os error N)" suffix
        let err = io::Error::from_raw_os_error(self.0).to_string();
        match err.rfind(" (os error") {
            Some(pos) => f.write_str(&err[..pos]),
            None => f.write_str(&err),
        }
    }
}

impl From<Errno> for io::Error {
    #[inline]
    fn from(errno: Errno) -> Self {
        Self::from_raw_os_error(errno.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_os_text() {
        assert_eq!(Errno::ENOENT.to_string(), "No such file or directory");
        assert_eq!(Errno::ENOENT.as_raw(), libc::ENOENT);
    }
}
