//! Errors of the response path

use crate::context::ContextError;
use crate::errno::Errno;

use std::error::Error as StdError;
use std::io;

use tracing_error::SpanTrace;

/// The error a filesystem responds with.
///
/// Only [`OpError::errno`] reaches the kernel, the rest is diagnostics.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OpError {
    /// An explicit error number
    #[error("{0}")]
    Errno(Errno),

    /// An I/O error from the underlying storage
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The operation observed its context being done
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Any other failure, reported as `EIO`
    #[error(transparent)]
    Other(Box<dyn StdError + Send + Sync + 'static>),
}

impl From<Errno> for OpError {
    #[inline]
    fn from(errno: Errno) -> Self {
        Self::Errno(errno)
    }
}

impl OpError {
    /// Wraps any error, which is reported to the kernel as `EIO`
    #[inline]
    pub fn other<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Other(Box::new(err))
    }

    /// Translates the error into the kernel's error number
    #[must_use]
    pub fn errno(&self) -> Errno {
        match *self {
            Self::Errno(errno) => errno,
            Self::Io(ref err) => match err.raw_os_error() {
                Some(raw) => Errno::from_raw(raw),
                None => match err.kind() {
                    io::ErrorKind::NotFound => Errno::ENOENT,
                    io::ErrorKind::PermissionDenied => Errno::EACCES,
                    io::ErrorKind::AlreadyExists => Errno::EEXIST,
                    io::ErrorKind::InvalidInput => Errno::EINVAL,
                    _ => Errno::EIO,
                },
            },
            Self::Context(_) => Errno::EINTR,
            Self::Other(_) => Errno::EIO,
        }
    }
}

/// Failed to deliver a reply to the kernel.
///
/// A failed reply is never retried. Repeated failures mean the connection is gone.
#[derive(Debug, thiserror::Error)]
#[error("failed to reply to request {unique}: {source}")]
pub struct ReplyError {
    /// the request which lost its reply
    pub unique: u64,
    /// the transport error
    #[source]
    pub source: io::Error,
    /// the spans active when the reply failed
    pub span_trace: SpanTrace,
}

impl ReplyError {
    pub(crate) fn new(unique: u64, source: io::Error) -> Self {
        Self {
            unique,
            source,
            span_trace: SpanTrace::capture(),
        }
    }
}
