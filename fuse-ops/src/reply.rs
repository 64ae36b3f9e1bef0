//! The channel replies are written to

use crate::encode::OutMessage;
use crate::error::OpError;

use std::fs::File;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use tracing::trace;

/// Delivers encoded replies to the kernel.
///
/// Shared by every in-flight operation. An implementation must write each
/// message atomically, messages of concurrent callers never interleave.
pub trait ReplyChannel: Send + Sync {
    /// Sends a complete message, header included, as the reply of `unique`
    /// # Errors
    /// Returns [`io::Error`] when the message can not be delivered
    fn send(&self, unique: u64, msg: &[u8]) -> io::Result<()>;

    /// Sends an error reply of `unique`, translating `err` into an errno
    /// # Errors
    /// Returns [`io::Error`] when the message can not be delivered
    #[inline]
    fn send_error(&self, unique: u64, err: &OpError) -> io::Result<()> {
        let mut msg = OutMessage::new();
        self.send(unique, msg.finish_error(unique, err.errno()))
    }
}

/// An opened `/dev/fuse`. The kernel takes each `write(2)` as one reply.
impl ReplyChannel for File {
    fn send(&self, unique: u64, msg: &[u8]) -> io::Result<()> {
        trace!(unique, len = msg.len(), "write reply");
        let nwrite = (&*self).write(msg)?;
        if nwrite != msg.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write to fuse connection: {} of {}", nwrite, msg.len()),
            ));
        }
        Ok(())
    }
}

/// Any writer, serialized by the lock
impl<W: Write + Send> ReplyChannel for Mutex<W> {
    fn send(&self, unique: u64, msg: &[u8]) -> io::Result<()> {
        trace!(unique, len = msg.len(), "write reply");
        let mut writer = self.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(msg)?;
        writer.flush()
    }
}
