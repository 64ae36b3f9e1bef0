//! The filesystem interface

use crate::dispatch::Operation;
use crate::error::ReplyError;

/// Filesystem logic.
///
/// Every operation must be responded, the [`ReplyError`] of the response is returned.
#[async_trait::async_trait]
pub trait FileSystem: Send + Sync {
    /// Handles one operation
    async fn dispatch(&self, op: Operation) -> Result<(), ReplyError>;
}
