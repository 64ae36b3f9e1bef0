//! The operation layer of a FUSE server.
//!
//! A [`Dispatcher`] decodes kernel requests into [`Operation`]s. Each operation
//! is held by an [`Envelope`], which carries its [`Context`] and trace span, and
//! sends exactly one reply to the kernel.

#![deny(clippy::all)]
#![deny(missing_debug_implementations, missing_docs)]

#[macro_use]
mod internel_macros;

// unsafe modules
mod abi_marker;
mod decode;
mod encode;

// safe modules
mod context;
mod dispatch;
mod envelope;
mod errno;
mod error;
mod fs;
mod log;
mod reply;
mod request;
mod trace;

#[cfg(test)]
mod test_utils;

#[allow(missing_docs, missing_debug_implementations, non_camel_case_types)]
pub mod kernel;
pub mod ops;

pub use self::context::{CancelHandle, Cancelled, Context, ContextError};
pub use self::decode::DecodeError;
pub use self::dispatch::{DispatchError, Dispatcher, DispatcherBuilder, Operation};
pub use self::encode::OutMessage;
pub use self::envelope::{describe, Envelope, Session};
pub use self::errno::Errno;
pub use self::error::{OpError, ReplyError};
pub use self::fs::FileSystem;
pub use self::log::{LogConfig, LogSink, NoopSink, TracingSink, WriterSink};
pub use self::reply::ReplyChannel;
pub use self::request::{ProtocolVersion, RequestHeader};
pub use self::trace::{CompletionObserver, OnComplete, Tracer, TracingTracer};
