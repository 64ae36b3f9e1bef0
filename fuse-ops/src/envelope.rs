//! The envelope of an in-flight operation

use crate::context::Context;
use crate::encode::OutMessage;
use crate::errno::Errno;
use crate::error::{OpError, ReplyError};
use crate::log::LogConfig;
use crate::ops::Op;
use crate::reply::ReplyChannel;
use crate::request::{ProtocolVersion, RequestHeader};
use crate::trace::{Completion, CompletionObserver, Tracer, TracingTracer};

use std::fmt::{self, Debug};
use std::mem;
use std::panic::Location;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error};

/// The capabilities shared by all operations of a connection
#[derive(Clone)]
pub struct Session {
    /// reply channel
    reply: Arc<dyn ReplyChannel>,
    /// trace provider
    tracer: Arc<dyn Tracer>,
    /// diagnostic sinks
    logs: LogConfig,
    /// negotiated protocol version
    proto: ProtocolVersion,
}

impl Debug for Session {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("logs", &self.logs)
            .field("proto", &self.proto)
            .finish()
    }
}

impl Session {
    /// Creates a session replying to `reply`, traced by [`TracingTracer`],
    /// without log sinks and speaking the latest protocol version
    #[must_use]
    #[inline]
    pub fn new(reply: Arc<dyn ReplyChannel>) -> Self {
        Self {
            reply,
            tracer: Arc::new(TracingTracer),
            logs: LogConfig::default(),
            proto: ProtocolVersion::CURRENT,
        }
    }

    /// Sets the trace provider
    #[must_use]
    #[inline]
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Sets the log sinks
    #[must_use]
    #[inline]
    pub fn with_logs(mut self, logs: LogConfig) -> Self {
        self.logs = logs;
        self
    }

    /// Sets the protocol version replies are encoded for
    #[must_use]
    #[inline]
    pub fn with_proto(mut self, proto: ProtocolVersion) -> Self {
        self.proto = proto;
        self
    }

    /// Returns the protocol version
    #[must_use]
    #[inline]
    pub const fn proto(&self) -> ProtocolVersion {
        self.proto
    }

    /// Returns the log sinks
    #[must_use]
    #[inline]
    pub const fn logs(&self) -> &LogConfig {
        &self.logs
    }

    /// Returns the reply channel
    #[must_use]
    #[inline]
    pub fn reply_channel(&self) -> &dyn ReplyChannel {
        &*self.reply
    }
}

/// strips the module path and the `Op` suffix from a conforming type name
fn bare_name(type_name: &str) -> Option<&str> {
    if type_name.contains('<') {
        return None;
    }
    let idx = type_name.rfind("::")?;
    let last = type_name.get(idx.wrapping_add(2)..)?;
    let bare = last.strip_suffix("Op")?;
    if bare.is_empty() {
        return None;
    }
    Some(bare)
}

/// Describes an operation like `GetInodeAttributes(inode=42)`
pub fn describe<O: Op + ?Sized>(op: &O) -> String {
    let type_name = op.type_name();
    let name = bare_name(type_name).unwrap_or(type_name);
    match op.inode() {
        Some(ino) => format!("{}(inode={})", name, ino),
        None => name.to_owned(),
    }
}

/// An operation which owes the kernel exactly one reply.
///
/// [`Envelope::respond`] consumes the envelope, so it can be called at most
/// once. An envelope dropped without a response replies `EIO`, and panics in
/// debug builds.
pub struct Envelope<O: Op> {
    /// the context with the operation span attached
    cx: Context,
    /// the operation
    op: O,
    /// the request
    header: RequestHeader,
    /// shared capabilities
    session: Session,
    /// trace report first, then the base callback
    completion: Completion,
    /// set by respond
    responded: bool,
}

impl<O: Op + Debug> Debug for Envelope<O> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("unique", &self.header.unique)
            .field("op", &self.op)
            .field("completion", &self.completion)
            .finish()
    }
}

impl<O: Op> Envelope<O> {
    /// Wraps `op`. Opens its trace span under `cx`, and arranges for
    /// `finished` to be called after the span is closed.
    pub fn new(
        cx: &Context,
        op: O,
        header: RequestHeader,
        session: &Session,
        finished: Box<dyn CompletionObserver>,
    ) -> Self {
        let desc = describe(&op);
        let (cx, report) = session.tracer.start_span(cx, &desc);
        let _ = cx.span().record("unique", &header.unique);
        debug!(parent: cx.span(), unique = header.unique, "<- {}", desc);

        let mut completion = Completion::default();
        completion.push(report);
        completion.push(finished);

        Self {
            cx,
            op,
            header,
            session: session.clone(),
            completion,
            responded: false,
        }
    }

    /// Returns the context of the operation.
    ///
    /// It is cancelled when the kernel interrupts the request.
    #[must_use]
    #[inline]
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Returns the operation
    #[must_use]
    #[inline]
    pub fn op(&self) -> &O {
        &self.op
    }

    /// Returns the operation, to fill in its response fields
    #[must_use]
    #[inline]
    pub fn op_mut(&mut self) -> &mut O {
        &mut self.op
    }

    /// Returns the request header
    #[must_use]
    #[inline]
    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    /// Returns the request id assigned by the kernel
    #[must_use]
    #[inline]
    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    /// Describes the operation like `GetInodeAttributes(inode=42)`
    #[must_use]
    #[inline]
    pub fn short_desc(&self) -> String {
        describe(&self.op)
    }

    /// Writes a line to the debug sink, attributed to the caller.
    /// Does nothing without a debug sink.
    #[track_caller]
    #[inline]
    pub fn logf(&self, args: fmt::Arguments<'_>) {
        let sink = self.session.logs.debug();
        if sink.is_enabled() {
            sink.log(Location::caller(), args);
        }
    }

    /// Completes the operation and sends its reply.
    ///
    /// `Ok(())` replies the response fields of the operation. `Err` replies the
    /// error number of the error, and writes the error to the log sinks.
    ///
    /// # Errors
    /// Returns [`ReplyError`] if the reply channel fails. The reply is not retried.
    #[track_caller]
    pub fn respond(mut self, result: Result<(), OpError>) -> Result<(), ReplyError> {
        let caller = Location::caller();
        let unique = self.header.unique;

        let mut out = OutMessage::new();
        let result = result.and_then(|()| {
            self.op.kernel_response(self.session.proto, &mut out);
            if out.fits() {
                Ok(())
            } else {
                error!(parent: self.cx.span(), unique, len = out.body_len(), "reply is too large");
                Err(OpError::from(Errno::EIO))
            }
        });
        self.responded = true;

        mem::take(&mut self.completion).complete(result.as_ref().map(|&()| ()));

        let reply = &*self.session.reply;
        let sent = match result {
            Ok(()) => reply.send(unique, out.finish(unique)),
            Err(ref err) => {
                let logs = &self.session.logs;
                if logs.debug().is_enabled() || logs.error().is_enabled() {
                    let desc = self.short_desc();
                    if logs.debug().is_enabled() {
                        logs.debug()
                            .log(caller, format_args!("-> ({}) error: {}", desc, err));
                    }
                    if logs.error().is_enabled() {
                        logs.error()
                            .log(caller, format_args!("({}) error: {}", desc, err));
                    }
                }
                reply.send_error(unique, err)
            }
        };

        sent.map_err(|e| self.cx.span().in_scope(|| ReplyError::new(unique, e)))
    }
}

impl<O: Op> Drop for Envelope<O> {
    fn drop(&mut self) {
        if self.responded {
            return;
        }
        self.responded = true;

        let unique = self.header.unique;
        let desc = self.short_desc();
        let err = OpError::from(Errno::EIO);

        mem::take(&mut self.completion).complete(Err(&err));

        error!(parent: self.cx.span(), unique, op = %desc, "dropped without a response");
        let sink = self.session.logs.error();
        if sink.is_enabled() {
            sink.log(
                Location::caller(),
                format_args!("({}) dropped without a response", desc),
            );
        }

        if let Err(e) = self.session.reply.send_error(unique, &err) {
            error!(unique, error = %e, "failed to reply");
        }

        if cfg!(debug_assertions) && !thread::panicking() {
            panic!("{} (unique = {}) dropped without a response", desc, unique);
        }
    }
}
