//! Turns kernel requests into operations

use crate::context::{CancelHandle, Context};
use crate::decode::{DecodeError, Decoder};
use crate::encode::OutMessage;
use crate::envelope::{Envelope, Session};
use crate::errno::Errno;
use crate::error::{OpError, ReplyError};
use crate::fs::FileSystem;
use crate::kernel;
use crate::kernel::fuse_opcode::*;
use crate::log::{LogConfig, LogSink};
use crate::ops::Op;
use crate::reply::ReplyChannel;
use crate::request::{ProtocolVersion, RequestHeader};
use crate::trace::{OnComplete, Tracer, TracingTracer};

use std::collections::HashMap;
use std::convert::TryFrom;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_std::task::{self, JoinHandle};
use tracing::{debug, error, trace, Instrument};

declare_operations!(
    LookUpInode(LookUpInodeOp) = FUSE_LOOKUP,
    GetInodeAttributes(GetInodeAttributesOp) = FUSE_GETATTR,
    SetInodeAttributes(SetInodeAttributesOp) = FUSE_SETATTR,
    MkDir(MkDirOp) = FUSE_MKDIR,
    Unlink(UnlinkOp) = FUSE_UNLINK,
    RmDir(RmDirOp) = FUSE_RMDIR,
    ReadSymlink(ReadSymlinkOp) = FUSE_READLINK,
    OpenFile(OpenFileOp) = FUSE_OPEN,
    ReadFile(ReadFileOp) = FUSE_READ,
    WriteFile(WriteFileOp) = FUSE_WRITE,
    FlushFile(FlushFileOp) = FUSE_FLUSH,
    ReleaseFileHandle(ReleaseFileHandleOp) = FUSE_RELEASE,
    StatFs(StatFsOp) = FUSE_STATFS,
);

/// The error returned by [`Dispatcher`]
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The request can not be decoded
    #[error("failed to decode request: {0}")]
    Decode(#[from] DecodeError),

    /// A reply sent by the dispatcher itself failed
    #[error(transparent)]
    Reply(#[from] ReplyError),

    /// The kernel does not follow the protocol
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The oldest protocol version supported
const MIN_PROTO: ProtocolVersion = ProtocolVersion { major: 7, minor: 8 };

/// `init_out` gained its tail in 7.23
const INIT_OUT_TAIL_MINOR: u32 = 23;

/// header length
const IN_HEADER_LEN: usize = mem::size_of::<kernel::fuse_in_header>();

/// Splits a request into its header and a decoder of its body
fn parse_request(request: &[u8]) -> Result<(RequestHeader, Decoder<'_>), DecodeError> {
    let mut de = Decoder::new(request);
    let raw: &kernel::fuse_in_header = de.fetch()?;
    let len = usize::try_from(raw.len).map_err(|_| DecodeError::InvalidValue)?;
    if len < IN_HEADER_LEN {
        return Err(DecodeError::InvalidValue);
    }
    let body = request.get(IN_HEADER_LEN..len).ok_or(DecodeError::NotEnough)?;
    Ok((RequestHeader::from_raw(raw), Decoder::new(body)))
}

/// Configures a [`Dispatcher`] before the INIT handshake
pub struct DispatcherBuilder {
    /// reply channel
    reply: Arc<dyn ReplyChannel>,
    /// trace provider
    tracer: Arc<dyn Tracer>,
    /// log sinks
    logs: LogConfig,
    /// parent of all operation contexts
    root: Context,
    /// max_write
    max_write: u32,
    /// max_background
    max_background: u16,
    /// congestion_threshold
    congestion_threshold: u16,
    /// time_gran
    time_gran: u32,
    /// requested init flags
    init_flags: u32,
}

impl std::fmt::Debug for DispatcherBuilder {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("logs", &self.logs)
            .field("max_write", &self.max_write)
            .field("max_background", &self.max_background)
            .field("congestion_threshold", &self.congestion_threshold)
            .field("time_gran", &self.time_gran)
            .field("init_flags", &self.init_flags)
            .finish()
    }
}

impl DispatcherBuilder {
    /// Sets the largest write the kernel sends, 128 KiB by default
    #[must_use]
    #[inline]
    pub fn max_write(mut self, max_write: u32) -> Self {
        self.max_write = max_write;
        self
    }

    /// Sets the number of background requests, 10 by default
    #[must_use]
    #[inline]
    pub fn max_background(mut self, max_background: u16) -> Self {
        self.max_background = max_background;
        self
    }

    /// Sets the congestion threshold, 10 by default
    #[must_use]
    #[inline]
    pub fn congestion_threshold(mut self, congestion_threshold: u16) -> Self {
        self.congestion_threshold = congestion_threshold;
        self
    }

    /// Sets the timestamp granularity in nanoseconds, 1 by default
    #[must_use]
    #[inline]
    pub fn time_gran(mut self, time_gran: u32) -> Self {
        self.time_gran = time_gran;
        self
    }

    /// Sets the init flags to request. Only the flags the kernel offers are replied.
    #[must_use]
    #[inline]
    pub fn init_flags(mut self, init_flags: u32) -> Self {
        self.init_flags = init_flags;
        self
    }

    /// Sets the trace provider, [`TracingTracer`] by default
    #[must_use]
    #[inline]
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Sets the debug sink, disabled by default
    #[must_use]
    #[inline]
    pub fn debug_log(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.logs = self.logs.with_debug(sink);
        self
    }

    /// Sets the error sink, disabled by default
    #[must_use]
    #[inline]
    pub fn error_log(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.logs = self.logs.with_error(sink);
        self
    }

    /// Sets the context all operation contexts derive from
    #[must_use]
    #[inline]
    pub fn root_context(mut self, cx: Context) -> Self {
        self.root = cx;
        self
    }

    /// Performs the INIT handshake with the first request of a connection
    /// # Errors
    /// + [`DispatchError::Protocol`] if the request is not INIT or its version is not supported,
    /// the kernel is replied `EPROTO` or `EIO`
    /// + [`DispatchError::Decode`] if the request is malformed
    /// + [`DispatchError::Reply`] if the reply fails
    pub fn initialize(self, request: &[u8]) -> Result<Dispatcher, DispatchError> {
        let (header, mut de) = parse_request(request)?;
        let unique = header.unique;
        let reply = &*self.reply;

        let fail = |errno: Errno, reason: String| {
            match reply.send_error(unique, &OpError::from(errno)) {
                Ok(()) => DispatchError::Protocol(reason),
                Err(e) => ReplyError::new(unique, e).into(),
            }
        };

        if header.opcode != FUSE_INIT {
            let reason = format!("expected INIT, got opcode {}", header.opcode);
            return Err(fail(Errno::EIO, reason));
        }

        let init_in: &kernel::fuse_init_in = de.fetch()?;
        let kernel_proto = ProtocolVersion {
            major: init_in.major,
            minor: init_in.minor,
        };
        debug!(major = kernel_proto.major, minor = kernel_proto.minor, "INIT");

        if kernel_proto.major != kernel::FUSE_KERNEL_VERSION
            || kernel_proto.lt(MIN_PROTO.major, MIN_PROTO.minor)
        {
            let reason = format!(
                "unsupported protocol version {}.{}",
                kernel_proto.major, kernel_proto.minor
            );
            return Err(fail(Errno::EPROTO, reason));
        }

        let proto = ProtocolVersion {
            major: kernel::FUSE_KERNEL_VERSION,
            minor: kernel_proto.minor.min(kernel::FUSE_KERNEL_MINOR_VERSION),
        };

        let init_out = kernel::fuse_init_out {
            major: proto.major,
            minor: proto.minor,
            max_readahead: init_in.max_readahead,
            flags: init_in.flags & self.init_flags,
            max_background: self.max_background,
            congestion_threshold: self.congestion_threshold,
            max_write: self.max_write,
            time_gran: self.time_gran,
            ..kernel::fuse_init_out::default()
        };

        let mut out = OutMessage::new();
        if proto.lt(7, INIT_OUT_TAIL_MINOR) {
            out.append_prefix(&init_out, kernel::FUSE_COMPAT_22_INIT_OUT_SIZE as usize);
        } else {
            out.append(&init_out);
        }
        reply
            .send(unique, out.finish(unique))
            .map_err(|e| ReplyError::new(unique, e))?;

        debug!(
            major = proto.major,
            minor = proto.minor,
            flags = init_out.flags,
            "session initialized"
        );

        let session = Session::new(self.reply)
            .with_tracer(self.tracer)
            .with_logs(self.logs)
            .with_proto(proto);

        Ok(Dispatcher {
            session,
            root: self.root,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

/// in-flight operations by request id
type InFlight = Mutex<HashMap<u64, CancelHandle>>;

/// locks the table, a poisoned lock is still usable
fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashMap<u64, CancelHandle>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decodes requests of an initialized connection into [`Operation`]s
#[derive(Debug)]
pub struct Dispatcher {
    /// shared by all envelopes
    session: Session,
    /// parent of all operation contexts
    root: Context,
    /// cancel handles of envelopes not yet responded
    in_flight: Arc<InFlight>,
}

impl Dispatcher {
    /// Creates a builder with the default configuration
    #[must_use]
    #[inline]
    pub fn builder(reply: Arc<dyn ReplyChannel>) -> DispatcherBuilder {
        DispatcherBuilder {
            reply,
            tracer: Arc::new(TracingTracer),
            logs: LogConfig::default(),
            root: Context::background(),
            max_write: 128 * 1024,
            max_background: 10,
            congestion_threshold: 10,
            time_gran: 1,
            init_flags: kernel::FUSE_ASYNC_READ | kernel::FUSE_BIG_WRITES,
        }
    }

    /// Returns the session shared by the envelopes
    #[must_use]
    #[inline]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Returns the number of operations not yet responded
    #[must_use]
    #[inline]
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Decodes a request.
    ///
    /// Returns `None` for requests the dispatcher completes by itself:
    /// interrupts, forgets, DESTROY and unsupported opcodes.
    ///
    /// # Errors
    /// + [`DispatchError::Decode`] if the request is malformed. A request with a
    /// valid header is replied `EIO`.
    /// + [`DispatchError::Reply`] if a reply sent by the dispatcher fails
    pub fn dispatch(&self, request: &[u8]) -> Result<Option<Operation>, DispatchError> {
        let (header, mut de) = parse_request(request)?;
        let unique = header.unique;
        let opcode = header.opcode;
        trace!(unique, opcode, nodeid = header.nodeid, "dispatch request");

        match opcode {
            FUSE_INTERRUPT => {
                let arg: &kernel::fuse_interrupt_in = de.fetch()?;
                self.interrupt(arg.unique);
                Ok(None)
            }
            FUSE_FORGET | FUSE_BATCH_FORGET => {
                trace!(unique, opcode, "forget");
                Ok(None)
            }
            FUSE_DESTROY => {
                debug!(unique, "destroy");
                let mut out = OutMessage::new();
                self.session
                    .reply_channel()
                    .send(unique, out.finish(unique))
                    .map_err(|e| ReplyError::new(unique, e))?;
                Ok(None)
            }
            _ => match decode_operation(self, header, &mut de) {
                Ok(Some(op)) => Ok(Some(op)),
                Ok(None) => {
                    debug!(unique, opcode, "unsupported operation");
                    self.reply_error(unique, Errno::ENOSYS)?;
                    Ok(None)
                }
                Err(err) => {
                    error!(unique, opcode, error = %err, "failed to decode request");
                    self.reply_error(unique, Errno::EIO)?;
                    Err(err.into())
                }
            },
        }
    }

    /// Decodes a request and runs `fs` on the operation in a new task,
    /// instrumented with the span of the operation
    /// # Errors
    /// See [`Dispatcher::dispatch`]
    pub fn spawn<F>(
        &self,
        fs: Arc<F>,
        request: &[u8],
    ) -> Result<Option<JoinHandle<()>>, DispatchError>
    where
        F: FileSystem + ?Sized + 'static,
    {
        let op = match self.dispatch(request)? {
            Some(op) => op,
            None => return Ok(None),
        };
        let span = op.context().span().clone();
        let handle = task::spawn(
            async move {
                if let Err(err) = fs.dispatch(op).await {
                    error!(
                        unique = err.unique,
                        error = %err.source,
                        span_trace = %err.span_trace,
                        "failed to reply"
                    );
                }
            }
            .instrument(span),
        );
        Ok(Some(handle))
    }

    /// cancels the context of an in-flight operation
    fn interrupt(&self, target: u64) {
        match lock(&self.in_flight).get(&target) {
            Some(handle) => {
                debug!(target, "interrupt");
                handle.cancel();
            }
            None => trace!(target, "interrupt of a finished request"),
        }
    }

    /// replies an error directly
    fn reply_error(&self, unique: u64, errno: Errno) -> Result<(), ReplyError> {
        self.session
            .reply_channel()
            .send_error(unique, &OpError::from(errno))
            .map_err(|e| ReplyError::new(unique, e))
    }

    /// wraps an operation into an envelope which is cancelled by interrupts
    fn wrap<O: Op>(&self, op: O, header: RequestHeader) -> Envelope<O> {
        let unique = header.unique;
        let (cx, handle) = self.root.with_cancel();
        let _ = lock(&self.in_flight).insert(unique, handle);

        let in_flight = Arc::clone(&self.in_flight);
        let finished = OnComplete(move |_: Result<(), &OpError>| {
            let _ = lock(&in_flight).remove(&unique);
        });
        Envelope::new(&cx, op, header, &self.session, Box::new(finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi_marker::as_abi_bytes;
    use crate::ops::testing::{bytes_of, request};
    use crate::ops::{ChildInodeEntry, ROOT_INODE_ID};
    use crate::reply::testing::RecordingChannel;

    use std::time::Duration;

    use async_trait::async_trait;

    fn init_request(unique: u64, major: u32, minor: u32) -> aligned_bytes::AlignedBytes {
        let init_in = kernel::fuse_init_in {
            major,
            minor,
            max_readahead: 65536,
            flags: kernel::FUSE_ASYNC_READ | kernel::FUSE_BIG_WRITES | (1 << 3),
        };
        request(FUSE_INIT, unique, 0, &bytes_of(&init_in))
    }

    fn setup(minor: u32) -> (Dispatcher, Arc<RecordingChannel>) {
        crate::test_utils::init_tracing();
        let channel = Arc::new(RecordingChannel::default());
        let dispatcher = Dispatcher::builder(Arc::<RecordingChannel>::clone(&channel))
            .initialize(&init_request(1, 7, minor))
            .unwrap();
        (dispatcher, channel)
    }

    fn getattr_request(unique: u64, nodeid: u64) -> aligned_bytes::AlignedBytes {
        let arg = kernel::fuse_getattr_in {
            getattr_flags: 0,
            dummy: 0,
            fh: 0,
        };
        request(FUSE_GETATTR, unique, nodeid, &bytes_of(&arg))
    }

    #[test]
    fn init_handshake() {
        let (dispatcher, channel) = setup(31);
        assert_eq!(dispatcher.session().proto(), ProtocolVersion { major: 7, minor: 31 });

        let sent = channel.sent_to(1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].error, 0);
        assert_eq!(sent[0].body.len(), mem::size_of::<kernel::fuse_init_out>());

        let mut expected = kernel::fuse_init_out {
            major: 7,
            minor: 31,
            max_readahead: 65536,
            flags: kernel::FUSE_ASYNC_READ | kernel::FUSE_BIG_WRITES,
            max_background: 10,
            congestion_threshold: 10,
            max_write: 128 * 1024,
            time_gran: 1,
            ..kernel::fuse_init_out::default()
        };
        assert_eq!(sent[0].body, as_abi_bytes(&expected));

        let (dispatcher, channel) = setup(40);
        assert_eq!(dispatcher.session().proto().minor, 31);
        assert_eq!(channel.sent()[0].body, as_abi_bytes(&expected));

        let (dispatcher, channel) = setup(12);
        assert_eq!(dispatcher.session().proto().minor, 12);
        expected.minor = 12;
        let compat = kernel::FUSE_COMPAT_22_INIT_OUT_SIZE as usize;
        assert_eq!(channel.sent()[0].body, &as_abi_bytes(&expected)[..compat]);
    }

    #[test]
    fn init_rejects_old_kernels() {
        crate::test_utils::init_tracing();
        for &(major, minor) in &[(7, 7), (6, 31), (8, 0)] {
            let channel = Arc::new(RecordingChannel::default());
            let err = Dispatcher::builder(Arc::<RecordingChannel>::clone(&channel))
                .initialize(&init_request(1, major, minor))
                .unwrap_err();
            assert!(matches!(err, DispatchError::Protocol(_)), "{}", err);
            assert_eq!(channel.sent()[0].error, -libc::EPROTO);
        }
    }

    #[test]
    fn init_must_come_first() {
        crate::test_utils::init_tracing();
        let channel = Arc::new(RecordingChannel::default());
        let err = Dispatcher::builder(Arc::<RecordingChannel>::clone(&channel))
            .initialize(&getattr_request(1, ROOT_INODE_ID))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(_)));
        assert_eq!(channel.sent()[0].error, -libc::EIO);
    }

    #[test]
    fn getattr_round_trip() {
        let (dispatcher, channel) = setup(31);

        let op = dispatcher.dispatch(&getattr_request(2, 42)).unwrap().unwrap();
        assert_eq!(op.short_desc(), "GetInodeAttributes(inode=42)");
        assert_eq!(dispatcher.in_flight(), 1);

        match op {
            Operation::GetInodeAttributes(mut env) => {
                assert_eq!(env.op().inode, 42);
                env.op_mut().attributes.size = 11;
                env.respond(Ok(())).unwrap();
            }
            other => panic!("unexpected operation: {:?}", other),
        }
        assert_eq!(dispatcher.in_flight(), 0);

        let sent = channel.sent_to(2);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].error, 0);
        assert_eq!(sent[0].body.len(), mem::size_of::<kernel::fuse_attr_out>());
    }

    #[test]
    fn interrupt_cancels_the_target() {
        let (dispatcher, channel) = setup(31);

        let op = dispatcher.dispatch(&getattr_request(3, 42)).unwrap().unwrap();
        assert!(!op.context().is_done());

        let interrupt = kernel::fuse_interrupt_in { unique: 3 };
        let req = request(FUSE_INTERRUPT, 4, 0, &bytes_of(&interrupt));
        assert!(dispatcher.dispatch(&req).unwrap().is_none());
        assert!(op.context().is_done());

        let err = op.context().err().unwrap();
        op.respond(Err(err.into())).unwrap();

        assert!(channel.sent_to(4).is_empty());
        assert_eq!(channel.sent_to(3)[0].error, -libc::EINTR);

        // the target is gone
        let req = request(FUSE_INTERRUPT, 5, 0, &bytes_of(&interrupt));
        assert!(dispatcher.dispatch(&req).unwrap().is_none());
        assert!(channel.sent_to(5).is_empty());
    }

    #[test]
    fn unsupported_opcode_is_enosys() {
        let (dispatcher, channel) = setup(31);
        let req = request(FUSE_GETXATTR, 6, 42, b"user.x\0\0\0\0\0\0\0\0\0\0");
        assert!(dispatcher.dispatch(&req).unwrap().is_none());
        assert_eq!(channel.sent_to(6)[0].error, -libc::ENOSYS);
    }

    #[test]
    fn forget_is_not_replied() {
        let (dispatcher, channel) = setup(31);
        let req = request(FUSE_FORGET, 7, 42, &1_u64.to_ne_bytes());
        assert!(dispatcher.dispatch(&req).unwrap().is_none());
        assert!(channel.sent_to(7).is_empty());
    }

    #[test]
    fn destroy_is_replied() {
        let (dispatcher, channel) = setup(31);
        let req = request(FUSE_DESTROY, 8, 0, &[]);
        assert!(dispatcher.dispatch(&req).unwrap().is_none());
        let sent = channel.sent_to(8);
        assert_eq!((sent[0].error, sent[0].body.len()), (0, 0));
    }

    #[test]
    fn malformed_body_is_eio() {
        let (dispatcher, channel) = setup(31);
        let req = request(FUSE_LOOKUP, 9, ROOT_INODE_ID, b"no-nul");
        let err = dispatcher.dispatch(&req).unwrap_err();
        assert!(matches!(err, DispatchError::Decode(DecodeError::NotEnough)));
        assert_eq!(channel.sent_to(9)[0].error, -libc::EIO);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn truncated_header_is_not_replied() {
        let (dispatcher, channel) = setup(31);
        let req = getattr_request(10, 42);
        let err = dispatcher.dispatch(&req[..20]).unwrap_err();
        assert!(matches!(err, DispatchError::Decode(_)));

        let err = dispatcher.dispatch(&req[..req.len() - 1]).unwrap_err();
        assert!(matches!(err, DispatchError::Decode(DecodeError::NotEnough)));
        assert!(channel.sent_to(10).is_empty());
    }

    #[test]
    fn old_protocol_getattr_has_no_body() {
        let (dispatcher, channel) = setup(8);
        let req = request(FUSE_GETATTR, 11, 42, &[]);
        let op = dispatcher.dispatch(&req).unwrap().unwrap();
        op.respond(Ok(())).unwrap();

        let body = &channel.sent_to(11)[0].body;
        assert_eq!(body.len(), kernel::FUSE_COMPAT_ATTR_OUT_SIZE as usize);
    }

    /// answers lookups of "hello" under the root
    struct HelloFs;

    #[async_trait]
    impl FileSystem for HelloFs {
        async fn dispatch(&self, op: Operation) -> Result<(), ReplyError> {
            match op {
                Operation::LookUpInode(mut env) => {
                    if env.op().parent == ROOT_INODE_ID && env.op().name == "hello" {
                        env.op_mut().entry = ChildInodeEntry {
                            child: 2,
                            attributes_expiration: Duration::from_secs(1),
                            ..ChildInodeEntry::default()
                        };
                        env.respond(Ok(()))
                    } else {
                        env.respond(Err(Errno::ENOENT.into()))
                    }
                }
                op => op.respond(Err(Errno::ENOSYS.into())),
            }
        }
    }

    #[test]
    fn spawned_operations_reply() -> anyhow::Result<()> {
        let (dispatcher, channel) = setup(31);
        let fs = Arc::new(HelloFs);

        let hello = request(FUSE_LOOKUP, 20, ROOT_INODE_ID, b"hello\0");
        let missing = request(FUSE_LOOKUP, 21, ROOT_INODE_ID, b"missing\0");
        let statfs = request(FUSE_STATFS, 22, ROOT_INODE_ID, &[]);

        let mut tasks = Vec::new();
        for req in &[hello, missing, statfs] {
            tasks.extend(dispatcher.spawn(Arc::clone(&fs), req)?);
        }
        assert_eq!(tasks.len(), 3);
        task::block_on(futures::future::join_all(tasks));

        let sent = channel.sent_to(20);
        assert_eq!((sent.len(), sent[0].error), (1, 0));
        assert_eq!(&sent[0].body[..8], &2_u64.to_ne_bytes());
        assert_eq!(channel.sent_to(21)[0].error, -libc::ENOENT);
        assert_eq!(channel.sent_to(22)[0].error, -libc::ENOSYS);
        assert_eq!(dispatcher.in_flight(), 0);
        Ok(())
    }
}
