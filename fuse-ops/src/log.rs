//! Diagnostic sinks of operations

use std::fmt::{self, Debug};
use std::io::Write;
use std::panic::Location;
use std::sync::{Arc, Mutex, PoisonError};

/// A destination for diagnostic lines.
///
/// `caller` is the source location of the filesystem code which produced the line.
pub trait LogSink: Send + Sync {
    /// Writes one line. Never fails.
    fn log(&self, caller: &'static Location<'static>, args: fmt::Arguments<'_>);

    /// Returns false if [`LogSink::log`] discards everything
    #[inline]
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl LogSink for NoopSink {
    #[inline]
    fn log(&self, _: &'static Location<'static>, _: fmt::Arguments<'_>) {}

    #[inline]
    fn is_enabled(&self) -> bool {
        false
    }
}

/// level of the events emitted by [`TracingSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventLevel {
    /// `DEBUG`
    Debug,
    /// `ERROR`
    Error,
}

/// Forwards lines to `tracing` events
#[derive(Debug, Clone, Copy)]
pub struct TracingSink {
    /// event level
    level: EventLevel,
}

impl TracingSink {
    /// Emits `DEBUG` events
    #[must_use]
    #[inline]
    pub const fn debug() -> Self {
        Self {
            level: EventLevel::Debug,
        }
    }

    /// Emits `ERROR` events
    #[must_use]
    #[inline]
    pub const fn error() -> Self {
        Self {
            level: EventLevel::Error,
        }
    }
}

impl LogSink for TracingSink {
    fn log(&self, caller: &'static Location<'static>, args: fmt::Arguments<'_>) {
        match self.level {
            EventLevel::Debug => tracing::debug!(%caller, "{}", args),
            EventLevel::Error => tracing::error!(%caller, "{}", args),
        }
    }
}

/// Writes `<prefix><file>:<line>: <message>` lines to a writer.
///
/// Each line is written with a single `write_all` under a lock, so concurrent
/// operations never interleave.
#[derive(Debug)]
pub struct WriterSink<W> {
    /// line prefix
    prefix: String,
    /// writer
    inner: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    /// Creates a sink without prefix
    #[inline]
    pub fn new(writer: W) -> Self {
        Self::with_prefix(String::new(), writer)
    }

    /// Creates a sink which starts every line with `prefix`
    #[inline]
    pub fn with_prefix(prefix: impl Into<String>, writer: W) -> Self {
        Self {
            prefix: prefix.into(),
            inner: Mutex::new(writer),
        }
    }

    /// Consumes the sink, returning the writer
    #[inline]
    pub fn into_inner(self) -> W {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> LogSink for WriterSink<W> {
    fn log(&self, caller: &'static Location<'static>, args: fmt::Arguments<'_>) {
        let line = format!(
            "{}{}:{}: {}\n",
            self.prefix,
            caller.file(),
            caller.line(),
            args
        );
        let mut writer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        drop(writer.write_all(line.as_bytes()));
    }
}

/// The debug and error sinks of operations. Both default to [`NoopSink`].
#[derive(Clone)]
pub struct LogConfig {
    /// per-operation debug lines
    pub(crate) debug: Arc<dyn LogSink>,
    /// exceptional errors
    pub(crate) error: Arc<dyn LogSink>,
}

impl Debug for LogConfig {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogConfig")
            .field("debug", &self.debug.is_enabled())
            .field("error", &self.error.is_enabled())
            .finish()
    }
}

impl Default for LogConfig {
    #[inline]
    fn default() -> Self {
        Self {
            debug: Arc::new(NoopSink),
            error: Arc::new(NoopSink),
        }
    }
}

impl LogConfig {
    /// Sets the debug sink
    #[must_use]
    #[inline]
    pub fn with_debug(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.debug = sink;
        self
    }

    /// Sets the error sink
    #[must_use]
    #[inline]
    pub fn with_error(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.error = sink;
        self
    }

    /// Returns the debug sink
    #[must_use]
    #[inline]
    pub fn debug(&self) -> &dyn LogSink {
        &*self.debug
    }

    /// Returns the error sink
    #[must_use]
    #[inline]
    pub fn error(&self) -> &dyn LogSink {
        &*self.error
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_sink_formats_caller() {
        let sink = WriterSink::with_prefix("fuse: ", Vec::new());
        let caller = Location::caller();
        sink.log(caller, format_args!("lookup {}", 42));

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, format!("fuse: {}:{}: lookup 42\n", caller.file(), caller.line()));
    }

    #[derive(Default)]
    struct LevelRecorder {
        levels: Arc<Mutex<Vec<tracing::Level>>>,
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LevelRecorder {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.levels.lock().unwrap().push(*event.metadata().level());
        }
    }

    #[test]
    fn tracing_sink_levels() {
        use tracing_subscriber::layer::SubscriberExt;

        let recorder = LevelRecorder::default();
        let levels = Arc::clone(&recorder.levels);
        let subscriber = tracing_subscriber::registry().with(recorder);

        tracing::subscriber::with_default(subscriber, || {
            let caller = Location::caller();
            TracingSink::debug().log(caller, format_args!("lookup"));
            TracingSink::error().log(caller, format_args!("lookup failed"));
        });

        let levels = levels.lock().unwrap();
        assert_eq!(*levels, [tracing::Level::DEBUG, tracing::Level::ERROR]);
    }

    #[test]
    fn default_config_is_disabled() {
        let logs = LogConfig::default();
        assert!(!logs.debug().is_enabled());
        assert!(!logs.error().is_enabled());

        let logs = logs.with_error(Arc::new(TracingSink::error()));
        assert!(!logs.debug().is_enabled());
        assert!(logs.error().is_enabled());
    }
}
