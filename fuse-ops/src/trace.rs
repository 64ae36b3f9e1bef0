//! Trace spans and completion observers of operations

use crate::context::Context;
use crate::error::OpError;

use std::fmt::{self, Debug};

use tracing::field::{display, Empty};
use tracing::{debug, debug_span, Span};

/// Observes the final result of an operation, exactly once
pub trait CompletionObserver: Send {
    /// Called with the result passed to `respond`
    fn complete(self: Box<Self>, result: Result<(), &OpError>);
}

/// Adapts a closure into a [`CompletionObserver`]
pub struct OnComplete<F>(pub F);

impl<F> Debug for OnComplete<F> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OnComplete(..)")
    }
}

impl<F> CompletionObserver for OnComplete<F>
where
    F: FnOnce(Result<(), &OpError>) + Send,
{
    #[inline]
    fn complete(self: Box<Self>, result: Result<(), &OpError>) {
        (self.0)(result)
    }
}

/// Opens a span for every operation.
///
/// Shared by all operations of a session, must be reentrant.
pub trait Tracer: Send + Sync {
    /// Opens a span labelled `label` under `cx`. Returns the context
    /// associated with the span and the observer which closes it.
    fn start_span(&self, cx: &Context, label: &str) -> (Context, Box<dyn CompletionObserver>);
}

/// A [`Tracer`] built on `tracing` spans
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

/// closes a span opened by [`TracingTracer`]
struct SpanReport {
    /// span
    span: Span,
}

impl CompletionObserver for SpanReport {
    fn complete(self: Box<Self>, result: Result<(), &OpError>) {
        let span = self.span;
        if let Err(err) = result {
            let _ = span.record("error", &display(err));
        }
        debug!(parent: &span, ok = result.is_ok(), "operation finished");
    }
}

impl Tracer for TracingTracer {
    fn start_span(&self, cx: &Context, label: &str) -> (Context, Box<dyn CompletionObserver>) {
        let span = debug_span!(
            parent: cx.span(),
            "fuse_op",
            op = %label,
            unique = Empty,
            error = Empty
        );
        let report = SpanReport { span: span.clone() };
        (cx.with_span(span), Box::new(report))
    }
}

/// The observers of one operation, completed in registration order
#[derive(Default)]
pub(crate) struct Completion {
    /// observers
    observers: Vec<Box<dyn CompletionObserver>>,
}

impl Debug for Completion {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Completion {
    /// Appends an observer
    pub(crate) fn push(&mut self, observer: Box<dyn CompletionObserver>) {
        self.observers.push(observer);
    }

    /// Completes every observer with the same result
    pub(crate) fn complete(self, result: Result<(), &OpError>) {
        for observer in self.observers {
            observer.complete(result);
        }
    }
}
