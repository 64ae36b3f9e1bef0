//! The context propagated to filesystem logic

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{self, Poll};
use std::time::Instant;

use async_std::task::sleep;
use futures::future::{self, Either};
use futures::pin_mut;
use futures::task::AtomicWaker;
use tracing::Span;

/// Why a [`Context`] is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The context was cancelled, for example by a kernel interrupt
    #[error("context cancelled")]
    Cancelled,

    /// The deadline of the context has passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// locks a list, ignoring poison
fn lock<T>(list: &Mutex<T>) -> MutexGuard<'_, T> {
    list.lock().unwrap_or_else(PoisonError::into_inner)
}

/// cancellation state shared by a context and its clones.
///
/// Waiters and children are held weakly and pruned when they are dropped,
/// so a long-lived state only holds what is alive.
#[derive(Debug)]
struct CancelState {
    /// cancelled flag
    cancelled: AtomicBool,
    /// one waker slot per pending [`Cancelled`]
    waiters: Mutex<Vec<Weak<AtomicWaker>>>,
    /// derived states, cancelled with this one
    children: Mutex<Vec<Weak<CancelState>>>,
    /// kept alive while a child exists
    parent: Option<Arc<CancelState>>,
}

impl CancelState {
    fn new(parent: Option<Arc<Self>>) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            parent,
        }
    }

    fn child(parent: &Arc<Self>) -> Arc<Self> {
        let child = Arc::new(Self::new(Some(Arc::clone(parent))));
        lock(&parent.children).push(Arc::downgrade(&child));
        // the parent may have been cancelled before the push
        if parent.is_cancelled() {
            child.cancel();
        }
        child
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let waiters = mem::take(&mut *lock(&self.waiters));
        for waiter in waiters.iter().filter_map(Weak::upgrade) {
            waiter.wake();
        }
        let children = mem::take(&mut *lock(&self.children));
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    fn add_waiter(&self, waiter: &Arc<AtomicWaker>) {
        lock(&self.waiters).push(Arc::downgrade(waiter));
    }

    fn prune_waiters(&self) {
        lock(&self.waiters).retain(|w| w.strong_count() > 0);
    }
}

impl Drop for CancelState {
    fn drop(&mut self) {
        if let Some(ref parent) = self.parent {
            lock(&parent.children).retain(|c| c.strong_count() > 0);
        }
    }
}

/// Carries the trace span, cancellation and deadline of an operation.
///
/// Cloning is cheap. Deriving a context never affects its parent.
#[derive(Debug, Clone)]
pub struct Context {
    /// trace span
    span: Span,
    /// cancellation
    cancel: Arc<CancelState>,
    /// deadline
    deadline: Option<Instant>,
}

impl Default for Context {
    #[inline]
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// An empty context which is never cancelled and has no deadline
    #[must_use]
    #[inline]
    pub fn background() -> Self {
        Self {
            span: Span::none(),
            cancel: Arc::new(CancelState::new(None)),
            deadline: None,
        }
    }

    /// Returns the associated span
    #[must_use]
    #[inline]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Returns the deadline, if any
    #[must_use]
    #[inline]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Derives a context associated with `span`
    #[must_use]
    #[inline]
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            span,
            cancel: Arc::clone(&self.cancel),
            deadline: self.deadline,
        }
    }

    /// Derives a context which is cancelled by the returned handle or with `self`
    #[must_use]
    #[inline]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let cancel = CancelState::child(&self.cancel);
        let handle = CancelHandle {
            state: Arc::clone(&cancel),
        };
        let cx = Self {
            span: self.span.clone(),
            cancel,
            deadline: self.deadline,
        };
        (cx, handle)
    }

    /// Derives a context with a deadline. The earlier deadline wins.
    #[must_use]
    #[inline]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(d) if d <= deadline => d,
            _ => deadline,
        };
        Self {
            span: self.span.clone(),
            cancel: Arc::clone(&self.cancel),
            deadline: Some(deadline),
        }
    }

    /// Returns why the context is done, or `None` if it is not
    #[must_use]
    #[inline]
    pub fn err(&self) -> Option<ContextError> {
        if self.cancel.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Returns true if the context is cancelled or past its deadline
    #[must_use]
    #[inline]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Returns a future which resolves when the context is cancelled
    #[must_use]
    #[inline]
    pub fn cancelled(&self) -> Cancelled<'_> {
        Cancelled {
            cx: self,
            waiter: None,
        }
    }

    /// Waits until the context is cancelled or its deadline passes
    pub async fn done(&self) -> ContextError {
        let cancelled = self.cancelled();
        let deadline = match self.deadline {
            None => {
                cancelled.await;
                return ContextError::Cancelled;
            }
            Some(d) => d,
        };

        let timer = sleep(deadline.saturating_duration_since(Instant::now()));
        pin_mut!(timer);
        match future::select(cancelled, timer).await {
            Either::Left(((), _)) => ContextError::Cancelled,
            Either::Right(((), _)) => ContextError::DeadlineExceeded,
        }
    }
}

/// Cancels the [`Context`] it was created with, and all contexts derived from it
#[derive(Debug, Clone)]
pub struct CancelHandle {
    /// shared state
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Cancels the context. Cancelling twice has no effect.
    #[inline]
    pub fn cancel(&self) {
        self.state.cancel()
    }
}

/// The future returned by [`Context::cancelled`]
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Cancelled<'a> {
    /// context
    cx: &'a Context,
    /// registered on first poll, released on drop
    waiter: Option<Arc<AtomicWaker>>,
}

impl Future for Cancelled<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, task: &mut task::Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let state = &*this.cx.cancel;
        if state.is_cancelled() {
            return Poll::Ready(());
        }
        match this.waiter {
            Some(ref waiter) => waiter.register(task.waker()),
            None => {
                let waiter = Arc::new(AtomicWaker::new());
                waiter.register(task.waker());
                state.add_waiter(&waiter);
                this.waiter = Some(waiter);
            }
        }
        if state.is_cancelled() {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl Drop for Cancelled<'_> {
    fn drop(&mut self) {
        if self.waiter.take().is_some() {
            self.cx.cancel.prune_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::task::Context as TaskContext;
    use std::time::Duration;

    use async_std::task;
    use futures::task::noop_waker_ref;

    impl CancelState {
        fn waiter_count(&self) -> usize {
            lock(&self.waiters).len()
        }

        fn child_count(&self) -> usize {
            lock(&self.children).len()
        }
    }

    #[test]
    fn background_is_never_done() {
        let cx = Context::background();
        assert!(!cx.is_done());
        assert_eq!(cx.err(), None);
        assert!(cx.deadline().is_none());
    }

    #[test]
    fn cancel_propagates_to_children_only() {
        let root = Context::background();
        let (parent, parent_handle) = root.with_cancel();
        let (child, _child_handle) = parent.with_cancel();
        let span_child = child.with_span(Span::none());

        parent_handle.cancel();
        parent_handle.cancel();

        assert_eq!(parent.err(), Some(ContextError::Cancelled));
        assert_eq!(child.err(), Some(ContextError::Cancelled));
        assert_eq!(span_child.err(), Some(ContextError::Cancelled));
        assert!(!root.is_done());
    }

    #[test]
    fn cancelled_wakes_waiting_task() {
        let (cx, handle) = Context::background().with_cancel();
        let waiter = {
            let cx = cx.clone();
            task::spawn(async move { cx.cancelled().await })
        };
        task::block_on(async {
            task::sleep(Duration::from_millis(10)).await;
            handle.cancel();
            waiter.await;
        });
        assert!(cx.is_done());
    }

    #[test]
    fn parent_cancel_wakes_child_waiter() {
        let (parent, handle) = Context::background().with_cancel();
        let (child, _child_handle) = parent.with_cancel();
        let grandchild = child.with_cancel().0;
        let waiter = {
            let cx = grandchild.clone();
            task::spawn(async move { cx.cancelled().await })
        };
        task::block_on(async {
            task::sleep(Duration::from_millis(10)).await;
            handle.cancel();
            waiter.await;
        });
        assert!(child.is_done());
        assert!(grandchild.is_done());
    }

    #[test]
    fn cancel_after_derive_of_cancelled_parent() {
        let (parent, handle) = Context::background().with_cancel();
        handle.cancel();
        let (child, _child_handle) = parent.with_cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn finished_waiters_are_released() {
        let root = Context::background();
        let mut task_cx = TaskContext::from_waker(noop_waker_ref());

        for _ in 0..1000 {
            let (child, _handle) = root.with_cancel();
            let mut cancelled = child.cancelled();
            assert!(Pin::new(&mut cancelled).poll(&mut task_cx).is_pending());
            assert_eq!(child.cancel.waiter_count(), 1);
        }
        assert_eq!(root.cancel.waiter_count(), 0);
        assert_eq!(root.cancel.child_count(), 0);

        let mut cancelled = root.cancelled();
        for _ in 0..1000 {
            assert!(Pin::new(&mut cancelled).poll(&mut task_cx).is_pending());
        }
        assert_eq!(root.cancel.waiter_count(), 1);
        drop(cancelled);
        assert_eq!(root.cancel.waiter_count(), 0);
    }

    #[test]
    fn deadline_exceeded() {
        let cx = Context::background().with_deadline(Instant::now() + Duration::from_millis(20));
        assert!(!cx.is_done());

        let reason = task::block_on(cx.done());
        assert_eq!(reason, ContextError::DeadlineExceeded);
        assert_eq!(cx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[test]
    fn earlier_deadline_wins() {
        let now = Instant::now();
        let early = now + Duration::from_secs(1);
        let late = now + Duration::from_secs(60);

        let cx = Context::background().with_deadline(early).with_deadline(late);
        assert_eq!(cx.deadline(), Some(early));
    }

    #[test]
    fn cancel_beats_deadline() {
        let (cx, handle) = Context::background().with_cancel();
        let cx = cx.with_deadline(Instant::now() + Duration::from_secs(60));
        handle.cancel();
        assert_eq!(task::block_on(cx.done()), ContextError::Cancelled);
    }
}
