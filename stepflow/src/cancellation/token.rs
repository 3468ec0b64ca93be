//! Cancellation token for cooperative cancellation.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

/// A callback type for cancellation notifications.
pub type CancelCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    callbacks: RwLock<Vec<CancelCallback>>,
    children: Mutex<Vec<(u64, Weak<Inner>)>>,
    next_child: AtomicU64,
    notify: Notify,
}

/// A token for cooperative cancellation.
///
/// Clones share state: cancelling any clone cancels them all. Cancellation is
/// idempotent and only the first reason is kept. Nothing is ever interrupted
/// forcibly; steps observe the token at their own await points.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason.
    ///
    /// Callbacks are invoked immediately. Panics in callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *self.inner.reason.write() = Some(reason.into());
        self.inner.notify.notify_waiters();

        let callbacks = self.inner.callbacks.read();
        for callback in callbacks.iter() {
            invoke(callback.as_ref());
        }
        drop(callbacks);

        let children: Vec<Arc<Inner>> = self
            .inner
            .children
            .lock()
            .drain(..)
            .filter_map(|(_, child)| child.upgrade())
            .collect();
        let reason = self.reason_or_default();
        for inner in children {
            Self { inner }.cancel(reason.clone());
        }
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut callbacks = self.inner.callbacks.write();
        if !self.is_cancelled() {
            callbacks.push(Box::new(callback));
            return;
        }
        drop(callbacks);
        invoke(&callback);
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Creates a token that is cancelled whenever this one is.
    ///
    /// Cancelling the child does not affect the parent. The parent only holds
    /// a weak link, pruned once the child is dropped.
    #[must_use]
    pub fn child(&self) -> Self {
        self.attach_child().0
    }

    fn attach_child(&self) -> (Self, Option<u64>) {
        let child = Self::new();
        let mut children = self.inner.children.lock();
        if self.is_cancelled() {
            drop(children);
            child.cancel(self.reason_or_default());
            return (child, None);
        }
        children.retain(|(_, link)| link.strong_count() > 0);
        let id = self.inner.next_child.fetch_add(1, Ordering::Relaxed);
        children.push((id, Arc::downgrade(&child.inner)));
        (child, Some(id))
    }

    fn detach_child(&self, id: u64) {
        self.inner.children.lock().retain(|(key, _)| *key != id);
    }

    fn reason_or_default(&self) -> String {
        self.reason().unwrap_or_else(|| "parent cancelled".to_string())
    }

    #[cfg(test)]
    pub(crate) fn child_count(&self) -> usize {
        self.inner.children.lock().len()
    }

    /// Creates a child token that is also cancelled once `timeout` elapses.
    ///
    /// The deadline timer runs on the current Tokio runtime. Dropping the
    /// returned guard stops the timer and unlinks the child from this token.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> (Self, DeadlineGuard) {
        let (child, link) = self.attach_child();
        let token = child.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            token.cancel(format!("deadline of {timeout:?} exceeded"));
        });
        let guard = DeadlineGuard {
            handle,
            parent: Arc::downgrade(&self.inner),
            link,
        };
        (child, guard)
    }
}

fn invoke(callback: &(dyn Fn() + Send + Sync)) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        warn!("Cancellation callback panicked: {:?}", e);
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Stops a deadline timer and unlinks its child token when dropped.
#[derive(Debug)]
pub struct DeadlineGuard {
    handle: JoinHandle<()>,
    parent: Weak<Inner>,
    link: Option<u64>,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.handle.abort();
        if let (Some(inner), Some(id)) = (self.parent.upgrade(), self.link) {
            CancellationToken { inner }.detach_child(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_cancelled_future_wakes_on_cancel() {
        let token = CancellationToken::new();
        let mut waiter = tokio_test::task::spawn(token.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        token.cancel("done");
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[test]
    fn test_token_cancel_idempotent() {
        let token = CancellationToken::new();
        token.cancel("First reason");
        token.cancel("Second reason");

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("First reason".to_string()));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel("shutdown");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_on_cancel_before_and_after() {
        let token = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        token.cancel("test");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let c = counter.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_panic_suppressed() {
        let token = CancellationToken::new();
        token.on_cancel(|| panic!("Intentional panic"));
        token.cancel("test");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel("child only");
        assert!(!parent.is_cancelled());

        let parent = CancellationToken::new();
        let child = parent.child();
        parent.cancel("upstream");
        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some("upstream".to_string()));
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = CancellationToken::new();
        parent.cancel("gone");
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn test_dropped_children_are_pruned() {
        let parent = CancellationToken::new();
        for _ in 0..10 {
            drop(parent.child());
        }
        let live = parent.child();

        assert_eq!(parent.child_count(), 1);
        parent.cancel("stop");
        assert!(live.is_cancelled());
        assert_eq!(parent.child_count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_children_unlink_on_guard_drop() {
        let parent = CancellationToken::new();
        for _ in 0..100 {
            let (_child, _guard) = parent.child_with_timeout(Duration::from_secs(5));
        }
        assert_eq!(parent.child_count(), 0);

        let (child, _guard) = parent.child_with_timeout(Duration::from_secs(5));
        assert_eq!(parent.child_count(), 1);
        parent.cancel("shutdown");
        assert_eq!(child.reason(), Some("shutdown".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_future_completes() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::task::yield_now().await;
        token.cancel("done");
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_with_timeout_cancels_after_deadline() {
        let parent = CancellationToken::new();
        let (child, _guard) = parent.child_with_timeout(Duration::from_millis(50));

        assert!(!child.is_cancelled());
        child.cancelled().await;
        assert!(child.reason().unwrap().contains("deadline"));
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_guard_disarms_deadline() {
        let parent = CancellationToken::new();
        let (child, guard) = parent.child_with_timeout(Duration::from_millis(50));
        drop(guard);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!child.is_cancelled());
    }
}
