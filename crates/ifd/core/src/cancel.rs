//! Cooperative cancellation shared between a wait task and the provider call
//! it is blocked in.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

/// Token handed to blocking provider calls.
///
/// Cloning yields a handle to the same token. Callbacks registered with
/// [`CancellationToken::on_cancel`] run once, on the thread that cancels.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and run the registered callbacks
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same token
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `callback` when the token is cancelled, or right away if it
    /// already is
    pub fn on_cancel<F: FnOnce() + Send + 'static>(&self, callback: F) {
        let mut callbacks = self.inner.callbacks.lock();
        if self.is_cancelled() {
            drop(callbacks);
            callback();
        } else {
            callbacks.push(Box::new(callback));
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callbacks_run_once() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let clone = token.clone();
        clone.cancel();
        token.cancel();

        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_registration_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same_as() {
        let token = CancellationToken::new();
        assert!(token.same_as(&token.clone()));
        assert!(!token.same_as(&CancellationToken::new()));
    }
}
