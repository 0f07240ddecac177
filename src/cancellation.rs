use crate::sync::{AtomicBool, Mutex, Ordering};
use derive_more::Debug;
use std::sync::{Arc, PoisonError};

type Callback = Box<dyn Fn() + Send + Sync>;

/// Cooperative cancellation flag shared between the party requesting
/// cancellation and the executor.
///
/// Clones observe the same flag.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    requested: AtomicBool,
    #[debug(skip)]
    callbacks: Mutex<Vec<Callback>>,
}

impl CancellationToken {
    /// Token that has not been cancelled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                requested: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Requests cancellation and runs registered callbacks. Only the first
    /// call has an effect.
    pub fn cancel(&self) {
        if self.inner.requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = core::mem::take(
            &mut *self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for callback in callbacks {
            callback();
        }
    }

    /// Whether [`CancellationToken::cancel`] has been called.
    pub fn is_cancellation_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Registers `callback` to run once on cancellation. Runs it immediately
    /// if cancellation was already requested.
    pub fn add_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.is_cancellation_requested() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn callbacks_run_once() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        token.add_callback(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert!(!token.is_cancellation_requested());

        token.clone().cancel();
        token.cancel();
        assert!(token.is_cancellation_requested());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn late_callback_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        token.add_callback(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
