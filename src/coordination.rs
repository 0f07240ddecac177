use crate::sync::{Condvar, Mutex, MutexGuard};
use core::cell::Cell;
use std::sync::PoisonError;

/// Outcome of one invocation of a state transition run under
/// [`Coordinator::with_state_lock`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition<R> {
    /// The transition is complete; the value is handed back to the caller.
    Finished(R),
    /// The transition cannot make progress yet. The calling thread blocks
    /// until another thread signals a state change, then re-runs it.
    Retry,
}

/// Handle passed to state transitions for announcing that the protected state
/// changed in a way other threads may be waiting for.
#[derive(Debug, Default)]
pub(crate) struct StateSignal(Cell<bool>);

impl StateSignal {
    pub(crate) fn notify_state_change(&self) {
        self.0.set(true);
    }
}

/// A single exclusive lock plus a condition variable implementing the retry
/// protocol shared by every thread of an executor.
///
/// The lock guards bookkeeping only. Nothing long-running may execute inside
/// a state transition.
#[derive(Debug)]
pub(crate) struct Coordinator<S> {
    state: Mutex<S>,
    changed: Condvar,
}

impl<S> Coordinator<S> {
    pub(crate) fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    /// Runs `transition` under the lock until it returns
    /// [`Disposition::Finished`], waiting for a state change between
    /// attempts.
    pub(crate) fn with_state_lock<R>(
        &self,
        mut transition: impl FnMut(&mut S, &StateSignal) -> Disposition<R>,
    ) -> R {
        let mut guard = self.lock();
        loop {
            let signal = StateSignal::default();
            let disposition = transition(&mut *guard, &signal);
            if signal.0.get() {
                self.changed.notify_all();
            }
            match disposition {
                Disposition::Finished(value) => return value,
                Disposition::Retry => {
                    guard = self
                        .changed
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Runs `action` once under the lock.
    pub(crate) fn lock_state<R>(&self, action: impl FnOnce(&mut S, &StateSignal) -> R) -> R {
        let mut action = Some(action);
        self.with_state_lock(|state, signal| match action.take() {
            Some(action) => Disposition::Finished(action(state, signal)),
            None => unreachable!("Coordinator::lock_state"),
        })
    }

    /// Wakes every thread blocked in [`Coordinator::with_state_lock`].
    pub(crate) fn notify_state_change(&self) {
        let _guard = self.lock();
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn retry_blocks_until_another_thread_signals() {
        let coordinator = Arc::new(Coordinator::new(0u32));
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                let mut attempts = 0;
                let seen = coordinator.with_state_lock(|value, _| {
                    attempts += 1;
                    if *value == 3 {
                        Disposition::Finished(*value)
                    } else {
                        Disposition::Retry
                    }
                });
                (seen, attempts)
            })
        };
        for _ in 0..3 {
            coordinator.lock_state(|value, signal| {
                *value += 1;
                signal.notify_state_change();
            });
        }
        let (seen, attempts) = waiter.join().unwrap();
        assert_eq!(seen, 3);
        assert!(attempts >= 1);
    }

    #[test]
    fn lock_state_runs_action_exactly_once() {
        let coordinator = Coordinator::new(Vec::new());
        let len = coordinator.lock_state(|items, _| {
            items.push(1);
            items.len()
        });
        assert_eq!(len, 1);
        coordinator.lock_state(|items, _| assert_eq!(*items, [1]));
    }
}
