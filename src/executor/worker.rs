use crate::{
    cancellation::CancellationToken,
    coordination::{Disposition, StateSignal},
    executor::{
        ExecutorCore, ExecutorState,
        queue::{MergedQueue, WorkItem},
        stats::{WorkerId, WorkerTimings},
    },
    lease::WorkerLease,
    source::{ExecutionState, Selection},
    types::ExecutionFailure,
    utils::panic_message,
};
use std::{
    panic::{self, AssertUnwindSafe},
    time::Instant,
};
use tracing::{debug, warn};

/// Queue a worker loop draws from.
#[derive(Debug)]
pub(super) enum QueueTarget<'a> {
    /// The executor-wide queue in the coordination state.
    Shared,
    /// A queue private to the calling thread of `process`.
    Private(&'a mut MergedQueue),
}

impl QueueTarget<'_> {
    fn resolve<'q>(&'q mut self, shared: &'q mut MergedQueue) -> &'q mut MergedQueue {
        match self {
            Self::Shared => shared,
            Self::Private(queue) => &mut **queue,
        }
    }
}

/// Lease a worker loop runs under.
#[derive(Debug)]
pub(super) enum LeaseSlot<'a> {
    /// The calling thread's own lease. Only unlocked and relocked here,
    /// never given back for good.
    Borrowed(&'a mut WorkerLease),
    /// Created for a background thread and released when its loop ends.
    Owned(WorkerLease),
}

impl LeaseSlot<'_> {
    fn lease(&mut self) -> &mut WorkerLease {
        match self {
            Self::Borrowed(lease) => &mut **lease,
            Self::Owned(lease) => lease,
        }
    }
}

/// One thread's select / execute / report loop.
#[derive(Debug)]
pub(super) struct ExecutorWorker<'a> {
    core: &'a ExecutorCore,
    queue: QueueTarget<'a>,
    lease: LeaseSlot<'a>,
    id: WorkerId,
    timings: WorkerTimings,
}

impl<'a> ExecutorWorker<'a> {
    /// Registers a new loop. Without a `lease` to borrow, a fresh one is
    /// created and owned by the loop.
    pub(super) fn start(
        core: &'a ExecutorCore,
        queue: QueueTarget<'a>,
        lease: Option<&'a mut WorkerLease>,
    ) -> Self {
        let (id, lease) = core.coordinator.lock_state(|state, _| {
            let id = state.workers.start_worker();
            let lease = match lease {
                Some(lease) => LeaseSlot::Borrowed(lease),
                None => LeaseSlot::Owned(state.leases.new_lease()),
            };
            (id, lease)
        });
        Self {
            core,
            queue,
            lease,
            id,
            timings: WorkerTimings::start(),
        }
    }

    /// Runs until the queue has nothing more to start.
    pub(super) fn run(mut self) {
        while let Some(item) = self.next_item() {
            debug!(worker = %self.id, item = ?item, "started");
            let failure = self.execute(&*item);
            self.mark_finished(item, failure);
        }

        let Self {
            core,
            lease,
            id,
            timings,
            ..
        } = self;
        let background = matches!(lease, LeaseSlot::Owned(_));
        debug!(
            worker = %id,
            busy_ms = timings.busy().as_millis(),
            idle_ms = timings.idle().as_millis(),
            "worker finished"
        );
        let collect_stats = core.config.collect_stats;
        core.coordinator.lock_state(|state, signal| {
            if let LeaseSlot::Owned(mut lease) = lease {
                lease.unlock(&mut state.leases);
            }
            state
                .workers
                .finish(id, background, collect_stats.then_some(timings));
            signal.notify_state_change();
        });
    }

    /// Blocks until a unit is selected, or returns `None` once the queue
    /// has nothing more to start.
    ///
    /// A work source panicking during selection is fatal to every queued
    /// plan, but not to this thread: the loop just ends.
    fn next_item(&mut self) -> Option<Box<dyn WorkItem>> {
        let started = Instant::now();
        let Self {
            core,
            queue,
            lease,
            id,
            ..
        } = self;
        let id = *id;
        let cancellation = &core.cancellation;
        let item = core.coordinator.with_state_lock(|state, signal| {
            let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
                try_select(state, signal, queue, lease, id, cancellation)
            }));
            attempt.unwrap_or_else(|payload| {
                let failure = ExecutionFailure::Panicked(panic_message(payload));
                warn!(worker = %id, %failure, "work source panicked, aborting all plans");
                state.queue.abort_all_and_fail(failure);
                signal.notify_state_change();
                Disposition::Finished(None)
            })
        });
        self.timings.select += started.elapsed();
        item
    }

    fn execute(&mut self, item: &dyn WorkItem) -> Option<ExecutionFailure> {
        let started = Instant::now();
        let failure = item.execute(self.lease.lease());
        self.timings.execute += started.elapsed();
        failure
    }

    fn mark_finished(&mut self, item: Box<dyn WorkItem>, failure: Option<ExecutionFailure>) {
        let started = Instant::now();
        let id = self.id;
        self.core.coordinator.lock_state(|state, signal| {
            if let Err(failure) = item.finished(failure) {
                warn!(worker = %id, %failure, "recording a finished unit failed, aborting all plans");
                state.queue.abort_all_and_fail(failure);
            }
            // A completion may unblock dependents, or be the last one a waiter
            // is blocked on.
            signal.notify_state_change();
        });
        self.timings.mark_finished += started.elapsed();
    }
}

/// One attempt at selecting a unit, run under the coordination lock.
fn try_select(
    state: &mut ExecutorState,
    signal: &StateSignal,
    queue: &mut QueueTarget<'_>,
    lease: &mut LeaseSlot<'_>,
    id: WorkerId,
    cancellation: &CancellationToken,
) -> Disposition<Option<Box<dyn WorkItem>>> {
    let ExecutorState {
        queue: shared_queue,
        leases,
        workers,
    } = state;
    let queue = queue.resolve(shared_queue);
    let lease = lease.lease();
    workers.finish_waiting(id);

    if cancellation.is_cancellation_requested() {
        queue.cancel_execution();
    }

    match queue.execution_state() {
        ExecutionState::NoMoreWorkToStart => return Disposition::Finished(None),
        ExecutionState::NoWorkReadyToStart => {
            workers.start_waiting(id);
            if lease.unlock(leases) {
                signal.notify_state_change();
            }
            return Disposition::Retry;
        }
        ExecutionState::MaybeWorkReadyToStart => {}
    }

    let acquired_now = !lease.is_locked_by_current_thread();
    if !lease.try_lock(leases) {
        // Work may be ready but this thread cannot start it, which does not
        // count as waiting for work.
        return Disposition::Retry;
    }

    match queue.select_next() {
        Ok(Selection::Item(item)) => Disposition::Finished(Some(item)),
        Ok(Selection::NoMoreWorkToStart) => Disposition::Finished(None),
        Ok(Selection::NoWorkReadyToStart) => {
            workers.start_waiting(id);
            if lease.unlock(leases) {
                signal.notify_state_change();
            }
            Disposition::Retry
        }
        Err(failure) => {
            if acquired_now {
                lease.unlock(leases);
            }
            warn!(worker = %id, %failure, "selecting work failed, aborting all plans");
            // The shared queue holds every live plan, the calling thread's
            // included.
            shared_queue.abort_all_and_fail(failure);
            signal.notify_state_change();
            Disposition::Finished(None)
        }
    }
}
