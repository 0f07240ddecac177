mod queue;
mod stats;
mod worker;

use crate::{
    cancellation::CancellationToken,
    config::{ConfigError, ExecutorConfig},
    coordination::{Coordinator, Disposition},
    executor::{
        queue::{MergedQueue, Plan, PlanDetails},
        stats::WorkerRegistry,
        worker::{ExecutorWorker, QueueTarget},
    },
    lease::{LeaseId, LeasePool, LeasePoolId, WorkerLease},
    source::WorkSource,
    sync::{AtomicBool, Mutex, Ordering, WorkerPool},
    types::{BoxError, ExecutionFailure, ExecutionResult},
};
use core::time::Duration;
use derive_more::Debug;
use std::{
    sync::{Arc, PoisonError},
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Pause between health checks while the grace period runs.
const HEALTH_RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Error raised synchronously by [`PlanExecutor`] for misuse, as opposed to
/// unit failures which are reported through [`ExecutionResult`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExecutorError {
    /// Work was submitted after the executor was stopped.
    #[error("This queue has been closed.")]
    QueueClosed,
    /// The executor was stopped while submitted work had not completed.
    #[error("Not all work has completed: {remaining} plan(s) still queued.")]
    WorkPending {
        /// Number of plans still queued.
        remaining: usize,
    },
    /// The lease handed to `process` was created by another executor.
    #[error("{lease} was not created by this executor.")]
    ForeignLease {
        /// The offending lease.
        lease: LeaseId,
    },
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Everything guarded by the coordination lock.
#[derive(Debug)]
struct ExecutorState {
    /// Queue spanning every plan submitted to the executor.
    queue: MergedQueue,
    leases: LeasePool,
    workers: WorkerRegistry,
}

/// Part of the executor shared with background threads.
#[derive(Debug)]
struct ExecutorCore {
    coordinator: Coordinator<ExecutorState>,
    cancellation: CancellationToken,
    config: ExecutorConfig,
}

impl ExecutorCore {
    fn run_background_worker(&self) {
        ExecutorWorker::start(self, QueueTarget::Shared, None).run();
    }
}

/// Executes the units of submitted work sources on a bounded set of
/// threads.
///
/// Each call to [`PlanExecutor::process`] registers its work source in a
/// queue shared by all background workers, then works on that source from
/// the calling thread as well until it completes. Background threads are
/// started on the first submission. At most `max_workers` threads, calling
/// threads included, execute units at any instant: each one has to hold a
/// [`WorkerLease`].
#[derive(Debug)]
pub struct PlanExecutor {
    core: Arc<ExecutorCore>,
    lease_pool: LeasePoolId,
    workers_started: AtomicBool,
    #[debug(skip)]
    pool: Mutex<Option<WorkerPool>>,
}

impl PlanExecutor {
    /// Creates an executor. No thread is started until the first call to
    /// [`PlanExecutor::process`].
    ///
    /// Cancelling `cancellation` wakes every blocked worker so they observe
    /// it. It must not be cancelled from inside a [`WorkSource`] method.
    ///
    /// # Errors
    /// If `config.max_workers` is zero.
    pub fn new(config: ExecutorConfig, cancellation: CancellationToken) -> Result<Self, ConfigError> {
        let worker_count = config.worker_count()?;
        let leases = LeasePool::new(worker_count);
        let lease_pool = leases.id();
        let core = Arc::new(ExecutorCore {
            coordinator: Coordinator::new(ExecutorState {
                queue: MergedQueue::new(false),
                leases,
                workers: WorkerRegistry::default(),
            }),
            cancellation: cancellation.clone(),
            config,
        });
        let weak = Arc::downgrade(&core);
        cancellation.add_callback(move || {
            if let Some(core) = weak.upgrade() {
                core.coordinator.notify_state_change();
            }
        });
        Ok(Self {
            core,
            lease_pool,
            workers_started: AtomicBool::new(false),
            pool: Mutex::new(None),
        })
    }

    /// Executes every unit of `source` with `action` and blocks until the
    /// source reports that all execution is complete.
    ///
    /// The calling thread works on `source` itself while waiting, under
    /// `lease`. The lease is unlocked while there is nothing for this thread
    /// to do, and is held again when this returns.
    ///
    /// `action` receives the lease of the thread executing the unit. Passing
    /// it to a nested `process` call submits more work without needing a
    /// second lease.
    ///
    /// Unit failures, panics included, never surface as an `Err`: the work
    /// source records them and they come back in the [`ExecutionResult`].
    ///
    /// # Errors
    /// [`ExecutorError::QueueClosed`] if the executor has been stopped,
    /// [`ExecutorError::ForeignLease`] if `lease` belongs to another
    /// executor.
    pub fn process<S, A>(
        &self,
        lease: &mut WorkerLease,
        source: Arc<S>,
        action: A,
    ) -> Result<ExecutionResult, ExecutorError>
    where
        S: WorkSource,
        A: Fn(&S::Item, &mut WorkerLease) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        if lease.pool() != self.lease_pool {
            return Err(ExecutorError::ForeignLease { lease: lease.id() });
        }
        let plan: Arc<dyn Plan> = Arc::new(PlanDetails::new(Arc::clone(&source), action));
        self.core.coordinator.lock_state(|state, signal| {
            state.queue.add(Arc::clone(&plan))?;
            signal.notify_state_change();
            Ok::<_, ExecutorError>(())
        })?;

        self.maybe_start_workers();

        // This thread would only block waiting for the plan otherwise, so it
        // works on it too.
        let mut this_plan_only = MergedQueue::new(true);
        this_plan_only.add(plan)?;
        ExecutorWorker::start(
            &self.core,
            QueueTarget::Private(&mut this_plan_only),
            Some(&mut *lease),
        )
        .run();

        let failures = self.await_completion(&*source, lease);
        Ok(ExecutionResult::maybe_failed(failures))
    }

    /// Blocks until `source` is complete, then collects its failures.
    fn await_completion<S: WorkSource>(
        &self,
        source: &S,
        lease: &mut WorkerLease,
    ) -> Vec<ExecutionFailure> {
        self.core.coordinator.with_state_lock(|state, signal| {
            if !source.all_execution_complete() {
                // Let another thread use the capacity while this one waits.
                if lease.unlock(&mut state.leases) {
                    signal.notify_state_change();
                }
                return Disposition::Retry;
            }
            // Finishing up requires holding the lease again.
            if !lease.try_lock(&mut state.leases) {
                return Disposition::Retry;
            }
            let mut failures = Vec::new();
            source.collect_failures(&mut failures);
            state.queue.remove_finished_plans();
            Disposition::Finished(failures)
        })
    }

    fn maybe_start_workers(&self) {
        if self.workers_started.load(Ordering::Acquire)
            || self
                .workers_started
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }
        let executor_count = self.core.config.max_workers;
        debug!(executor_count, "using {executor_count} parallel executor threads");
        let background = executor_count - 1;
        if background == 0 {
            return;
        }

        self.core
            .coordinator
            .lock_state(|state, _| state.workers.set_live_background(background));
        let core = Arc::clone(&self.core);
        let spawned = WorkerPool::spawn(
            background,
            &self.core.config.thread_name_prefix,
            move |_| core.run_background_worker(),
        );
        match spawned {
            Ok(pool) => *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(pool),
            Err(error) => {
                error!(%error, "failed to start executor threads, only calling threads will run work");
                self.core.coordinator.lock_state(|state, signal| {
                    state.workers.set_live_background(0);
                    signal.notify_state_change();
                });
            }
        }
    }

    /// Aborts every queued plan with [`ExecutionFailure::NoProgress`] if none
    /// of them can start any work, after logging why.
    ///
    /// Re-checks for up to [`ExecutorConfig::health_grace_period`] first:
    /// right after work becomes ready there is a short window in which every
    /// worker still looks idle. Meant to be called periodically by a
    /// watchdog. The abort reaches `process` callers through their results.
    pub fn assert_healthy(&self) {
        let expiry = Instant::now() + self.core.config.health_grace_period;
        loop {
            let now = Instant::now();
            if now >= expiry {
                break;
            }
            let healthy = self
                .core
                .coordinator
                .lock_state(|state, _| state.queue.health_check().is_none());
            if healthy {
                return;
            }
            std::thread::sleep(HEALTH_RECHECK_INTERVAL.min(expiry - now));
        }
        self.core.coordinator.lock_state(|state, signal| {
            if state.queue.assert_healthy(state.workers.summary()) {
                signal.notify_state_change();
            }
        });
    }

    /// Closes the shared queue and shuts the worker threads down.
    ///
    /// Every submitted source must have completed. Threads are shut down
    /// even if that is not the case. Calling it again is harmless.
    ///
    /// # Errors
    /// [`ExecutorError::WorkPending`] if some plan has not completed; the
    /// executor then still accepts work.
    pub fn stop(&self) -> Result<(), ExecutorError> {
        let closed = self.core.coordinator.lock_state(|state, signal| {
            let closed = state.queue.close();
            signal.notify_state_change();
            closed
        });
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let finished_timings = self.core.coordinator.with_state_lock(|state, _| {
            if closed.is_ok() && state.workers.live_background() > 0 {
                return Disposition::Retry;
            }
            Disposition::Finished(state.workers.take_finished_timings())
        });
        if let Some(pool) = pool {
            if closed.is_ok() {
                pool.shutdown();
            } else {
                // Workers still have plans to run; let them go on detached.
                drop(pool);
            }
        }
        if self.core.config.collect_stats {
            stats::report(&finished_timings);
        }
        closed
    }

    /// Creates a lease bound by this executor's worker count. It starts
    /// unlocked.
    pub fn new_worker_lease(&self) -> WorkerLease {
        self.core
            .coordinator
            .lock_state(|state, _| state.leases.new_lease())
    }

    /// Blocks until `lease` is held by the current thread.
    ///
    /// # Panics
    /// If `lease` was created by another executor.
    pub fn acquire_worker_lease(&self, lease: &mut WorkerLease) {
        self.assert_owned(lease);
        self.core.coordinator.with_state_lock(|state, _| {
            if lease.try_lock(&mut state.leases) {
                Disposition::Finished(())
            } else {
                Disposition::Retry
            }
        });
    }

    /// Unlocks `lease` if held.
    ///
    /// # Panics
    /// If `lease` was created by another executor.
    pub fn release_worker_lease(&self, lease: &mut WorkerLease) {
        self.assert_owned(lease);
        self.core.coordinator.lock_state(|state, signal| {
            if lease.unlock(&mut state.leases) {
                signal.notify_state_change();
            }
        });
    }

    /// Runs `f` with a freshly acquired lease, releasing it afterwards even
    /// if `f` panics.
    pub fn with_worker_lease<R>(&self, f: impl FnOnce(&mut WorkerLease) -> R) -> R {
        struct Release<'a> {
            executor: &'a PlanExecutor,
            lease: WorkerLease,
        }

        impl Drop for Release<'_> {
            fn drop(&mut self) {
                self.executor.release_worker_lease(&mut self.lease);
            }
        }

        let mut guard = Release {
            executor: self,
            lease: self.new_worker_lease(),
        };
        self.acquire_worker_lease(&mut guard.lease);
        f(&mut guard.lease)
    }

    fn assert_owned(&self, lease: &WorkerLease) {
        assert_eq!(
            lease.pool(),
            self.lease_pool,
            "{} was not created by this executor",
            lease.id()
        );
    }

    /// Number of leases currently held across all threads.
    pub fn held_worker_leases(&self) -> usize {
        self.core
            .coordinator
            .lock_state(|state, _| state.leases.locked())
    }
}

impl Drop for PlanExecutor {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            warn!(%error, "plan executor dropped with work outstanding");
        }
    }
}
