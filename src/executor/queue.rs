use crate::{
    executor::ExecutorError,
    lease::WorkerLease,
    source::{DiagnosticNode, Diagnostics, ExecutionState, Selection, WorkSource},
    types::{BoxError, ExecutionFailure},
    utils::{guard_bookkeeping, panic_message},
};
use core::fmt;
use derive_more::Debug;
use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{error, warn};

const NO_PROGRESS_HEADER: &str = "Unable to make progress running work. The following items are \
                                  queued for execution but none of them can be started:";

/// A unit selected from some plan, to be executed outside the coordination
/// lock and then reported back to its owning work source.
pub(super) trait WorkItem: fmt::Debug {
    /// Runs the plan's action against the unit under `lease`, capturing any
    /// failure.
    fn execute(&self, lease: &mut WorkerLease) -> Option<ExecutionFailure>;

    /// Reports the outcome to the owning work source. Must be called under
    /// the coordination lock.
    fn finished(self: Box<Self>, failure: Option<ExecutionFailure>) -> Result<(), ExecutionFailure>;
}

/// Type-erased work source plus the action executing its units.
///
/// Every method must be called under the coordination lock.
pub(super) trait Plan: Send + Sync {
    fn execution_state(&self) -> ExecutionState;
    fn select_next(&self) -> Result<Selection<Box<dyn WorkItem>>, ExecutionFailure>;
    fn all_execution_complete(&self) -> bool;
    fn cancel_execution(&self);
    fn abort_all_and_fail(&self, cause: ExecutionFailure);
    fn health_diagnostics(&self) -> Diagnostics;
}

/// A submitted work source paired with its action.
#[derive(Debug)]
pub(super) struct PlanDetails<S, A> {
    source: Arc<S>,
    #[debug(skip)]
    action: Arc<A>,
}

impl<S, A> PlanDetails<S, A> {
    pub(super) fn new(source: Arc<S>, action: A) -> Self {
        Self {
            source,
            action: Arc::new(action),
        }
    }
}

impl<S, A> Plan for PlanDetails<S, A>
where
    S: WorkSource,
    A: Fn(&S::Item, &mut WorkerLease) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn execution_state(&self) -> ExecutionState {
        self.source.execution_state()
    }

    fn select_next(&self) -> Result<Selection<Box<dyn WorkItem>>, ExecutionFailure> {
        let selection = guard_bookkeeping(|| self.source.select_next())?;
        Ok(selection.map(|item| {
            Box::new(SelectedItem {
                item,
                source: Arc::clone(&self.source),
                action: Arc::clone(&self.action),
            }) as Box<dyn WorkItem>
        }))
    }

    fn all_execution_complete(&self) -> bool {
        self.source.all_execution_complete()
    }

    // Both run for every plan in a queue, so one faulty source must not keep
    // the others from hearing about it.
    fn cancel_execution(&self) {
        let cancelled = guard_bookkeeping(|| {
            self.source.cancel_execution();
            Ok(())
        });
        if let Err(failure) = cancelled {
            warn!(%failure, "cancelling a work source failed");
        }
    }

    fn abort_all_and_fail(&self, cause: ExecutionFailure) {
        let aborted = guard_bookkeeping(|| {
            self.source.abort_all_and_fail(cause);
            Ok(())
        });
        if let Err(failure) = aborted {
            warn!(%failure, "aborting a work source failed");
        }
    }

    fn health_diagnostics(&self) -> Diagnostics {
        self.source.health_diagnostics()
    }
}

struct SelectedItem<S: WorkSource, A> {
    item: S::Item,
    source: Arc<S>,
    action: Arc<A>,
}

impl<S: WorkSource, A> fmt::Debug for SelectedItem<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.item, f)
    }
}

impl<S, A> WorkItem for SelectedItem<S, A>
where
    S: WorkSource,
    A: Fn(&S::Item, &mut WorkerLease) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn execute(&self, lease: &mut WorkerLease) -> Option<ExecutionFailure> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.action)(&self.item, lease))) {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(ExecutionFailure::action(error)),
            Err(payload) => Some(ExecutionFailure::Panicked(panic_message(payload))),
        }
    }

    fn finished(self: Box<Self>, failure: Option<ExecutionFailure>) -> Result<(), ExecutionFailure> {
        let Self { item, source, .. } = *self;
        guard_bookkeeping(|| source.finished_executing(item, failure))
    }
}

/// Several plans presented as a single source of work.
///
/// Plans are scanned newest first: a freshly submitted plan is most likely
/// something the already running plans are waiting on. Every method must be
/// called under the coordination lock, except on a queue no other thread can
/// reach yet.
#[derive(Debug)]
pub(super) struct MergedQueue {
    #[debug(skip)]
    plans: VecDeque<Arc<dyn Plan>>,
    /// Report `NoMoreWorkToStart` as soon as the last plan is gone instead of
    /// waiting for `close`.
    auto_finish: bool,
    finished: bool,
}

impl MergedQueue {
    pub(super) fn new(auto_finish: bool) -> Self {
        Self {
            plans: VecDeque::new(),
            auto_finish,
            finished: false,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.plans.len()
    }

    /// Combined state of all plans. Drops plans that are complete.
    pub(super) fn execution_state(&mut self) -> ExecutionState {
        let mut index = 0;
        while let Some(plan) = self.plans.get(index) {
            match plan.execution_state() {
                ExecutionState::MaybeWorkReadyToStart => {
                    return ExecutionState::MaybeWorkReadyToStart;
                }
                ExecutionState::NoMoreWorkToStart if plan.all_execution_complete() => {
                    self.plans.remove(index);
                    continue;
                }
                // Plans with units still in flight stay for health monitoring.
                ExecutionState::NoMoreWorkToStart | ExecutionState::NoWorkReadyToStart => {}
            }
            index += 1;
        }
        if self.nothing_more_to_start() {
            ExecutionState::NoMoreWorkToStart
        } else {
            ExecutionState::NoWorkReadyToStart
        }
    }

    /// First unit any plan can start, newest plan first.
    ///
    /// # Errors
    /// When a work source fails its own bookkeeping.
    pub(super) fn select_next(&mut self) -> Result<Selection<Box<dyn WorkItem>>, ExecutionFailure> {
        let mut index = 0;
        while let Some(plan) = self.plans.get(index) {
            match plan.select_next()? {
                Selection::Item(item) => return Ok(Selection::Item(item)),
                Selection::NoMoreWorkToStart if plan.all_execution_complete() => {
                    self.plans.remove(index);
                    continue;
                }
                Selection::NoMoreWorkToStart | Selection::NoWorkReadyToStart => {}
            }
            index += 1;
        }
        if self.nothing_more_to_start() {
            Ok(Selection::NoMoreWorkToStart)
        } else {
            Ok(Selection::NoWorkReadyToStart)
        }
    }

    fn nothing_more_to_start(&self) -> bool {
        self.finished || (self.auto_finish && self.plans.is_empty())
    }

    /// Puts `plan` at the head of the queue. The caller signals the state
    /// change.
    ///
    /// # Errors
    /// If the queue has been closed.
    pub(super) fn add(&mut self, plan: Arc<dyn Plan>) -> Result<(), ExecutorError> {
        if self.finished {
            return Err(ExecutorError::QueueClosed);
        }
        self.plans.push_front(plan);
        Ok(())
    }

    pub(super) fn remove_finished_plans(&mut self) {
        self.plans.retain(|plan| !plan.all_execution_complete());
    }

    /// Marks the queue finished. The caller signals the state change.
    ///
    /// # Errors
    /// If some plan has not completed; the queue then stays open.
    pub(super) fn close(&mut self) -> Result<(), ExecutorError> {
        self.remove_finished_plans();
        if !self.plans.is_empty() {
            return Err(ExecutorError::WorkPending {
                remaining: self.len(),
            });
        }
        self.finished = true;
        Ok(())
    }

    pub(super) fn cancel_execution(&self) {
        for plan in &self.plans {
            plan.cancel_execution();
        }
    }

    /// Fails every plan with `cause`. The caller signals the state change.
    pub(super) fn abort_all_and_fail(&self, cause: ExecutionFailure) {
        for plan in &self.plans {
            plan.abort_all_and_fail(cause.clone());
        }
    }

    /// Diagnostic tree when work is queued but no plan can start any of it,
    /// `None` while healthy.
    pub(super) fn health_check(&self) -> Option<DiagnosticNode> {
        let mut stuck = Vec::with_capacity(self.plans.len());
        for plan in &self.plans {
            if plan.all_execution_complete() {
                continue;
            }
            let diagnostics = plan.health_diagnostics();
            if diagnostics.can_make_progress {
                return None;
            }
            stuck.push(diagnostics);
        }
        if stuck.is_empty() {
            return None;
        }
        let mut root = DiagnosticNode::new(NO_PROGRESS_HEADER);
        for diagnostics in &stuck {
            diagnostics.describe_to(&mut root);
        }
        Some(root)
    }

    /// Aborts every plan with [`ExecutionFailure::NoProgress`] if none of
    /// them can make progress, logging the diagnostic tree (extended with
    /// `workers`) first. Returns whether it aborted; the caller then signals
    /// the state change.
    pub(super) fn assert_healthy(&self, workers: impl IntoIterator<Item = DiagnosticNode>) -> bool {
        let Some(mut diagnostics) = self.health_check() else {
            return false;
        };
        diagnostics.children.extend(workers);
        error!("{diagnostics}");
        self.abort_all_and_fail(ExecutionFailure::NoProgress);
        true
    }
}
