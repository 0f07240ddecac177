use crate::{source::DiagnosticNode, types::IndexMap};
use core::time::Duration;
use std::time::Instant;
use tracing::info;

/// Identifier of a running worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("worker-{_0}")]
pub(super) struct WorkerId(u64);

/// What a worker loop is doing, as far as deadlock detection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WorkerHealth {
    /// Selecting, executing or waiting for a lease.
    Running,
    /// Blocked because no plan has work ready.
    Waiting,
}

/// Time a worker loop spent in each phase.
#[derive(Debug, Clone)]
pub(super) struct WorkerTimings {
    started: Instant,
    pub(super) select: Duration,
    pub(super) execute: Duration,
    pub(super) mark_finished: Duration,
}

impl WorkerTimings {
    pub(super) fn start() -> Self {
        Self {
            started: Instant::now(),
            select: Duration::ZERO,
            execute: Duration::ZERO,
            mark_finished: Duration::ZERO,
        }
    }

    /// Time spent executing units.
    pub(super) fn busy(&self) -> Duration {
        self.execute
    }

    /// Lifetime of the loop minus the busy time.
    pub(super) fn idle(&self) -> Duration {
        self.started.elapsed().saturating_sub(self.execute)
    }
}

/// Book of live worker loops. Lives inside the coordination state.
#[derive(Debug, Default)]
pub(super) struct WorkerRegistry {
    workers: IndexMap<WorkerId, WorkerHealth>,
    next_id: u64,
    stopped: usize,
    live_background: usize,
    finished_timings: Vec<WorkerTimings>,
}

impl WorkerRegistry {
    pub(super) fn start_worker(&mut self) -> WorkerId {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        self.workers.insert(id, WorkerHealth::Running);
        id
    }

    pub(super) fn start_waiting(&mut self, id: WorkerId) {
        if let Some(health) = self.workers.get_mut(&id) {
            debug_assert_eq!(*health, WorkerHealth::Running, "{id} already waiting");
            *health = WorkerHealth::Waiting;
        }
    }

    pub(super) fn finish_waiting(&mut self, id: WorkerId) {
        if let Some(health) = self.workers.get_mut(&id) {
            *health = WorkerHealth::Running;
        }
    }

    /// Records that a loop terminated. `timings` is kept for the statistics
    /// report when given.
    pub(super) fn finish(&mut self, id: WorkerId, background: bool, timings: Option<WorkerTimings>) {
        self.workers.shift_remove(&id);
        self.stopped += 1;
        if background {
            self.live_background = self.live_background.saturating_sub(1);
        }
        self.finished_timings.extend(timings);
    }

    pub(super) fn set_live_background(&mut self, count: usize) {
        self.live_background = count;
    }

    /// Background loops started but not yet terminated.
    pub(super) fn live_background(&self) -> usize {
        self.live_background
    }

    pub(super) fn take_finished_timings(&mut self) -> Vec<WorkerTimings> {
        core::mem::take(&mut self.finished_timings)
    }

    /// Worker lines appended to a deadlock report.
    pub(super) fn summary(&self) -> [DiagnosticNode; 2] {
        let waiting = self
            .workers
            .values()
            .filter(|health| **health == WorkerHealth::Waiting)
            .count();
        [
            DiagnosticNode::new(format!("Workers waiting for work: {waiting}")),
            DiagnosticNode::new(format!("Stopped workers: {}", self.stopped)),
        ]
    }
}

/// Logs averages over the given finished loops.
pub(super) fn report(timings: &[WorkerTimings]) {
    info!(worker_count = timings.len(), "worker thread statistics");
    if timings.is_empty() {
        return;
    }
    let average = |phase: fn(&WorkerTimings) -> Duration| {
        let total: Duration = timings.iter().map(phase).sum();
        let count = u32::try_from(timings.len()).unwrap_or(u32::MAX);
        format!("{:.2}ms", (total / count).as_secs_f64() * 1000.0)
    };
    info!(
        select = %average(|t| t.select),
        execute = %average(|t| t.execute),
        mark_finished = %average(|t| t.mark_finished),
        "average time per worker"
    );
}
