#![allow(dead_code)]

use cpe::{
    source::{DiagnosticNode, Diagnostics, ExecutionState, Selection, WorkSource},
    types::{BoxError, ExecutionFailure},
};
use core::fmt;
use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread,
};
use tracing::{
    Event, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::layer::{Context, Layer};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Running,
    Done,
    Skipped,
}

/// Work source over numbered units with explicit dependencies.
///
/// Records every interaction the executor has with it.
#[derive(Debug)]
pub struct GraphSource {
    state: Mutex<GraphState>,
}

#[derive(Debug)]
pub struct GraphState {
    pub status: Vec<Status>,
    pub deps: Vec<Vec<usize>>,
    pub selections: Vec<usize>,
    pub failures: Vec<ExecutionFailure>,
    /// Units are never ready while set.
    pub blocked: bool,
    /// `finished_executing` reports a bookkeeping error for this unit.
    pub fail_finish_of: Option<usize>,
    /// `execution_state` panics on threads whose name starts with this.
    pub panic_on_threads: Option<&'static str>,
    pub double_selection: bool,
    pub state_queries: usize,
    pub cancel_calls: usize,
    pub abort_calls: usize,
}

impl GraphSource {
    /// Units `0..deps.len()`, unit `i` waiting on `deps[i]`.
    pub fn new(deps: Vec<Vec<usize>>) -> Self {
        Self {
            state: Mutex::new(GraphState {
                status: vec![Status::Pending; deps.len()],
                deps,
                selections: Vec::new(),
                failures: Vec::new(),
                blocked: false,
                fail_finish_of: None,
                panic_on_threads: None,
                double_selection: false,
                state_queries: 0,
                cancel_calls: 0,
                abort_calls: 0,
            }),
        }
    }

    pub fn independent(count: usize) -> Self {
        Self::new(vec![Vec::new(); count])
    }

    /// `0 <- 1 <- 2 ...`: each unit waits on its predecessor.
    pub fn chain(count: usize) -> Self {
        Self::new((0..count).map(|i| i.checked_sub(1).into_iter().collect()).collect())
    }

    pub fn blocked(count: usize) -> Self {
        let source = Self::independent(count);
        source.state().blocked = true;
        source
    }

    pub fn state(&self) -> MutexGuard<'_, GraphState> {
        self.state.lock().unwrap()
    }

    /// Whether the executor has looked at this source yet, meaning it has
    /// been queued.
    pub fn observed(&self) -> bool {
        self.state().state_queries > 0
    }

    fn skip_pending(state: &mut GraphState) -> usize {
        let mut skipped = 0;
        for status in &mut state.status {
            if *status == Status::Pending {
                *status = Status::Skipped;
                skipped += 1;
            }
        }
        skipped
    }
}

impl GraphState {
    fn ready(&self, unit: usize) -> bool {
        !self.blocked
            && self.status[unit] == Status::Pending
            && self.deps[unit].iter().all(|dep| self.status[*dep] == Status::Done)
    }

    fn any(&self, status: Status) -> bool {
        self.status.contains(&status)
    }
}

impl WorkSource for GraphSource {
    type Item = usize;

    fn execution_state(&self) -> ExecutionState {
        let mut state = self.state();
        state.state_queries += 1;
        if let Some(prefix) = state.panic_on_threads {
            let name = thread::current().name().unwrap_or_default().to_owned();
            if name.starts_with(prefix) {
                drop(state);
                panic!("execution state unavailable on {name}");
            }
        }
        if (0..state.status.len()).any(|unit| state.ready(unit)) {
            ExecutionState::MaybeWorkReadyToStart
        } else if state.any(Status::Pending) {
            ExecutionState::NoWorkReadyToStart
        } else {
            ExecutionState::NoMoreWorkToStart
        }
    }

    fn select_next(&self) -> Result<Selection<usize>, BoxError> {
        let mut state = self.state();
        if let Some(unit) = (0..state.status.len()).find(|unit| state.ready(*unit)) {
            if state.selections.contains(&unit) {
                state.double_selection = true;
            }
            state.status[unit] = Status::Running;
            state.selections.push(unit);
            return Ok(Selection::Item(unit));
        }
        Ok(if state.any(Status::Pending) {
            Selection::NoWorkReadyToStart
        } else {
            Selection::NoMoreWorkToStart
        })
    }

    fn all_execution_complete(&self) -> bool {
        let state = self.state();
        !state.any(Status::Pending) && !state.any(Status::Running)
    }

    fn collect_failures(&self, failures: &mut Vec<ExecutionFailure>) {
        failures.extend(self.state().failures.iter().cloned());
    }

    fn finished_executing(
        &self,
        item: usize,
        failure: Option<ExecutionFailure>,
    ) -> Result<(), BoxError> {
        let mut state = self.state();
        if state.status[item] != Status::Running {
            return Err(format!("unit {item} is not running").into());
        }
        state.status[item] = Status::Done;
        state.failures.extend(failure);
        if state.fail_finish_of == Some(item) {
            return Err(format!("lost track of unit {item}").into());
        }
        Ok(())
    }

    fn cancel_execution(&self) {
        let mut state = self.state();
        state.cancel_calls += 1;
        if Self::skip_pending(&mut state) > 0 {
            state.failures.push(ExecutionFailure::Cancelled);
        }
    }

    fn abort_all_and_fail(&self, cause: ExecutionFailure) {
        let mut state = self.state();
        state.abort_calls += 1;
        Self::skip_pending(&mut state);
        state.failures.push(cause);
    }

    fn health_diagnostics(&self) -> Diagnostics {
        let state = self.state();
        let pending: Vec<usize> = (0..state.status.len())
            .filter(|unit| state.status[*unit] == Status::Pending)
            .collect();
        let mut details = DiagnosticNode::new(format!("graph with {} units", state.status.len()));
        for unit in &pending {
            details = details.with_child(DiagnosticNode::new(format!("unit {unit} is queued")));
        }
        Diagnostics {
            can_make_progress: pending.is_empty() || !state.blocked,
            details,
        }
    }
}

/// Tracing layer keeping every event recorded on the threads it is the
/// default subscriber for.
#[derive(Debug, Clone, Default)]
pub struct CapturedEvents(Arc<Mutex<Vec<CapturedEvent>>>);

impl CapturedEvents {
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn find(&self, message: &str) -> Option<CapturedEvent> {
        self.events().into_iter().find(|event| event.message == message)
    }
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
    fn on_event(&self, event: &Event<'_>, _: Context<'_, S>) {
        let mut captured = CapturedEvent::default();
        event.record(&mut captured);
        self.0.lock().unwrap().push(captured);
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapturedEvent {
    pub message: String,
    pub fields: Vec<(&'static str, String)>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value.as_str())
    }
}

impl Visit for CapturedEvent {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let value = format!("{value:?}");
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name(), value));
        }
    }
}
