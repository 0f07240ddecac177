use crate::types::{BoxError, ExecutionFailure};
use core::fmt::{self, Debug, Display};

/// Aggregate readiness of a work source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    /// Some unit may be ready to start; calling `select_next` is worthwhile.
    MaybeWorkReadyToStart,
    /// Nothing can start until some in-flight unit finishes.
    NoWorkReadyToStart,
    /// Nothing will ever be started again. Units may still be in flight.
    NoMoreWorkToStart,
}

/// Result of asking a work source for its next unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<T> {
    /// A unit that is now in flight and must later be reported through
    /// [`WorkSource::finished_executing`].
    Item(T),
    /// Nothing is ready right now.
    NoWorkReadyToStart,
    /// Nothing will ever be ready again.
    NoMoreWorkToStart,
}

impl<T> Selection<T> {
    /// Maps the selected unit, keeping the other variants.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Selection<U> {
        match self {
            Self::Item(item) => Selection::Item(f(item)),
            Self::NoWorkReadyToStart => Selection::NoWorkReadyToStart,
            Self::NoMoreWorkToStart => Selection::NoMoreWorkToStart,
        }
    }
}

/// A graph of schedulable units, as seen by the executor.
///
/// Which units are ready and in which order they start is entirely up to
/// the implementation. The executor guarantees that every method is invoked
/// while its coordination lock is held, so implementations never observe
/// concurrent calls; whatever interior mutability they use is uncontended.
/// No method may block.
pub trait WorkSource: Send + Sync + 'static {
    /// The unit of work handed to the action.
    type Item: Debug + Send + 'static;

    /// Current aggregate state. Must not change what `select_next` returns.
    fn execution_state(&self) -> ExecutionState;

    /// Selects the next runnable unit and marks it in flight.
    ///
    /// # Errors
    /// Bookkeeping corruption. The executor then aborts every plan sharing
    /// the queue.
    fn select_next(&self) -> Result<Selection<Self::Item>, BoxError>;

    /// `true` once nothing more will start and every started unit finished.
    fn all_execution_complete(&self) -> bool;

    /// Appends accumulated failures to `failures`.
    fn collect_failures(&self, failures: &mut Vec<ExecutionFailure>);

    /// Records the outcome of a unit previously returned by `select_next`.
    ///
    /// # Errors
    /// Bookkeeping violations such as an unknown unit. Treated like a
    /// `select_next` failure.
    fn finished_executing(
        &self,
        item: Self::Item,
        failure: Option<ExecutionFailure>,
    ) -> Result<(), BoxError>;

    /// Requests best-effort early termination.
    fn cancel_execution(&self);

    /// Fails every remaining unit with `cause`.
    fn abort_all_and_fail(&self, cause: ExecutionFailure);

    /// Reports whether any queued unit could still start, for deadlock
    /// detection.
    fn health_diagnostics(&self) -> Diagnostics;
}

/// Health report of a single work source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    /// Whether some queued unit can still be started.
    pub can_make_progress: bool,
    /// Human-readable description of what is queued and why it is stuck.
    pub details: DiagnosticNode,
}

impl Diagnostics {
    /// Appends this report under `parent`.
    pub fn describe_to(&self, parent: &mut DiagnosticNode) {
        parent.children.push(self.details.clone());
    }
}

/// Node of a diagnostic tree. Rendered with `Display` as an indented list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiagnosticNode {
    /// Text of this node.
    pub message: String,
    /// Nested nodes.
    pub children: Vec<DiagnosticNode>,
}

impl DiagnosticNode {
    /// Leaf node.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            children: Vec::new(),
        }
    }

    /// Appends `child` and returns `self`.
    #[must_use]
    pub fn with_child(mut self, child: DiagnosticNode) -> Self {
        self.children.push(child);
        self
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth == 0 {
            writeln!(f, "{}", self.message)?;
        } else {
            writeln!(f, "{:indent$}- {}", "", self.message, indent = (depth - 1) * 2)?;
        }
        for child in &self.children {
            child.render(f, depth + 1)?;
        }
        Ok(())
    }
}

impl Display for DiagnosticNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}
