use indexmap::IndexMap as _IndexMap;
use rustc_hash::FxBuildHasher;
use std::{error::Error, sync::Arc};
use thiserror::Error;

/// Boxed error returned by unit actions and work source bookkeeping hooks.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// `IndexMap` type with fast hasher.
pub(crate) type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;

/// Failure recorded against a unit of work or an entire plan.
///
/// Cheap to clone, so a single scheduler fault can be handed to every plan
/// sharing a queue.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ExecutionFailure {
    /// The unit's action returned an error.
    #[error(transparent)]
    Action(Arc<dyn Error + Send + Sync + 'static>),
    /// The unit's action, or a work source hook, panicked.
    #[error("panicked: {0}")]
    Panicked(String),
    /// A work source's own `select_next` or `finished_executing` failed. The
    /// queue holding it can no longer be trusted and every plan in it is
    /// aborted with this failure.
    #[error("work source bookkeeping failed: {0}")]
    Bookkeeping(Arc<dyn Error + Send + Sync + 'static>),
    /// Deadlock: work is queued but no plan can start any of it.
    #[error(
        "Unable to make progress running work. There are items queued for execution but none \
         of them can be started"
    )]
    NoProgress,
    /// The unit was skipped because execution was cancelled.
    #[error("execution was cancelled")]
    Cancelled,
    /// Several failures reported together.
    #[error("{} failures occurred", .0.len())]
    Multiple(Vec<ExecutionFailure>),
}

impl ExecutionFailure {
    /// Wraps an action error.
    pub fn action(error: BoxError) -> Self {
        Self::Action(Arc::from(error))
    }

    /// Wraps a bookkeeping error raised by a work source.
    pub fn bookkeeping(error: BoxError) -> Self {
        Self::Bookkeeping(Arc::from(error))
    }
}

/// Outcome of processing one work source: every failure it collected.
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    failures: Vec<ExecutionFailure>,
}

impl ExecutionResult {
    /// Result carrying `failures`; an empty list means success.
    pub fn maybe_failed(failures: Vec<ExecutionFailure>) -> Self {
        Self { failures }
    }

    /// `true` when no failure was collected.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collected failures in the order the work source reported them.
    pub fn failures(&self) -> &[ExecutionFailure] {
        &self.failures
    }

    /// Consumes the result, returning the collected failures.
    pub fn into_failures(self) -> Vec<ExecutionFailure> {
        self.failures
    }

    /// Converts into a `Result`, folding several failures into
    /// [`ExecutionFailure::Multiple`].
    ///
    /// # Errors
    /// When at least one failure was collected.
    pub fn into_result(mut self) -> Result<(), ExecutionFailure> {
        match self.failures.len() {
            0 => Ok(()),
            1 => Err(self.failures.remove(0)),
            _ => Err(ExecutionFailure::Multiple(self.failures)),
        }
    }
}
