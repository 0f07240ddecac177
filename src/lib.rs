//! Parallel executor for plans of dependent work units.
//!
//! This crate drives one or more [`source::WorkSource`]s to completion on a
//! bounded set of threads. It:
//! - Merges every submitted source into one queue shared by background
//!   worker threads, scanning the most recently submitted source first.
//! - Lets the thread that submitted a source work on it too, instead of just
//!   blocking until it completes.
//! - Bounds the number of threads executing units at once with worker
//!   leases.
//! - Coordinates all bookkeeping under a single lock with a condition
//!   variable "retry" protocol. Units themselves always run unlocked.
//! - Detects deadlocks (queued work none of the sources can start) and
//!   aborts the affected sources with a diagnostic report.
//!
//! Which units are ready, and in which order, is the work source's business.
//! The executor never looks inside it beyond the [`source::WorkSource`]
//! contract.
//!
//! Key modules:
//! - `source`: the `WorkSource` trait, selections and health diagnostics.
//! - `executor`: `PlanExecutor`, the entry point.
//! - `lease`: worker leases.
//! - `config`: `ExecutorConfig` and its environment overrides.
//! - `cancellation`: cooperative cancellation token.
//! - `types`: failures and execution results.
//!
//! Quick start:
//! 1. Implement `WorkSource` for your graph of units.
//! 2. Create a `PlanExecutor` from an `ExecutorConfig` and a
//!    `CancellationToken`.
//! 3. Call `PlanExecutor::process` under a worker lease (for example inside
//!    `PlanExecutor::with_worker_lease`) and inspect the returned failures.
//! 4. Call `PlanExecutor::stop` once every submission has returned.

/// Cooperative cancellation shared with the executor.
pub mod cancellation;
/// Executor settings.
///
/// Exposes `ExecutorConfig`, validated when the executor is built, and the
/// environment variables that override its defaults.
pub mod config;
mod coordination;
/// The plan executor.
///
/// Contains the merged plan queue, the per-thread worker loop, the lazily
/// started background pool and deadlock detection.
pub mod executor;
/// Concurrency permits bounding how many threads execute units at once.
pub mod lease;
/// The work source contract consumed by the executor.
///
/// Defines `WorkSource`, the `Selection` and `ExecutionState` it reports,
/// and the `Diagnostics` tree used for deadlock reports.
pub mod source;
mod sync;
/// Failures, results and shared aliases.
pub mod types;
mod utils;
