//! The concurrency-bounded scheduling loop.
//!
//! The [`Orchestrator`] repeatedly asks the task registry for ready tasks,
//! bounds in-flight work with a counting semaphore, dispatches each task to
//! a backend resolved from its routing hints, consults and updates the quota
//! tracker, fails over to the declared fallback when the primary is
//! quota-exhausted, and writes results back into the registry. One worker
//! executes one task end to end (claim, run, finalize) inside an isolated
//! workspace directory that is cleaned up on both success and failure.
//!
//! # Main types
//!
//! - [`Orchestrator`] — The scheduling loop and single-task execution path.
//! - [`OrchestratorConfig`] — Concurrency bound, routing defaults, paths.
//! - [`RunSummary`] — Outcome counts for one orchestration run.
//! - [`ShutdownHandle`] — Cancels dispatch and aborts in-flight sessions.

/// The scheduling loop, failover, and worker execution.
pub mod engine;
/// Per-task isolated workspace directories.
pub mod workdir;

pub use engine::{Orchestrator, OrchestratorConfig, RunSummary, ShutdownHandle};
pub use workdir::TaskWorkspace;
