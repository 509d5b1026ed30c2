//! Task entities and the dependency-aware task registry.
//!
//! A [`Task`] is a unit of schedulable work with a string identity, a status
//! state machine, and declared dependencies on other tasks. The
//! [`TaskRegistry`] stores tasks behind one exclusive lock, enforces graph
//! integrity (no dangling dependencies, no cycles) on every write, computes
//! the ready set that admits tasks into execution, and snapshots the full
//! task set to a JSON file.
//!
//! # Main types
//!
//! - [`Task`] — A unit of work with identity, status, and dependencies.
//! - [`TaskStatus`] — The four-state task lifecycle.
//! - [`TaskRegistry`] — Concurrency-safe store with validation and persistence.

/// Dependency-aware task store.
pub mod registry;
/// Task entity and status state machine.
pub mod task;

pub use registry::TaskRegistry;
pub use task::{Task, TaskStatus};
