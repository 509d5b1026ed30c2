//! Shared error taxonomy for the foreman orchestration workspace.
//!
//! Every subsystem crate returns [`ForemanResult`]; the variants of
//! [`ForemanError`] distinguish errors the caller must fix (validation,
//! graph integrity, identity), errors the scheduler reacts to (quota
//! exhaustion), and plain execution failures.
//!
//! # Main types
//!
//! - [`ForemanError`] — Unified error enum for all foreman subsystems.
//! - [`ForemanResult`] — Convenience alias for `Result<T, ForemanError>`.

use thiserror::Error;

/// Top-level error type for the foreman workspace.
#[derive(Debug, Error)]
pub enum ForemanError {
    /// A task or configuration value is malformed. Never retried; the
    /// caller must fix the input.
    #[error("invalid task: {0}")]
    Validation(String),

    /// A task with this ID is already stored.
    #[error("task '{0}' already exists")]
    DuplicateId(String),

    /// No task with this ID is stored.
    #[error("task '{0}' not found")]
    NotFound(String),

    /// A declared dependency does not resolve to a stored task.
    #[error("task '{task}': dependency '{dep}' not found")]
    UnknownDependency {
        /// The task whose dependency list failed to resolve.
        task: String,
        /// The dependency ID that did not resolve.
        dep: String,
    },

    /// The mutation would make the dependency graph cyclic.
    #[error("circular dependency detected: {0}")]
    CircularDependency(String),

    /// The task is referenced by another task's dependency list.
    #[error("cannot delete task '{id}': task '{dependent}' depends on it")]
    HasDependents {
        /// The task that was asked to be deleted.
        id: String,
        /// A task that lists `id` in its dependencies.
        dependent: String,
    },

    /// The requested status change violates the task state machine.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status of the task.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The backend is currently blocked by the quota tracker. Transient;
    /// triggers failover rather than surfacing as fatal.
    #[error("quota exhausted for backend '{0}'")]
    QuotaExhausted(String),

    /// A backend is not present in the backend registry.
    #[error("backend not registered: {0}")]
    UnknownBackend(String),

    /// A backend call failed during task execution.
    #[error("backend error: {0}")]
    Backend(String),

    /// Configuration parsing or validation failed.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ForemanError`].
pub type ForemanResult<T> = Result<T, ForemanError>;
