use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
///
/// Valid transitions: `pending → in_progress → {complete | failed}` and
/// `failed → pending` (re-queue). `complete` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet started; eligible for dispatch once all dependencies complete.
    Pending,
    /// Claimed by a worker and currently executing.
    InProgress,
    /// Finished successfully. Terminal.
    Complete,
    /// Finished with an error. May be re-queued to `pending`.
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl TaskStatus {
    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Complete)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Pending)
        )
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// A unit of schedulable work.
///
/// `id` is unique and immutable after creation. `deps` lists task IDs that
/// must be `complete` before this task may start. `model` and `fallback` are
/// routing hints in the `"backend/model"` form. Unknown fields in persisted
/// snapshots are ignored on load; omitted optional fields take the defaults
/// below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned by the caller.
    pub id: String,
    /// Short human-readable title.
    pub title: String,
    /// Free-text description of the work.
    #[serde(default)]
    pub description: String,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: TaskStatus,
    /// IDs of tasks that must complete before this one may start.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Logical grouping, e.g. the target repository or module.
    #[serde(default)]
    pub repo: String,
    /// Dispatch tie-break among simultaneously ready tasks; higher first.
    #[serde(default)]
    pub priority: i32,
    /// Primary backend/model routing hint, `"backend/model"`.
    #[serde(default)]
    pub model: String,
    /// Fallback backend/model used when the primary is quota-exhausted.
    #[serde(default)]
    pub fallback: String,
    /// Creation timestamp.
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    /// Refreshed on every mutation, including status transitions.
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task with both timestamps stamped.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let ts = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            deps: Vec::new(),
            repo: String::new(),
            priority: 0,
            model: String::new(),
            fallback: String::new(),
            created_at: ts,
            updated_at: ts,
        }
    }

    /// Set the dependency list (builder style).
    pub fn with_deps(mut self, deps: Vec<String>) -> Self {
        self.deps = deps;
        self
    }

    /// Set the description (builder style).
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the repo grouping (builder style).
    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = repo.into();
        self
    }

    /// Set the priority (builder style).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the `"backend/model"` routing hint (builder style).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the `"backend/model"` fallback hint (builder style).
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// Check required fields. Does not look at other tasks; graph-level
    /// validation is the registry's job.
    pub fn validate(&self) -> ForemanResult<()> {
        if self.id.is_empty() {
            return Err(ForemanError::Validation("task ID cannot be empty".into()));
        }
        if self.title.is_empty() {
            return Err(ForemanError::Validation(
                "task title cannot be empty".into(),
            ));
        }
        if self.deps.iter().any(|d| *d == self.id) {
            return Err(ForemanError::Validation(format!(
                "task '{}' cannot depend on itself",
                self.id
            )));
        }
        Ok(())
    }

    /// Transition to `to`, refreshing `updated_at`.
    ///
    /// Fails with [`ForemanError::InvalidTransition`] if the state machine
    /// does not permit the move.
    pub fn set_status(&mut self, to: TaskStatus) -> ForemanResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(ForemanError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Parse the primary `"backend/model"` hint, if present and well-formed.
    pub fn model_hint(&self) -> Option<(&str, &str)> {
        split_hint(&self.model)
    }

    /// Parse the fallback `"backend/model"` hint, if present and well-formed.
    pub fn fallback_hint(&self) -> Option<(&str, &str)> {
        split_hint(&self.fallback)
    }
}

fn split_hint(hint: &str) -> Option<(&str, &str)> {
    let (backend, model) = hint.split_once('/')?;
    if backend.is_empty() || model.is_empty() {
        return None;
    }
    Some((backend, model))
}
