use crate::workdir::TaskWorkspace;
use chrono::Duration;
use foreman_agent::{is_quota_error, AgentEvent, BackendRegistry, BackendSettings};
use foreman_core::{ForemanError, ForemanResult};
use foreman_quota::QuotaTracker;
use foreman_task::{Task, TaskRegistry, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of tasks executing at once.
    pub max_concurrency: usize,
    /// Backend used when a task carries no routing hint.
    pub default_backend: String,
    /// Run-time backend override; takes precedence over task hints.
    pub backend_override: Option<String>,
    /// Directory under which per-task workspaces are created.
    pub workspace_root: PathBuf,
    /// When set, the task snapshot written after each task finishes.
    pub registry_snapshot: Option<PathBuf>,
    /// How long a backend stays blocked after an authoritative quota error.
    pub quota_block: Duration,
    /// Tokens recorded per successful call when the backend does not report
    /// a count.
    pub token_estimate: u64,
    /// Per-backend construction settings, keyed by backend name.
    pub backend_settings: HashMap<String, BackendSettings>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            default_backend: "claude".to_string(),
            backend_override: None,
            workspace_root: PathBuf::from(".foreman/work"),
            registry_snapshot: None,
            quota_block: Duration::hours(1),
            token_estimate: 10_000,
            backend_settings: HashMap::new(),
        }
    }
}

/// Outcome counts for one orchestration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Tasks handed to a worker during the run.
    pub dispatched: usize,
    /// Tasks that reached `complete`.
    pub completed: usize,
    /// Tasks that reached `failed`.
    pub failed: usize,
    /// Tasks still pending when the run ended (unmet or failed deps, or
    /// cancelled before dispatch).
    pub pending: usize,
}

/// Cancels an orchestration run.
///
/// Cloneable and sendable; signalling stops new dispatch immediately and
/// makes in-flight workers abort their backend session. Aborted tasks end
/// `failed`, never `complete`.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Signal the run to stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The scheduling loop.
///
/// Owns no task state of its own: the registry is the single source of truth
/// for status, and the ready set is recomputed from it every cycle rather
/// than cached. Construct one orchestrator per workspace, threading the
/// registry, quota tracker, and backend registry through explicitly.
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    tasks: Arc<TaskRegistry>,
    quota: Arc<QuotaTracker>,
    backends: Arc<BackendRegistry>,
    semaphore: Arc<Semaphore>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    run_id: Uuid,
}

impl Orchestrator {
    /// Create an orchestrator over the given stores and backends.
    pub fn new(
        config: OrchestratorConfig,
        tasks: Arc<TaskRegistry>,
        quota: Arc<QuotaTracker>,
        backends: Arc<BackendRegistry>,
    ) -> Self {
        let slots = config.max_concurrency.max(1);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            tasks,
            quota,
            backends,
            semaphore: Arc::new(Semaphore::new(slots)),
            shutdown_tx: Arc::new(shutdown_tx),
            run_id: Uuid::new_v4(),
        }
    }

    /// A handle that cancels this orchestrator's runs.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run until no task is ready and none is in flight, or until shutdown.
    ///
    /// Each cycle recomputes the ready set, spawns a worker per newly ready
    /// task (workers queue on the concurrency semaphore), and waits for one
    /// completion before recomputing — a finished task may unblock its
    /// dependents. One task's failure never aborts the loop.
    pub async fn run(&self) -> ForemanResult<RunSummary> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut inflight: JoinSet<(String, ForemanResult<()>)> = JoinSet::new();
        let mut active: HashSet<String> = HashSet::new();
        let mut summary = RunSummary::default();

        info!(
            run_id = %self.run_id,
            max_concurrency = self.config.max_concurrency,
            "orchestrator: starting run"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let mut ready = self.tasks.get_ready();
            ready.retain(|t| !active.contains(&t.id));
            if ready.is_empty() && inflight.is_empty() {
                break;
            }

            for task in ready {
                summary.dispatched += 1;
                active.insert(task.id.clone());
                let worker = self.worker();
                let worker_rx = self.shutdown_tx.subscribe();
                inflight.spawn(async move {
                    let id = task.id.clone();
                    let result = worker.execute(task, worker_rx).await;
                    (id, result)
                });
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                joined = inflight.join_next() => {
                    self.on_joined(joined, &mut active, &mut summary);
                }
            }
        }

        // Drain in-flight workers; they observe the shutdown signal and
        // abort their sessions themselves.
        while let Some(joined) = inflight.join_next().await {
            self.on_joined(Some(joined), &mut active, &mut summary);
        }

        summary.pending = self.tasks.list_by_status(TaskStatus::Pending).len();
        if summary.pending > 0 && !*shutdown_rx.borrow() {
            warn!(
                pending = summary.pending,
                "orchestrator: pending tasks remain with unmet dependencies"
            );
        }

        info!(
            run_id = %self.run_id,
            dispatched = summary.dispatched,
            completed = summary.completed,
            failed = summary.failed,
            pending = summary.pending,
            "orchestrator: run finished"
        );
        Ok(summary)
    }

    /// Execute a single task by ID, outside the scheduling loop.
    ///
    /// The task must be pending and currently in the ready set. Returns the
    /// task's final record on success.
    pub async fn run_task(&self, id: &str) -> ForemanResult<Task> {
        let task = self.tasks.get(id)?;
        if task.status != TaskStatus::Pending {
            return Err(ForemanError::Validation(format!(
                "task '{id}' is not pending (status: {})",
                task.status
            )));
        }
        if !self.tasks.get_ready().iter().any(|t| t.id == id) {
            return Err(ForemanError::Validation(format!(
                "task '{id}' has incomplete dependencies"
            )));
        }

        let result = self
            .worker()
            .execute(task, self.shutdown_tx.subscribe())
            .await;
        self.persist();
        result?;
        self.tasks.get(id)
    }

    /// Move a failed task back to `pending` so the next run picks it up.
    pub fn requeue(&self, id: &str) -> ForemanResult<Task> {
        self.tasks.set_status(id, TaskStatus::Pending)
    }

    fn worker(&self) -> Worker {
        Worker {
            config: Arc::clone(&self.config),
            tasks: Arc::clone(&self.tasks),
            quota: Arc::clone(&self.quota),
            backends: Arc::clone(&self.backends),
            semaphore: Arc::clone(&self.semaphore),
        }
    }

    fn on_joined(
        &self,
        joined: Option<Result<(String, ForemanResult<()>), tokio::task::JoinError>>,
        active: &mut HashSet<String>,
        summary: &mut RunSummary,
    ) {
        match joined {
            Some(Ok((id, result))) => {
                active.remove(&id);
                if let Err(e) = result {
                    error!(task = %id, error = %e, "orchestrator: task failed");
                }
                // Count from the registry: a worker cancelled while waiting
                // for a slot never claims its task, which stays pending.
                match self.tasks.get(&id).map(|t| t.status) {
                    Ok(TaskStatus::Complete) => summary.completed += 1,
                    Ok(TaskStatus::Failed) => summary.failed += 1,
                    _ => {}
                }
                self.persist();
            }
            Some(Err(e)) => {
                summary.failed += 1;
                error!(error = %e, "orchestrator: worker join error");
            }
            None => {}
        }
    }

    /// Snapshot task and usage state. Persistence failures are logged and
    /// do not abort the loop; the in-memory state stays authoritative.
    fn persist(&self) {
        if let Some(path) = &self.config.registry_snapshot {
            if let Err(e) = self.tasks.save(path) {
                error!(path = %path.display(), error = %e, "orchestrator: task snapshot failed");
            }
        }
        if let Err(e) = self.quota.save() {
            error!(error = %e, "orchestrator: quota snapshot failed");
        }
    }
}

/// One task execution end to end: slot, claim, run (with failover), finalize.
struct Worker {
    config: Arc<OrchestratorConfig>,
    tasks: Arc<TaskRegistry>,
    quota: Arc<QuotaTracker>,
    backends: Arc<BackendRegistry>,
    semaphore: Arc<Semaphore>,
}

impl Worker {
    async fn execute(
        &self,
        task: Task,
        mut shutdown: watch::Receiver<bool>,
    ) -> ForemanResult<()> {
        // The semaphore is the sole backpressure bounding parallel external
        // processes; the task stays pending while it waits for a slot.
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ForemanError::Backend("orchestrator shut down".into()))?;

        if *shutdown.borrow() {
            return Err(ForemanError::Backend(
                "orchestration cancelled before dispatch".into(),
            ));
        }

        // Claim pessimistically, before any backend contact: other observers
        // see in_progress while the external call is still being prepared.
        self.tasks.set_status(&task.id, TaskStatus::InProgress)?;

        let (primary, primary_model) = resolve_route(
            &task,
            self.config.backend_override.as_deref(),
            &self.config.default_backend,
        );
        info!(task = %task.id, backend = %primary, "dispatching task");

        let first = self
            .attempt(&task, &primary, primary_model.as_deref(), &mut shutdown)
            .await;

        let (outcome, serviced_by) = match first {
            Err(e) if is_quota_failure(&e) => {
                // The backend's own quota signal is authoritative; block the
                // primary before considering the fallback.
                self.quota.record_error(&primary, self.config.quota_block);
                if let Some((fb_backend, fb_model)) = task.fallback_hint() {
                    warn!(
                        task = %task.id,
                        primary = %primary,
                        fallback = %fb_backend,
                        "quota exhausted, failing over"
                    );
                    let retry = self
                        .attempt(&task, fb_backend, Some(fb_model), &mut shutdown)
                        .await;
                    (retry, fb_backend.to_string())
                } else {
                    (Err(e), primary.clone())
                }
            }
            other => (other, primary.clone()),
        };

        match outcome {
            Ok(result) if result.success => {
                self.quota.record(&serviced_by, self.config.token_estimate);
                self.tasks.set_status(&task.id, TaskStatus::Complete)?;
                info!(task = %task.id, backend = %serviced_by, "task complete");
                Ok(())
            }
            Ok(result) => {
                self.tasks.set_status(&task.id, TaskStatus::Failed)?;
                let message = if result.error.is_empty() {
                    "backend reported failure".to_string()
                } else {
                    result.error
                };
                Err(ForemanError::Backend(message))
            }
            Err(e) => {
                self.tasks.set_status(&task.id, TaskStatus::Failed)?;
                Err(e)
            }
        }
    }

    /// One backend call: quota gate, isolated workspace, session run.
    /// Any quota-flavored error is recorded against the backend before it
    /// propagates, so the block takes effect immediately.
    async fn attempt(
        &self,
        task: &Task,
        backend_name: &str,
        model: Option<&str>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ForemanResult<foreman_agent::RunResult> {
        if self.quota.is_exhausted(backend_name) {
            return Err(ForemanError::QuotaExhausted(backend_name.to_string()));
        }

        let mut settings = self
            .config
            .backend_settings
            .get(backend_name)
            .cloned()
            .unwrap_or_default();
        if let Some(model) = model {
            settings.model = Some(model.to_string());
        }

        let backend = self.backends.create(backend_name, &settings)?;
        if let Err(e) = backend.start().await {
            return Err(self.classify(backend_name, e));
        }

        let workspace = TaskWorkspace::create(&self.config.workspace_root, &task.id).await?;

        let mut session = match backend.create_session(task, workspace.path()).await {
            Ok(session) => session,
            Err(e) => {
                self.release(None, &backend, workspace).await;
                return Err(self.classify(backend_name, e));
            }
        };

        if let Some(mut events) = session.take_events() {
            let task_id = task.id.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        AgentEvent::Message { content } => {
                            debug!(task = %task_id, "{content}");
                        }
                        AgentEvent::ToolCall { content } => {
                            info!(task = %task_id, tool = %content, "agent tool call");
                        }
                        AgentEvent::Complete => {
                            info!(task = %task_id, "agent session complete");
                        }
                        AgentEvent::Error { content } => {
                            warn!(task = %task_id, error = %content, "agent session error");
                        }
                    }
                }
            });
        }

        let prompt = build_prompt(task);
        let run_result = tokio::select! {
            result = session.run(&prompt) => result,
            () = wait_cancel(shutdown) => {
                Err(ForemanError::Backend("orchestration cancelled".into()))
            }
        };

        self.release(Some(&mut session), &backend, workspace).await;
        run_result.map_err(|e| self.classify(backend_name, e))
    }

    /// Tear down session, backend, and workspace. Cleanup is mandatory on
    /// both success and failure; errors here are logged, never propagated
    /// over the run outcome.
    async fn release(
        &self,
        session: Option<&mut Box<dyn foreman_agent::AgentSession>>,
        backend: &Arc<dyn foreman_agent::Backend>,
        workspace: TaskWorkspace,
    ) {
        if let Some(session) = session {
            if let Err(e) = session.destroy().await {
                warn!(error = %e, "session destroy failed");
            }
        }
        if let Err(e) = backend.stop().await {
            warn!(backend = %backend.name(), error = %e, "backend stop failed");
        }
        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.cleanup().await {
            warn!(workspace = %path.display(), error = %e, "workspace cleanup failed");
        }
    }

    fn classify(&self, backend_name: &str, e: ForemanError) -> ForemanError {
        if is_quota_error(&e.to_string()) {
            self.quota.record_error(backend_name, self.config.quota_block);
        }
        e
    }
}

/// Resolve the backend and model for a task: run-time override first, then
/// the task's own `"backend/model"` hint, then the workspace default.
fn resolve_route(
    task: &Task,
    override_backend: Option<&str>,
    default_backend: &str,
) -> (String, Option<String>) {
    if let Some(name) = override_backend {
        return (name.to_string(), None);
    }
    if let Some((backend, model)) = task.model_hint() {
        return (backend.to_string(), Some(model.to_string()));
    }
    (default_backend.to_string(), None)
}

fn is_quota_failure(e: &ForemanError) -> bool {
    matches!(e, ForemanError::QuotaExhausted(_)) || is_quota_error(&e.to_string())
}

fn build_prompt(task: &Task) -> String {
    format!(
        "You are working on task {id}.\n\n\
         ## Task\n\
         Title: {title}\n\
         {description}\n\n\
         ## Instructions\n\
         1. Implement the required changes for this task\n\
         2. Run the project's tests to verify your implementation\n\
         3. Finish with a summary of what changed\n",
        id = task.id,
        title = task.title,
        description = task.description,
    )
}

/// Resolve only once the value is true; tolerates a dropped sender by
/// pending forever (the run future is dropped with it).
async fn wait_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn route_resolution_precedence() {
        let task = Task::new("t-1", "Routing").with_model("codex/gpt-5");

        // Explicit override wins, and carries no model hint of its own.
        assert_eq!(
            resolve_route(&task, Some("claude"), "claude"),
            ("claude".to_string(), None)
        );
        // Task hint next.
        assert_eq!(
            resolve_route(&task, None, "claude"),
            ("codex".to_string(), Some("gpt-5".to_string()))
        );
        // Workspace default last.
        let bare = Task::new("t-2", "No hint");
        assert_eq!(
            resolve_route(&bare, None, "claude"),
            ("claude".to_string(), None)
        );
    }

    #[test]
    fn quota_failure_classification() {
        assert!(is_quota_failure(&ForemanError::QuotaExhausted("claude".into())));
        assert!(is_quota_failure(&ForemanError::Backend(
            "upstream said Rate Limit".into()
        )));
        assert!(!is_quota_failure(&ForemanError::Backend(
            "connection refused".into()
        )));
    }

    #[test]
    fn prompt_embeds_task_fields() {
        let task = Task::new("ua-007", "Wire up billing")
            .with_description("Use the existing invoice module.");
        let prompt = build_prompt(&task);
        assert!(prompt.contains("ua-007"));
        assert!(prompt.contains("Wire up billing"));
        assert!(prompt.contains("invoice module"));
    }
}
