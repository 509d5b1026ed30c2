use async_trait::async_trait;
use foreman_core::ForemanResult;
use foreman_task::Task;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::mpsc;

/// Progress events emitted by a running session.
///
/// Consumers (the orchestrator, a CLI front-end) receive these as the
/// external agent process produces output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A chunk of assistant text.
    Message {
        /// The text content.
        content: String,
    },
    /// The agent invoked a tool.
    ToolCall {
        /// Tool name and argument summary.
        content: String,
    },
    /// The session finished successfully.
    Complete,
    /// The session hit an error.
    Error {
        /// The error description.
        content: String,
    },
}

/// Terminal result of one session run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResult {
    /// Whether the agent reported success.
    pub success: bool,
    /// Final output text.
    pub output: String,
    /// Error description when `success` is false.
    pub error: String,
}

impl RunResult {
    /// A successful result with the given output.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
        }
    }

    /// A failed result with the given error text.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
        }
    }
}

/// A named external execution capability.
///
/// `start`/`stop` bracket any per-backend process state; `create_session`
/// binds the backend to one task and one exclusively-owned workspace
/// directory.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The backend's registered name, e.g. `"claude"`.
    fn name(&self) -> &str;

    /// Prepare the backend for use.
    async fn start(&self) -> ForemanResult<()>;

    /// Release any per-backend state.
    async fn stop(&self) -> ForemanResult<()>;

    /// Create a session bound to `task`, executing inside `workspace`.
    async fn create_session(
        &self,
        task: &Task,
        workspace: &Path,
    ) -> ForemanResult<Box<dyn AgentSession>>;
}

/// One agent execution bound to a task and workspace.
#[async_trait]
pub trait AgentSession: Send {
    /// Run the prompt to a terminal result.
    async fn run(&mut self, prompt: &str) -> ForemanResult<RunResult>;

    /// Take the event stream. Yields `None` after the first call; there is
    /// one consumer per session.
    fn take_events(&mut self) -> Option<mpsc::Receiver<AgentEvent>>;

    /// Tear the session down. Idempotent.
    async fn destroy(&mut self) -> ForemanResult<()>;
}
