use crate::backend::{AgentEvent, AgentSession, Backend, RunResult};
use crate::registry::BackendSettings;
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use foreman_task::Task;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Claude CLI backend.
///
/// Runs the `claude` binary in headless mode (`-p --output-format json`)
/// inside the task's workspace and parses the final JSON result object.
pub struct ClaudeBackend {
    settings: BackendSettings,
}

impl ClaudeBackend {
    /// A Claude backend with the given settings.
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    fn cli_path(&self) -> &str {
        self.settings.cli_path.as_deref().unwrap_or("claude")
    }
}

#[async_trait]
impl Backend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    async fn start(&self) -> ForemanResult<()> {
        Ok(())
    }

    async fn stop(&self) -> ForemanResult<()> {
        Ok(())
    }

    async fn create_session(
        &self,
        task: &Task,
        workspace: &Path,
    ) -> ForemanResult<Box<dyn AgentSession>> {
        let (tx, rx) = mpsc::channel(64);
        Ok(Box::new(ClaudeSession {
            cli_path: self.cli_path().to_string(),
            model: self.settings.model.clone(),
            extra_args: self.settings.extra_args.clone(),
            task_id: task.id.clone(),
            workspace: workspace.to_path_buf(),
            events_tx: Some(tx),
            events_rx: Some(rx),
        }))
    }
}

struct ClaudeSession {
    cli_path: String,
    model: Option<String>,
    extra_args: Vec<String>,
    task_id: String,
    workspace: PathBuf,
    events_tx: Option<mpsc::Sender<AgentEvent>>,
    events_rx: Option<mpsc::Receiver<AgentEvent>>,
}

#[async_trait]
impl AgentSession for ClaudeSession {
    async fn run(&mut self, prompt: &str) -> ForemanResult<RunResult> {
        let mut cmd = tokio::process::Command::new(&self.cli_path);
        cmd.arg("-p").arg(prompt);
        cmd.arg("--output-format").arg("json");
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.args(&self.extra_args);
        cmd.current_dir(&self.workspace);
        // A cancelled run must not leave the CLI process behind.
        cmd.kill_on_drop(true);

        tracing::info!(
            task = %self.task_id,
            workspace = %self.workspace.display(),
            "claude: spawning CLI"
        );

        let output = cmd.output().await.map_err(|e| {
            ForemanError::Backend(format!(
                "failed to run '{}'. Is the Claude CLI installed? {e}",
                self.cli_path
            ))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let message = format!(
                "claude CLI failed (exit {}): {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
            self.emit(AgentEvent::Error {
                content: message.clone(),
            })
            .await;
            return Err(ForemanError::Backend(message));
        }

        // The CLI prints one JSON object; take the last parseable line in
        // case warnings precede it.
        let result_json: serde_json::Value = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str(line).ok())
            .ok_or_else(|| {
                let preview: String = stdout.chars().take(500).collect();
                ForemanError::Backend(format!(
                    "could not parse claude output as JSON: {preview}"
                ))
            })?;

        let is_error = result_json["is_error"].as_bool().unwrap_or(false);
        let result_text = result_json["result"].as_str().unwrap_or_default().to_string();

        if is_error {
            self.emit(AgentEvent::Error {
                content: result_text.clone(),
            })
            .await;
            return Ok(RunResult::failed(result_text));
        }

        self.emit(AgentEvent::Message {
            content: result_text.clone(),
        })
        .await;
        self.emit(AgentEvent::Complete).await;
        Ok(RunResult::ok(result_text))
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.events_rx.take()
    }

    async fn destroy(&mut self) -> ForemanResult<()> {
        self.events_tx = None;
        Ok(())
    }
}

impl ClaudeSession {
    /// Best-effort: a full or unconsumed event channel never stalls the run.
    async fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.try_send(event);
        }
    }
}
