use crate::backend::{AgentEvent, AgentSession, Backend, RunResult};
use crate::registry::BackendSettings;
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use foreman_task::Task;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Codex CLI backend.
///
/// Runs the `codex` binary with `--output-format stream-json` and forwards
/// each output line as an [`AgentEvent`] while accumulating the final text.
pub struct CodexBackend {
    settings: BackendSettings,
}

impl CodexBackend {
    /// A Codex backend with the given settings.
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    fn cli_path(&self) -> &str {
        self.settings.cli_path.as_deref().unwrap_or("codex")
    }
}

#[async_trait]
impl Backend for CodexBackend {
    fn name(&self) -> &str {
        "codex"
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
        Ok(Box::new(CodexSession {
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

struct CodexSession {
    cli_path: String,
    model: Option<String>,
    extra_args: Vec<String>,
    task_id: String,
    workspace: PathBuf,
    events_tx: Option<mpsc::Sender<AgentEvent>>,
    events_rx: Option<mpsc::Receiver<AgentEvent>>,
}

#[async_trait]
impl AgentSession for CodexSession {
    async fn run(&mut self, prompt: &str) -> ForemanResult<RunResult> {
        let mut cmd = tokio::process::Command::new(&self.cli_path);
        cmd.arg("--print");
        cmd.arg("--output-format").arg("stream-json");
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("--cwd").arg(&self.workspace);
        cmd.args(&self.extra_args);
        cmd.arg(prompt);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // A cancelled run must not leave the CLI process behind.
        cmd.kill_on_drop(true);

        tracing::info!(
            task = %self.task_id,
            workspace = %self.workspace.display(),
            "codex: spawning CLI"
        );

        let mut child = cmd.spawn().map_err(|e| {
            ForemanError::Backend(format!(
                "failed to run '{}'. Is the Codex CLI installed? {e}",
                self.cli_path
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ForemanError::Backend("codex: no stdout pipe".into()))?;

        let mut output = String::new();
        let mut error_text = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| ForemanError::Backend(format!("codex: read error: {e}")))?
        {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            let content = value["content"].as_str().unwrap_or_default().to_string();
            match value["type"].as_str().unwrap_or_default() {
                "message" => {
                    output.push_str(&content);
                    self.emit(AgentEvent::Message { content }).await;
                }
                "tool_call" => {
                    self.emit(AgentEvent::ToolCall { content }).await;
                }
                "complete" => {
                    self.emit(AgentEvent::Complete).await;
                }
                "error" => {
                    error_text = content.clone();
                    self.emit(AgentEvent::Error { content }).await;
                }
                _ => {}
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ForemanError::Backend(format!("codex: wait failed: {e}")))?;

        if !status.success() {
            let message = if error_text.is_empty() {
                format!("codex CLI failed (exit {})", status.code().unwrap_or(-1))
            } else {
                error_text
            };
            return Err(ForemanError::Backend(message));
        }

        if !error_text.is_empty() {
            return Ok(RunResult::failed(error_text));
        }
        Ok(RunResult::ok(output))
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.events_rx.take()
    }

    async fn destroy(&mut self) -> ForemanResult<()> {
        self.events_tx = None;
        Ok(())
    }
}

impl CodexSession {
    /// Best-effort: a full or unconsumed event channel never stalls the run.
    async fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.try_send(event);
        }
    }
}
