use crate::backend::{AgentEvent, AgentSession, Backend, RunResult};
use crate::registry::BackendSettings;
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use foreman_task::Task;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Gemini CLI backend.
///
/// Runs the `gemini` binary with `--output-format stream-json`. The stream
/// wraps assistant text in `{"type": "assistant", "message": {"content":
/// [{"type": "text", ...}]}}` envelopes and signals the end with a
/// `{"type": "result"}` line; the last text block is the final output.
pub struct GeminiBackend {
    settings: BackendSettings,
}

impl GeminiBackend {
    /// A Gemini backend with the given settings.
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    fn cli_path(&self) -> &str {
        self.settings.cli_path.as_deref().unwrap_or("gemini")
    }
}

#[async_trait]
impl Backend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
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
        Ok(Box::new(GeminiSession {
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

struct GeminiSession {
    cli_path: String,
    model: Option<String>,
    extra_args: Vec<String>,
    task_id: String,
    workspace: PathBuf,
    events_tx: Option<mpsc::Sender<AgentEvent>>,
    events_rx: Option<mpsc::Receiver<AgentEvent>>,
}

#[async_trait]
impl AgentSession for GeminiSession {
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
            "gemini: spawning CLI"
        );

        let mut child = cmd.spawn().map_err(|e| {
            ForemanError::Backend(format!(
                "failed to run '{}'. Is the Gemini CLI installed? {e}",
                self.cli_path
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ForemanError::Backend("gemini: no stdout pipe".into()))?;

        let mut last_message = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| ForemanError::Backend(format!("gemini: read error: {e}")))?
        {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            match value["type"].as_str().unwrap_or_default() {
                "assistant" => {
                    for text in assistant_texts(&value) {
                        last_message = text.to_string();
                        self.emit(AgentEvent::Message {
                            content: text.to_string(),
                        })
                        .await;
                    }
                }
                "result" => {
                    self.emit(AgentEvent::Complete).await;
                }
                _ => {}
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ForemanError::Backend(format!("gemini: wait failed: {e}")))?;

        if !status.success() {
            return Ok(RunResult::failed(format!(
                "gemini CLI failed (exit {})",
                status.code().unwrap_or(-1)
            )));
        }
        Ok(RunResult::ok(last_message))
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.events_rx.take()
    }

    async fn destroy(&mut self) -> ForemanResult<()> {
        self.events_tx = None;
        Ok(())
    }
}

impl GeminiSession {
    /// Best-effort: a full or unconsumed event channel never stalls the run.
    async fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.try_send(event);
        }
    }
}

/// Text blocks inside one `assistant` stream envelope.
fn assistant_texts(value: &serde_json::Value) -> Vec<&str> {
    let Some(blocks) = value["message"]["content"].as_array() else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|b| b["type"].as_str() == Some("text"))
        .filter_map(|b| b["text"].as_str())
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn assistant_envelope_yields_text_blocks() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{
                "type": "assistant",
                "message": {
                    "content": [
                        {"type": "text", "text": "first"},
                        {"type": "tool_use", "name": "bash"},
                        {"type": "text", "text": "second"}
                    ]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(assistant_texts(&value), vec!["first", "second"]);
    }

    #[test]
    fn non_assistant_lines_yield_nothing() {
        let value: serde_json::Value = serde_json::from_str(r#"{"type": "result"}"#).unwrap();
        assert!(assistant_texts(&value).is_empty());

        let value: serde_json::Value =
            serde_json::from_str(r#"{"type": "assistant", "message": {}}"#).unwrap();
        assert!(assistant_texts(&value).is_empty());
    }
}
