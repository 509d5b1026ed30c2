use crate::backend::{AgentEvent, AgentSession, Backend, RunResult};
use async_trait::async_trait;
use foreman_core::{ForemanError, ForemanResult};
use foreman_task::Task;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct MockState {
    results: Mutex<VecDeque<Result<RunResult, String>>>,
    calls: AtomicU32,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// Deterministic in-process backend for tests and dry runs.
///
/// Scripted results are returned in order; once the script is exhausted every
/// run succeeds with a canned output. The backend counts calls and tracks the
/// peak number of concurrently running sessions, which lets tests verify the
/// orchestrator's concurrency bound.
pub struct MockBackend {
    name: String,
    delay: Option<Duration>,
    state: Arc<MockState>,
}

impl MockBackend {
    /// A mock backend with the given registered name and no script.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: None,
            state: Arc::new(MockState {
                results: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue a scripted result (builder style).
    pub fn with_result(self, result: RunResult) -> Self {
        self.state.results.lock().push_back(Ok(result));
        self
    }

    /// Queue a scripted run error (builder style).
    pub fn with_error(self, message: impl Into<String>) -> Self {
        self.state.results.lock().push_back(Err(message.into()));
        self
    }

    /// Make every run sleep for `delay` before finishing, so concurrent
    /// sessions overlap observably.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of runs performed across all sessions.
    pub fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Peak number of sessions running at the same instant.
    pub fn max_concurrent(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> ForemanResult<()> {
        Ok(())
    }

    async fn stop(&self) -> ForemanResult<()> {
        Ok(())
    }

    async fn create_session(
        &self,
        _task: &Task,
        _workspace: &Path,
    ) -> ForemanResult<Box<dyn AgentSession>> {
        let (tx, rx) = mpsc::channel(16);
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
            delay: self.delay,
            events_tx: Some(tx),
            events_rx: Some(rx),
        }))
    }
}

struct MockSession {
    state: Arc<MockState>,
    delay: Option<Duration>,
    events_tx: Option<mpsc::Sender<AgentEvent>>,
    events_rx: Option<mpsc::Receiver<AgentEvent>>,
}

#[async_trait]
impl AgentSession for MockSession {
    async fn run(&mut self, prompt: &str) -> ForemanResult<RunResult> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active.fetch_max(now_active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.state.active.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.state.results.lock().pop_front();
        let outcome = match scripted {
            Some(entry) => entry,
            None => Ok(RunResult::ok(format!(
                "mock run complete ({} prompt bytes)",
                prompt.len()
            ))),
        };

        if let Some(tx) = self.events_tx.take() {
            match &outcome {
                Ok(result) if result.success => {
                    let _ = tx
                        .send(AgentEvent::Message {
                            content: result.output.clone(),
                        })
                        .await;
                    let _ = tx.send(AgentEvent::Complete).await;
                }
                Ok(result) => {
                    let _ = tx
                        .send(AgentEvent::Error {
                            content: result.error.clone(),
                        })
                        .await;
                }
                Err(message) => {
                    let _ = tx
                        .send(AgentEvent::Error {
                            content: message.clone(),
                        })
                        .await;
                }
            }
        }

        outcome.map_err(ForemanError::Backend)
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.events_rx.take()
    }

    async fn destroy(&mut self) -> ForemanResult<()> {
        self.events_tx = None;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_results_come_back_in_order() {
        let backend = MockBackend::new("mock")
            .with_result(RunResult::ok("first"))
            .with_error("429 too many requests");
        let task = Task::new("t-1", "Scripted");

        let mut session = backend
            .create_session(&task, Path::new("/tmp"))
            .await
            .unwrap();
        let result = session.run("go").await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "first");

        let mut session = backend
            .create_session(&task, Path::new("/tmp"))
            .await
            .unwrap();
        let err = session.run("go").await.unwrap_err();
        assert!(err.to_string().contains("429"));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_falls_back_to_success() {
        let backend = MockBackend::new("mock");
        let task = Task::new("t-1", "Default");
        let mut session = backend
            .create_session(&task, Path::new("/tmp"))
            .await
            .unwrap();
        assert!(session.run("anything").await.unwrap().success);
    }

    #[tokio::test]
    async fn events_stream_reports_completion() {
        let backend = MockBackend::new("mock").with_result(RunResult::ok("done"));
        let task = Task::new("t-1", "Events");
        let mut session = backend
            .create_session(&task, Path::new("/tmp"))
            .await
            .unwrap();
        let mut events = session.take_events().unwrap();
        assert!(session.take_events().is_none());

        session.run("go").await.unwrap();
        session.destroy().await.unwrap();

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        assert!(matches!(seen.last(), Some(AgentEvent::Complete)));
    }
}
