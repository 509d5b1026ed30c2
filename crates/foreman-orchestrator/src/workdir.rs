use foreman_core::ForemanResult;
use std::path::{Path, PathBuf};

/// An isolated working directory owned by one task's worker for the duration
/// of its run.
///
/// Created under the orchestrator's workspace root, named after the task ID.
/// Cleanup is mandatory on both success and failure; dropping an
/// un-cleaned workspace removes it best-effort so a failed run does not leak
/// directories across restarts.
pub struct TaskWorkspace {
    path: PathBuf,
    cleaned: bool,
}

impl TaskWorkspace {
    /// Create (or re-create) the directory for `task_id` under `root`.
    pub async fn create(root: &Path, task_id: &str) -> ForemanResult<Self> {
        let path = root.join(task_id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self {
            path,
            cleaned: false,
        })
    }

    /// The workspace directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory and everything in it.
    pub async fn cleanup(mut self) -> ForemanResult<()> {
        tokio::fs::remove_dir_all(&self.path).await?;
        self.cleaned = true;
        Ok(())
    }
}

impl Drop for TaskWorkspace {
    fn drop(&mut self) {
        if !self.cleaned {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let ws = TaskWorkspace::create(root.path(), "ua-001").await.unwrap();
        assert!(ws.path().is_dir());
        let path = ws.path().to_path_buf();

        ws.cleanup().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_leftover_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = TaskWorkspace::create(root.path(), "ua-002").await.unwrap();
            tokio::fs::write(ws.path().join("scratch.txt"), b"wip")
                .await
                .unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
