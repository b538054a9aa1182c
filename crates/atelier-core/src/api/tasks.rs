//! Task submission and observation on AtelierApi.

use crate::error::{AtelierError, Result};
use crate::network::CollisionPolicy;
use crate::tasks::{Task, TaskId, TaskSpec, TaskSubscription};
use crate::AtelierApi;
use std::path::{Path, PathBuf};

impl AtelierApi {
    // ========================================
    // Task Submission
    // ========================================

    /// Rescan a library root, named by alias or by a path inside a
    /// configured root.
    pub async fn refresh_folder(&self, target: &str) -> Result<TaskId> {
        let settings = &self.inner.settings;
        let spec = if let Some(root) = settings.library(target) {
            TaskSpec::Scan {
                root: root.path.clone(),
                mode: root.mode,
                model_type: root.model_type.clone(),
            }
        } else {
            let path = PathBuf::from(target);
            let root = settings
                .library_for_path(&path)
                .ok_or_else(|| AtelierError::Validation {
                    field: "target".to_string(),
                    message: format!("'{}' is neither a library alias nor inside one", target),
                })?;
            TaskSpec::Scan {
                root: path,
                mode: root.mode,
                model_type: root.model_type.clone(),
            }
        };
        self.inner.orchestrator.submit(spec).await
    }

    /// Compute the full identity of a file.
    pub async fn hash_asset(&self, path: impl AsRef<Path>) -> Result<TaskId> {
        let spec = TaskSpec::Hash {
            path: path.as_ref().to_path_buf(),
        };
        self.inner.orchestrator.submit(spec).await
    }

    /// Identify a file and look it up on the registry by hash. Copies of a
    /// file already being matched attach to that task.
    pub async fn auto_match(&self, path: impl AsRef<Path>) -> Result<TaskId> {
        let spec = TaskSpec::MatchMetadata {
            path: path.as_ref().to_path_buf(),
        };
        self.inner.orchestrator.submit(spec).await
    }

    /// Attach the metadata behind a registry URL to a local file.
    pub async fn match_by_url(&self, path: impl AsRef<Path>, url: &str) -> Result<TaskId> {
        let spec = TaskSpec::DownloadMetadataByUrl {
            path: path.as_ref().to_path_buf(),
            url: url.to_string(),
        };
        self.inner.orchestrator.submit(spec).await
    }

    /// Download the primary file behind a registry URL into `dest_dir`.
    pub async fn download_model(
        &self,
        url: &str,
        dest_dir: impl AsRef<Path>,
        policy: CollisionPolicy,
    ) -> Result<TaskId> {
        let spec = TaskSpec::DownloadModel {
            url: url.to_string(),
            dest_dir: dest_dir.as_ref().to_path_buf(),
            policy,
        };
        self.inner.orchestrator.submit(spec).await
    }

    // ========================================
    // Network Queue
    // ========================================

    /// Hold back registry lookups and downloads. Running ones finish;
    /// queued ones wait for [`resume`](Self::resume).
    pub fn pause(&self) {
        self.inner.orchestrator.pause()
    }

    pub fn resume(&self) {
        self.inner.orchestrator.resume()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.orchestrator.is_paused()
    }

    // ========================================
    // Task Observation
    // ========================================

    /// Subscribe to the task stream.
    pub fn subscribe(&self) -> TaskSubscription {
        self.inner.orchestrator.subscribe()
    }

    /// Request cancellation. Returns `false` if the task already finished.
    pub fn cancel(&self, id: TaskId) -> Result<bool> {
        self.inner.orchestrator.cancel(id)
    }

    /// Wait for a task to reach a terminal state.
    pub async fn wait(&self, id: TaskId) -> Result<Task> {
        self.inner.orchestrator.wait(id).await
    }

    /// Drop finished tasks from the list.
    pub fn clear_done(&self) -> usize {
        self.inner.orchestrator.clear_done()
    }

    /// Snapshot of every known task, in submission order.
    pub fn tasks(&self) -> Vec<Task> {
        self.inner.orchestrator.list()
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.inner.orchestrator.get(id)
    }
}
