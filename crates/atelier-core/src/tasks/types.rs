//! Task model: specs, snapshots and events.

use crate::error::AtelierError;
use crate::identity::ContentIdentity;
use crate::network::CollisionPolicy;
use crate::registry::RemoteMetadata;
use crate::scan::{AssetMode, AssetPath, ModelType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = AtelierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(TaskId)
            .map_err(|e| AtelierError::Validation {
                field: "task_id".to_string(),
                message: e.to_string(),
            })
    }
}

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Scan,
    Hash,
    MatchMetadata,
    DownloadModel,
    DownloadMetadataByUrl,
}

/// Worker pool a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// Disk-bound work: scanning and hashing
    Local,
    /// Registry lookups and downloads
    Network,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Scan => "scan",
            TaskKind::Hash => "hash",
            TaskKind::MatchMetadata => "match_metadata",
            TaskKind::DownloadModel => "download_model",
            TaskKind::DownloadMetadataByUrl => "download_metadata_by_url",
        }
    }

    pub fn pool(&self) -> Pool {
        match self {
            TaskKind::Scan | TaskKind::Hash => Pool::Local,
            TaskKind::MatchMetadata | TaskKind::DownloadModel | TaskKind::DownloadMetadataByUrl => {
                Pool::Network
            }
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state. `Queued -> Running -> terminal`, or `Queued -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    NotFound,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }

    /// Terminal status for a failed execution.
    pub fn from_error(err: &AtelierError) -> Self {
        match err {
            AtelierError::NotFound { .. } => TaskStatus::NotFound,
            AtelierError::Cancelled => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::NotFound => "not_found",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task progress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum TaskProgress {
    /// Total unknown and nothing counted yet
    Indeterminate,
    /// Items processed so far, total unknown
    Count(u64),
    /// 0 to 100
    Percent(f32),
}

impl TaskProgress {
    pub fn percent(value: f32) -> Self {
        TaskProgress::Percent(value.clamp(0.0, 100.0))
    }
}

impl fmt::Display for TaskProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskProgress::Indeterminate => f.write_str("-"),
            TaskProgress::Count(n) => write!(f, "{} items", n),
            TaskProgress::Percent(p) => write!(f, "{:.1}%", p),
        }
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskSpec {
    /// Walk a library root.
    Scan {
        root: PathBuf,
        mode: AssetMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_type: Option<ModelType>,
    },
    /// Compute the full identity of a file.
    Hash { path: PathBuf },
    /// Identify a local file and look it up on the registry by hash.
    MatchMetadata { path: PathBuf },
    /// Resolve a registry URL and download its primary file.
    DownloadModel {
        url: String,
        dest_dir: PathBuf,
        #[serde(default)]
        policy: CollisionPolicy,
    },
    /// Attach the metadata behind a registry URL to a local file.
    DownloadMetadataByUrl { path: PathBuf, url: String },
}

impl TaskSpec {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskSpec::Scan { .. } => TaskKind::Scan,
            TaskSpec::Hash { .. } => TaskKind::Hash,
            TaskSpec::MatchMetadata { .. } => TaskKind::MatchMetadata,
            TaskSpec::DownloadModel { .. } => TaskKind::DownloadModel,
            TaskSpec::DownloadMetadataByUrl { .. } => TaskKind::DownloadMetadataByUrl,
        }
    }

    /// Dedup key: the path or URL the task works on. Downloads also name
    /// their destination folder.
    pub fn key(&self) -> String {
        match self {
            TaskSpec::Scan { root, .. } => root.display().to_string(),
            TaskSpec::Hash { path } | TaskSpec::MatchMetadata { path } => {
                path.display().to_string()
            }
            TaskSpec::DownloadModel { url, dest_dir, .. } => {
                format!("{} -> {}", url, dest_dir.display())
            }
            TaskSpec::DownloadMetadataByUrl { path, url } => {
                format!("{} <- {}", path.display(), url)
            }
        }
    }
}

/// Result carried by a succeeded task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TaskOutput {
    Scanned {
        assets: Vec<AssetPath>,
    },
    Identified {
        identity: ContentIdentity,
    },
    Matched {
        hash: String,
        metadata: RemoteMetadata,
    },
    Downloaded {
        path: PathBuf,
        hash: String,
        skipped: bool,
    },
}

/// Snapshot of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub key: String,
    pub status: TaskStatus,
    pub progress: TaskProgress,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Callers that submitted or attached to this task
    pub observers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TaskOutput>,
}

impl Task {
    pub(crate) fn queued(id: TaskId, spec: &TaskSpec) -> Self {
        Self {
            id,
            kind: spec.kind(),
            key: spec.key(),
            status: TaskStatus::Queued,
            progress: TaskProgress::Indeterminate,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            observers: 1,
            output: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One state change on the task stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub key: String,
    pub status: TaskStatus,
    pub progress: TaskProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Task> for TaskEvent {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind,
            key: task.key.clone(),
            status: task.status,
            progress: task.progress,
            error: task.error.clone(),
        }
    }
}
