//! Task orchestrator: dedup, two FIFO worker pools, cancellation, a network
//! pause switch and a push stream of state changes.

use super::executor::{normalize_path, TaskContext, TaskExecutor};
use super::table::TaskTable;
use super::types::{Pool, Task, TaskEvent, TaskId, TaskSpec};
use crate::config::TaskConfig;
use crate::error::{AtelierError, Result};
use crate::network::RetryConfig;
use crate::settings::Settings;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Workers for scan and hash tasks.
    pub local_workers: usize,
    /// Workers for registry lookups and downloads.
    pub network_workers: usize,
    pub retry: RetryConfig,
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            local_workers: TaskConfig::DEFAULT_LOCAL_WORKERS,
            network_workers: TaskConfig::DEFAULT_NETWORK_WORKERS,
            retry: RetryConfig::default(),
            event_capacity: TaskConfig::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl From<&Settings> for OrchestratorConfig {
    fn from(settings: &Settings) -> Self {
        Self::default()
            .with_local_workers(settings.concurrency.local_workers)
            .with_network_workers(settings.concurrency.network_workers)
            .with_retry(settings.retry.clone().into())
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_workers(mut self, workers: usize) -> Self {
        self.local_workers = workers.max(1);
        self
    }

    pub fn with_network_workers(mut self, workers: usize) -> Self {
        self.network_workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

type Job = (TaskId, TaskSpec);

/// Receiving side of the task stream.
///
/// Wraps a broadcast receiver; a subscriber that falls behind skips the
/// events it missed instead of failing.
pub struct TaskSubscription {
    rx: broadcast::Receiver<TaskEvent>,
}

impl TaskSubscription {
    /// Next event, or `None` once the orchestrator is gone.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Task subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already waiting.
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Schedules tasks on the local and network pools.
///
/// Must be created inside a Tokio runtime; workers are spawned immediately
/// and stop when the orchestrator is dropped.
pub struct TaskOrchestrator {
    table: Arc<TaskTable>,
    local: mpsc::UnboundedSender<Job>,
    network: mpsc::UnboundedSender<Job>,
    executor: Arc<TaskExecutor>,
    /// `true` while network workers are held back
    paused: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskOrchestrator {
    pub fn new(config: OrchestratorConfig, executor: TaskExecutor) -> Self {
        let table = Arc::new(TaskTable::new(config.event_capacity));
        let executor = Arc::new(executor);

        let (local, local_rx) = mpsc::unbounded_channel();
        let (network, network_rx) = mpsc::unbounded_channel();
        let (paused, paused_rx) = watch::channel(false);
        let mut workers = Vec::new();
        workers.extend(spawn_pool(
            "local",
            config.local_workers,
            local_rx,
            None,
            &table,
            &executor,
        ));
        workers.extend(spawn_pool(
            "network",
            config.network_workers,
            network_rx,
            Some(paused_rx),
            &table,
            &executor,
        ));
        info!(
            "Task orchestrator started ({} local, {} network workers)",
            config.local_workers, config.network_workers
        );

        Self {
            table,
            local,
            network,
            executor,
            paused,
            workers,
        }
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Queue `spec`, or attach to an identical task already in flight.
    ///
    /// Match tasks are identical when their files share a fast hash and
    /// size, so copies of one model collapse into a single lookup.
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        let spec = normalize_spec(spec);
        let key = self.dedup_key(&spec).await;
        let admission = self.table.insert_or_attach(&spec, key);
        if !admission.created {
            return Ok(admission.id);
        }

        debug!("Queued {} task {} for {}", spec.kind(), admission.id, spec.key());
        let queue = match spec.kind().pool() {
            Pool::Local => &self.local,
            Pool::Network => &self.network,
        };
        if queue.send((admission.id, spec)).is_err() {
            let _ = self.table.start(admission.id);
            self.table.finish(
                admission.id,
                Err(AtelierError::Other("task workers have shut down".to_string())),
            );
            return Err(AtelierError::Other("task workers have shut down".to_string()));
        }
        Ok(admission.id)
    }

    async fn dedup_key(&self, spec: &TaskSpec) -> String {
        let TaskSpec::MatchMetadata { path } = spec else {
            return spec.key();
        };
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => return spec.key(),
        };
        match self.executor.identity().fast_identity(path).await {
            Ok(fast_hash) => format!("{}:{}", fast_hash, size),
            Err(e) => {
                debug!("No fast hash for {}: {}", path.display(), e);
                spec.key()
            }
        }
    }

    /// Stop network workers from taking new jobs. Running jobs finish;
    /// queued ones stay queued until [`resume`](Self::resume).
    pub fn pause(&self) {
        let changed = self.paused.send_if_modified(|paused| !std::mem::replace(paused, true));
        if changed {
            info!("Network tasks paused");
        }
    }

    pub fn resume(&self) {
        let changed = self.paused.send_if_modified(|paused| std::mem::replace(paused, false));
        if changed {
            info!("Network tasks resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn subscribe(&self) -> TaskSubscription {
        TaskSubscription {
            rx: self.table.subscribe(),
        }
    }

    /// Request cancellation; `false` if the task had already finished.
    pub fn cancel(&self, id: TaskId) -> Result<bool> {
        let cancelled = self.table.cancel(id)?;
        if cancelled {
            info!("Cancellation requested for task {}", id);
        }
        Ok(cancelled)
    }

    /// Wait for the task's terminal snapshot.
    pub async fn wait(&self, id: TaskId) -> Result<Task> {
        let mut rx = self.table.watch(id).ok_or_else(|| AtelierError::NotFound {
            what: format!("task {}", id),
        })?;
        let task = rx
            .wait_for(|task| task.is_terminal())
            .await
            .map_err(|_| AtelierError::Other(format!("task {} was dropped", id)))?;
        Ok(task.clone())
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.table.get(id)
    }

    /// Every known task, in submission order.
    pub fn list(&self) -> Vec<Task> {
        self.table.list()
    }

    /// Remove finished tasks (succeeded, failed, not found or cancelled).
    pub fn clear_done(&self) -> usize {
        let removed = self.table.clear_done();
        debug!("Cleared {} finished tasks", removed);
        removed
    }

    /// Cancel everything still queued or running.
    pub fn cancel_all(&self) {
        self.table.cancel_all();
    }
}

impl Drop for TaskOrchestrator {
    fn drop(&mut self) {
        self.table.cancel_all();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

fn normalize_spec(spec: TaskSpec) -> TaskSpec {
    match spec {
        TaskSpec::Scan {
            root,
            mode,
            model_type,
        } => TaskSpec::Scan {
            root: normalize_path(&root),
            mode,
            model_type,
        },
        TaskSpec::Hash { path } => TaskSpec::Hash {
            path: normalize_path(&path),
        },
        TaskSpec::MatchMetadata { path } => TaskSpec::MatchMetadata {
            path: normalize_path(&path),
        },
        TaskSpec::DownloadMetadataByUrl { path, url } => TaskSpec::DownloadMetadataByUrl {
            path: normalize_path(&path),
            url: url.trim().to_string(),
        },
        TaskSpec::DownloadModel {
            url,
            dest_dir,
            policy,
        } => TaskSpec::DownloadModel {
            url: url.trim().to_string(),
            dest_dir: normalize_path(&dest_dir),
            policy,
        },
    }
}

fn spawn_pool(
    name: &'static str,
    size: usize,
    rx: mpsc::UnboundedReceiver<Job>,
    paused: Option<watch::Receiver<bool>>,
    table: &Arc<TaskTable>,
    executor: &Arc<TaskExecutor>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..size)
        .map(|index| {
            let rx = rx.clone();
            let mut paused = paused.clone();
            let table = table.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                loop {
                    if !wait_unpaused(paused.as_mut()).await {
                        break;
                    }
                    // Hold the receiver only while waiting, so jobs go out in
                    // FIFO order to whichever worker is free.
                    let job = rx.lock().await.recv().await;
                    let Some((id, spec)) = job else {
                        break;
                    };
                    // A pause that landed while this worker waited leaves the
                    // job queued until resume.
                    if !wait_unpaused(paused.as_mut()).await {
                        break;
                    }
                    run_job(&table, &executor, id, spec).await;
                }
                debug!("{} worker {} stopped", name, index);
            })
        })
        .collect()
}

/// Wait until the pool is not paused. `false` once the orchestrator is gone.
async fn wait_unpaused(paused: Option<&mut watch::Receiver<bool>>) -> bool {
    match paused {
        Some(paused) => paused.wait_for(|paused| !*paused).await.is_ok(),
        None => true,
    }
}

async fn run_job(table: &Arc<TaskTable>, executor: &Arc<TaskExecutor>, id: TaskId, spec: TaskSpec) {
    let Some(cancel) = table.start(id) else {
        debug!("Skipping task {}: no longer queued", id);
        return;
    };
    let ctx = TaskContext::new(id, cancel, table.clone());

    // Run on its own task so a panic fails this task instead of the worker.
    let job_executor = executor.clone();
    let handle = tokio::spawn(async move { job_executor.execute(&spec, &ctx).await });
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => {
            error!("Task {} panicked: {}", id, e);
            Err(AtelierError::Other(format!("task panicked: {}", e)))
        }
    };

    match &result {
        Ok(_) => debug!("Task {} succeeded", id),
        Err(AtelierError::NotFound { what }) => info!("Task {}: not found ({})", id, what),
        Err(AtelierError::Cancelled) => info!("Task {} cancelled", id),
        Err(e) => warn!("Task {} failed: {}", id, e),
    }
    table.finish(id, result);
}
