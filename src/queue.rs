use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::Source;
use crate::downloader::{DownloadRequest, Executor};
use crate::error::QueueError;
use crate::progress::Reporter;
use crate::utils::limited_spawner::LimitedSpawner;

/// A download as submitted by a client, before it gets a task id.
#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    pub url: String,
    pub path: String,
    pub model_id: String,
    pub source: Source,
}

struct TaskHandle {
    cancel: CancellationToken,
    destination: String,
    model_id: String,
}

/// Live tasks keyed by task id. An entry exists from admission until the
/// task has stopped touching its file, and is gone before the terminal event
/// is published.
type Registry = Arc<Mutex<HashMap<String, TaskHandle>>>;

pub struct TaskQueue {
    executor: Arc<Executor>,
    spawner: LimitedSpawner,
    storage_root: PathBuf,
    tasks: Registry,
    idle: Arc<Notify>,
}

/// Drop `task_id` from the registry and wake anyone draining the queue.
async fn release(tasks: &Registry, idle: &Notify, task_id: &str) -> Option<TaskHandle> {
    let handle = tasks.lock().await.remove(task_id);
    idle.notify_waiters();
    handle
}

impl TaskQueue {
    pub fn new(executor: Arc<Executor>, storage_root: PathBuf, workers: usize) -> Self {
        Self {
            executor,
            spawner: LimitedSpawner::new(workers.max(1)),
            storage_root,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Admit `submission` and return its task id without waiting for a
    /// worker.
    pub async fn submit(&self, submission: Submission) -> Result<String, QueueError> {
        let destination = destination_key(&submission.path);
        let task_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        {
            let mut tasks = self.tasks.lock().await;
            if tasks.values().any(|t| t.destination == destination) {
                return Err(QueueError::DuplicateDestination(submission.path));
            }
            tasks.insert(
                task_id.clone(),
                TaskHandle {
                    cancel: cancel.clone(),
                    destination,
                    model_id: submission.model_id.clone(),
                },
            );
        }

        let request = DownloadRequest {
            remote_url: submission.url,
            relative_path: submission.path,
            model_id: submission.model_id,
            source: submission.source,
            storage_root: self.storage_root.clone(),
        };
        let name = request.file_name();
        Reporter::new(self.executor.publisher().as_ref(), &request.model_id, &name).queued();
        info!(
            "queued task {} for {} into {}",
            task_id, request.model_id, request.relative_path
        );

        let executor = Arc::clone(&self.executor);
        let token = cancel.clone();
        let (tasks, idle, id) = (
            Arc::clone(&self.tasks),
            Arc::clone(&self.idle),
            task_id.clone(),
        );
        let job = self.spawner.spawn(cancel, async move {
            // The destination is free again before subscribers hear the
            // outcome, so an immediate resubmission is accepted.
            let _ = executor
                .execute_then(&request, &token, async {
                    release(&tasks, &idle, &id).await;
                })
                .await;
        });

        let executor = Arc::clone(&self.executor);
        let (tasks, idle, id) = (
            Arc::clone(&self.tasks),
            Arc::clone(&self.idle),
            task_id.clone(),
        );
        tokio::spawn(async move {
            let finished = job.await;
            let handle = release(&tasks, &idle, &id).await;
            match finished {
                Ok(Some(())) => {}
                Ok(None) => {
                    if let Some(handle) = handle {
                        info!("task {} cancelled before it started", id);
                        let name = file_name_of(&handle.destination);
                        Reporter::new(executor.publisher().as_ref(), &handle.model_id, &name)
                            .cancelled();
                    }
                }
                Err(err) => {
                    error!("task {} aborted: {}", id, err);
                    if let Some(handle) = handle {
                        let name = file_name_of(&handle.destination);
                        Reporter::new(executor.publisher().as_ref(), &handle.model_id, &name)
                            .failed(format!("internal error: {}", err));
                    }
                }
            }
        });

        Ok(task_id)
    }

    /// Request cancellation of a queued or running task. The terminal
    /// `cancelled` event follows once the task has stopped.
    pub async fn cancel(&self, task_id: &str) -> Result<(), QueueError> {
        let tasks = self.tasks.lock().await;
        match tasks.get(task_id) {
            Some(handle) => {
                info!("cancelling task {} ({})", task_id, handle.model_id);
                handle.cancel.cancel();
                Ok(())
            }
            None => Err(QueueError::UnknownTask(task_id.to_string())),
        }
    }

    pub async fn cancel_all(&self) {
        for handle in self.tasks.lock().await.values() {
            handle.cancel.cancel();
        }
    }

    /// Number of tasks queued or running.
    pub async fn active(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Wait up to `grace` for every task to stop. Returns whether the queue
    /// went idle in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let idle = tokio::time::timeout(grace, async {
            loop {
                let notified = self.idle.notified();
                if self.active().await == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok();
        if !idle {
            warn!(
                "{} tasks still running after {:?}",
                self.active().await,
                grace
            );
        }
        idle
    }
}

/// Lexically normalized destination, used to keep one writer per file.
fn destination_key(relative: &str) -> String {
    Path::new(relative)
        .components()
        .filter_map(|c| match c {
            Component::CurDir => None,
            other => Some(other.as_os_str().to_string_lossy().into_owned()),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn file_name_of(destination: &str) -> String {
    destination
        .rsplit('/')
        .next()
        .unwrap_or(destination)
        .to_string()
}
