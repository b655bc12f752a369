//! Supervision of detached background work
//!
//! Save-and-exit, detached transfers and relabel passes outlive the request
//! that started them. Each one runs under the [`TaskSupervisor`], which
//! records its kind, job, outcome (including panics) and timing so operators
//! can see what happened.
//!
//! Every task receives its own child of the supervisor's shutdown token, so
//! one task can be cancelled with [`TaskSupervisor::cancel`] and all of them
//! with [`TaskSupervisor::shutdown`]. Cancellation is cooperative: the work
//! observes the token at its own suspension points.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::labels::ExternalId;
use crate::Error;

/// What a background task does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Upload outputs, then tear down
    SaveAndExit,
    /// Detached input download
    Download,
    /// Detached output upload
    Upload,
    /// Label repair pass
    Relabel,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskKind::SaveAndExit => "save-and-exit",
            TaskKind::Download => "download",
            TaskKind::Upload => "upload",
            TaskKind::Relabel => "relabel",
        })
    }
}

/// Lifecycle of a background task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Still executing
    Running,
    /// Returned `Ok`
    Succeeded,
    /// Returned `Err` or panicked
    Failed,
}

/// Observable record of one task.
#[derive(Clone, Debug, Serialize)]
pub struct TaskRecord {
    /// Task id
    pub id: Uuid,
    /// What it does
    pub kind: TaskKind,
    /// Job it acts on, if any
    pub external_id: Option<String>,
    /// Current state
    pub state: TaskState,
    /// Summary on success, error on failure
    pub message: Option<String>,
    /// When it was spawned
    pub started_at: DateTime<Utc>,
    /// When it finished
    pub finished_at: Option<DateTime<Utc>>,
}

/// Registry and runner for background tasks.
#[derive(Clone)]
pub struct TaskSupervisor {
    tasks: Arc<DashMap<Uuid, TaskRecord>>,
    /// Tokens of tasks still running
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
    history: usize,
    shutdown: CancellationToken,
}

impl TaskSupervisor {
    /// Supervisor keeping at most `history` finished records
    pub fn new(history: usize) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            tokens: Arc::new(DashMap::new()),
            history,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled when the supervisor shuts down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Cancel every task that watches the supervisor's token
    pub fn shutdown(&self) {
        info!(running = self.running(), "Cancelling background tasks");
        self.shutdown.cancel();
    }

    /// Cancel one running task. Returns false when it is unknown or already
    /// finished.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.tokens.get(id) {
            Some(token) => {
                info!(task_id = %id, "Cancelling background task");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Spawn the future built by `work` and track it. Returns the task id
    /// immediately.
    ///
    /// `work` is handed the task's cancellation token and resolves to a short
    /// summary on success.
    pub fn spawn<W, F>(&self, kind: TaskKind, external_id: Option<&ExternalId>, work: W) -> Uuid
    where
        W: FnOnce(CancellationToken) -> F + Send + 'static,
        F: Future<Output = Result<String, Error>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let token = self.shutdown.child_token();
        self.tokens.insert(id, token.clone());
        let job = external_id.map(|e| e.as_str().to_string());
        self.tasks.insert(
            id,
            TaskRecord {
                id,
                kind,
                external_id: job.clone(),
                state: TaskState::Running,
                message: None,
                started_at: Utc::now(),
                finished_at: None,
            },
        );
        info!(task_id = %id, kind = %kind, external_id = ?job, "Spawned background task");

        let this = self.clone();
        tokio::spawn(async move {
            // Inner spawn so a panic surfaces as a JoinError instead of
            // taking the bookkeeping down with it.
            let (state, message) = match tokio::spawn(work(token)).await {
                Ok(Ok(summary)) => (TaskState::Succeeded, summary),
                Ok(Err(e)) => (TaskState::Failed, e.to_string()),
                Err(join) if join.is_panic() => (
                    TaskState::Failed,
                    format!("task panicked: {}", panic_message(join.into_panic())),
                ),
                Err(join) => (TaskState::Failed, format!("task aborted: {}", join)),
            };
            this.finish(id, state, message);
        });

        id
    }

    fn finish(&self, id: Uuid, state: TaskState, message: String) {
        self.tokens.remove(&id);
        if let Some(mut record) = self.tasks.get_mut(&id) {
            if state == TaskState::Failed {
                error!(task_id = %id, kind = %record.kind, error = %message, "Background task failed");
            } else {
                info!(task_id = %id, kind = %record.kind, summary = %message, "Background task finished");
            }
            record.state = state;
            record.message = Some(message);
            record.finished_at = Some(Utc::now());
        } else {
            warn!(task_id = %id, "Finished task has no record");
        }
        self.prune();
    }

    /// Drop the oldest finished records beyond the history limit.
    fn prune(&self) {
        let mut finished: Vec<(DateTime<Utc>, Uuid)> = self
            .tasks
            .iter()
            .filter_map(|r| r.finished_at.map(|at| (at, r.id)))
            .collect();
        if finished.len() <= self.history {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.history;
        for (_, id) in finished.into_iter().take(excess) {
            self.tasks.remove(&id);
        }
    }

    /// Record for one task
    pub fn get(&self, id: &Uuid) -> Option<TaskRecord> {
        self.tasks.get(id).map(|r| r.clone())
    }

    /// All records, oldest first
    pub fn list(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.tasks.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    /// Tasks still running
    pub fn running(&self) -> usize {
        self.tasks
            .iter()
            .filter(|r| r.state == TaskState::Running)
            .count()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for(supervisor: &TaskSupervisor, id: Uuid) -> TaskRecord {
        for _ in 0..200 {
            if let Some(record) = supervisor.get(&id) {
                if record.state != TaskState::Running {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} did not finish", id);
    }

    #[tokio::test]
    async fn test_success_is_recorded() {
        let supervisor = TaskSupervisor::new(10);
        let job = ExternalId::new("abc123").unwrap();
        let id = supervisor.spawn(TaskKind::Upload, Some(&job), |_| async {
            Ok("uploaded".to_string())
        });

        let record = wait_for(&supervisor, id).await;
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(record.message.as_deref(), Some("uploaded"));
        assert_eq!(record.external_id.as_deref(), Some("abc123"));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_error_is_recorded() {
        let supervisor = TaskSupervisor::new(10);
        let id = supervisor.spawn(TaskKind::Relabel, None, |_| async {
            Err(Error::internal("apiserver unreachable"))
        });

        let record = wait_for(&supervisor, id).await;
        assert_eq!(record.state, TaskState::Failed);
        assert!(record.message.unwrap().contains("apiserver unreachable"));
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_failure() {
        let supervisor = TaskSupervisor::new(10);
        let id = supervisor.spawn(TaskKind::SaveAndExit, None, |_| async {
            let missing: Option<String> = None;
            Ok(missing.expect("boom"))
        });

        let record = wait_for(&supervisor, id).await;
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.message.as_deref(), Some("task panicked: boom"));
    }

    #[tokio::test]
    async fn test_running_tasks_are_visible() {
        let supervisor = TaskSupervisor::new(10);
        let id = supervisor.spawn(TaskKind::Download, None, |token| async move {
            token.cancelled().await;
            Ok("cancelled".to_string())
        });

        assert_eq!(supervisor.get(&id).unwrap().state, TaskState::Running);
        assert_eq!(supervisor.running(), 1);

        supervisor.shutdown();
        let record = wait_for(&supervisor, id).await;
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_only_the_named_task() {
        let supervisor = TaskSupervisor::new(10);
        let spawn_waiter = |name: &'static str| {
            supervisor.spawn(TaskKind::Upload, None, move |token| async move {
                token.cancelled().await;
                Ok(format!("{} cancelled", name))
            })
        };
        let first = spawn_waiter("first");
        let second = spawn_waiter("second");

        assert!(supervisor.cancel(&first));
        let record = wait_for(&supervisor, first).await;
        assert_eq!(record.message.as_deref(), Some("first cancelled"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(supervisor.get(&second).unwrap().state, TaskState::Running);
        assert!(!supervisor.cancel(&first));
        assert!(!supervisor.cancel(&Uuid::new_v4()));

        supervisor.shutdown();
        wait_for(&supervisor, second).await;
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let supervisor = TaskSupervisor::new(2);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = supervisor.spawn(TaskKind::Relabel, None, |_| async { Ok(String::new()) });
            wait_for(&supervisor, id).await;
            ids.push(id);
        }

        // Pruning runs right after the last record flips to finished.
        for _ in 0..200 {
            if supervisor.list().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(supervisor.list().len(), 2);
        assert!(supervisor.get(&ids[3]).is_some());
        assert!(supervisor.get(&ids[0]).is_none());
    }
}
