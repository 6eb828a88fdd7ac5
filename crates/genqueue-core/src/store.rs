//! In-memory task records with per-task change notifications.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use genqueue_common::{GenqueueError, Result};
use serde::Serialize;
use tokio::sync::{watch, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub prompt: String,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outputs: Vec<String>,
    pub new_tokens: Option<usize>,
}

pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

pub fn new_task_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

struct Entry {
    tx: watch::Sender<TaskRecord>,
}

#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Entry>>,
}

impl TaskStore {
    pub fn new() -> Self { Self::default() }

    pub async fn create(&self, prompt: String) -> TaskRecord {
        let record = TaskRecord {
            task_id: new_task_id(),
            status: TaskStatus::Pending,
            prompt,
            created_at_ms: now_ms(),
            started_at_ms: None,
            finished_at_ms: None,
            error: None,
            outputs: Vec::new(),
            new_tokens: None,
        };
        let (tx, _rx) = watch::channel(record.clone());
        self.tasks.write().await.insert(record.task_id.clone(), Entry { tx });
        record
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.read().await.get(task_id).map(|e| e.tx.borrow().clone())
    }

    /// Oldest first.
    pub async fn list(&self) -> Vec<TaskRecord> {
        let mut all: Vec<TaskRecord> = self.tasks.read().await.values().map(|e| e.tx.borrow().clone()).collect();
        all.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.task_id.cmp(&b.task_id)));
        all
    }

    pub async fn subscribe(&self, task_id: &str) -> Option<watch::Receiver<TaskRecord>> {
        self.tasks.read().await.get(task_id).map(|e| e.tx.subscribe())
    }

    pub async fn counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for entry in self.tasks.read().await.values() {
            *counts.entry(entry.tx.borrow().status).or_insert(0) += 1;
        }
        counts
    }

    pub async fn mark_running(&self, task_id: &str) -> Result<TaskRecord> {
        self.transition(task_id, TaskStatus::Running, |r| r.started_at_ms = Some(now_ms())).await
    }

    pub async fn mark_complete(&self, task_id: &str, outputs: Vec<String>, new_tokens: usize) -> Result<TaskRecord> {
        self.transition(task_id, TaskStatus::Complete, |r| {
            r.finished_at_ms = Some(now_ms());
            r.outputs = outputs;
            r.new_tokens = Some(new_tokens);
        })
        .await
    }

    pub async fn mark_failed(&self, task_id: &str, error: String) -> Result<TaskRecord> {
        self.transition(task_id, TaskStatus::Failed, |r| {
            r.finished_at_ms = Some(now_ms());
            r.error = Some(error);
        })
        .await
    }

    async fn transition(&self, task_id: &str, to: TaskStatus, update: impl FnOnce(&mut TaskRecord)) -> Result<TaskRecord> {
        let tasks = self.tasks.read().await;
        let entry = tasks.get(task_id).ok_or_else(|| GenqueueError::TaskNotFound(task_id.to_string()))?;
        let mut outcome = Err(GenqueueError::TaskNotFound(task_id.to_string()));
        // check and update under the channel's lock so concurrent transitions serialize
        entry.tx.send_if_modified(|r| {
            let allowed = matches!(
                (r.status, to),
                (TaskStatus::Pending, TaskStatus::Running)
                    | (TaskStatus::Pending | TaskStatus::Running, TaskStatus::Failed)
                    | (TaskStatus::Running, TaskStatus::Complete)
            );
            if !allowed {
                outcome = Err(GenqueueError::Message(format!(
                    "task {task_id} cannot move from {} to {}",
                    r.status.as_str(),
                    to.as_str()
                )));
                return false;
            }
            r.status = to;
            update(r);
            outcome = Ok(r.clone());
            true
        });
        outcome
    }
}
