//! Processing task queue.
//!
//! Ingestion work is a chain of [`TaskType`]s per document. Workers
//! [`claim`](TaskQueue::claim) tasks under a time-bounded lease:
//!
//! | Status | Claimable | Meaning |
//! |--------|-----------|---------|
//! | `pending` | yes | never attempted |
//! | `processing` | only once `lease_expires_at` passes | held by a worker |
//! | `retrying` | yes | last attempt failed, attempts remain |
//! | `completed` | no | terminal |
//! | `failed` | no | terminal, `attempts == max_attempts` |
//!
//! Claiming is atomic and increments `attempts`. Among claimable tasks the
//! highest `priority` wins, then the oldest. The claimer's lease is stamped
//! on the task as `lease_expires_at`, so every worker judges expiry by the
//! holder's lease, not its own.
//!
//! [`complete`](TaskQueue::complete), [`fail`](TaskQueue::fail) and
//! [`abandon`](TaskQueue::abandon) only apply while the caller still holds
//! the task. Otherwise they change nothing and return [`LeaseLost`].
//!
//! The SQLite implementation lives in the application crate;
//! [`InMemoryTaskQueue`] backs tests and single-process hosts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LeaseLost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Parse,
    Chunk,
    Embed,
    Index,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [TaskType::Parse, TaskType::Chunk, TaskType::Embed, TaskType::Index];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Parse => "parse",
            TaskType::Chunk => "chunk",
            TaskType::Embed => "embed",
            TaskType::Index => "index",
        }
    }

    /// The stage enqueued when this one completes.
    pub fn next(&self) -> Option<TaskType> {
        match self {
            TaskType::Parse => Some(TaskType::Chunk),
            TaskType::Chunk => Some(TaskType::Embed),
            TaskType::Embed => Some(TaskType::Index),
            TaskType::Index => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "parse" => Ok(TaskType::Parse),
            "chunk" => Ok(TaskType::Chunk),
            "embed" => Ok(TaskType::Embed),
            "index" => Ok(TaskType::Index),
            other => bail!("unknown task type: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow!("unknown task status: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub id: String,
    pub document_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub payload: serde_json::Value,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Arguments to [`TaskQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub document_id: String,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: u32,
}

impl NewTask {
    pub fn new(document_id: impl Into<String>, task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            document_id: document_id.into(),
            task_type,
            payload,
            priority: 0,
            max_attempts: 3,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Count of tasks in one (type, status) cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStat {
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub count: u64,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add a task; returns its id.
    async fn enqueue(&self, task: NewTask) -> Result<String>;

    /// Atomically take the best claimable task, if any.
    async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<ProcessingTask>>;

    async fn complete(&self, task_id: &str, worker_id: &str) -> Result<()>;

    /// Record a failed attempt. Returns `true` if the task will be retried,
    /// `false` if it is now terminally failed.
    async fn fail(&self, task_id: &str, worker_id: &str, reason: &str) -> Result<bool>;

    /// Fail a task terminally, whatever its remaining attempts.
    async fn abandon(&self, task_id: &str, worker_id: &str, reason: &str) -> Result<()>;

    /// Enqueue unless the document already has an unfinished task of the
    /// same type. Returns the new task's id, or `None` if one was skipped.
    async fn enqueue_unique(&self, task: NewTask) -> Result<Option<String>>;

    /// Non-zero counts by type and status.
    async fn stats(&self) -> Result<Vec<QueueStat>>;
}

/// Whether `task` may be claimed at `now`.
pub fn is_claimable(task: &ProcessingTask, now: DateTime<Utc>) -> bool {
    match task.status {
        TaskStatus::Pending | TaskStatus::Retrying => true,
        TaskStatus::Processing => task.lease_expires_at.map_or(true, |at| at <= now),
        TaskStatus::Completed | TaskStatus::Failed => false,
    }
}

/// Whether `task` is still an unfinished unit of work.
pub fn is_open(task: &ProcessingTask) -> bool {
    matches!(
        task.status,
        TaskStatus::Pending | TaskStatus::Retrying | TaskStatus::Processing
    )
}

/// `now + lease`, saturating at the far future.
pub fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn release(task: &mut ProcessingTask) {
    task.locked_by = None;
    task.locked_at = None;
    task.lease_expires_at = None;
}

// ============ In-memory backend ============

#[derive(Default)]
pub struct InMemoryTaskQueue {
    tasks: Mutex<BTreeMap<String, ProcessingTask>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_id: &str) -> Option<ProcessingTask> {
        self.tasks.lock().ok()?.get(task_id).cloned()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, ProcessingTask>>> {
        self.tasks.lock().map_err(|_| anyhow!("task queue lock poisoned"))
    }

    /// Run `settle` on a task `worker_id` holds.
    fn settle<T>(
        &self,
        task_id: &str,
        worker_id: &str,
        settle: impl FnOnce(&mut ProcessingTask) -> T,
    ) -> Result<T> {
        let mut tasks = self.lock()?;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow!("unknown task {}", task_id))?;
        if task.status != TaskStatus::Processing || task.locked_by.as_deref() != Some(worker_id) {
            return Err(LeaseLost::new(task_id, worker_id).into());
        }
        let out = settle(task);
        release(task);
        Ok(out)
    }

    fn insert(tasks: &mut BTreeMap<String, ProcessingTask>, task: NewTask) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let row = ProcessingTask {
            id: id.clone(),
            document_id: task.document_id,
            task_type: task.task_type,
            status: TaskStatus::Pending,
            priority: task.priority,
            attempts: 0,
            max_attempts: task.max_attempts,
            payload: task.payload,
            locked_by: None,
            locked_at: None,
            lease_expires_at: None,
            last_error: None,
            created_at: Utc::now(),
        };
        tasks.insert(id.clone(), row);
        id
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<String> {
        let mut tasks = self.lock()?;
        Ok(Self::insert(&mut tasks, task))
    }

    async fn enqueue_unique(&self, task: NewTask) -> Result<Option<String>> {
        let mut tasks = self.lock()?;
        let duplicate = tasks
            .values()
            .any(|t| t.document_id == task.document_id && t.task_type == task.task_type && is_open(t));
        if duplicate {
            return Ok(None);
        }
        Ok(Some(Self::insert(&mut tasks, task)))
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<ProcessingTask>> {
        let now = Utc::now();
        let mut tasks = self.lock()?;
        let best = tasks
            .values()
            .filter(|t| is_claimable(t, now))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|t| t.id.clone());

        let Some(id) = best else {
            return Ok(None);
        };
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {} vanished during claim", id))?;
        task.status = TaskStatus::Processing;
        task.attempts += 1;
        task.locked_by = Some(worker_id.to_string());
        task.locked_at = Some(now);
        task.lease_expires_at = Some(lease_deadline(now, lease));
        Ok(Some(task.clone()))
    }

    async fn complete(&self, task_id: &str, worker_id: &str) -> Result<()> {
        self.settle(task_id, worker_id, |task| task.status = TaskStatus::Completed)
    }

    async fn fail(&self, task_id: &str, worker_id: &str, reason: &str) -> Result<bool> {
        self.settle(task_id, worker_id, |task| {
            let retryable = task.attempts < task.max_attempts;
            task.status = if retryable {
                TaskStatus::Retrying
            } else {
                TaskStatus::Failed
            };
            task.last_error = Some(reason.to_string());
            retryable
        })
    }

    async fn abandon(&self, task_id: &str, worker_id: &str, reason: &str) -> Result<()> {
        self.settle(task_id, worker_id, |task| {
            task.status = TaskStatus::Failed;
            task.last_error = Some(reason.to_string());
        })
    }

    async fn stats(&self) -> Result<Vec<QueueStat>> {
        let tasks = self.lock()?;
        let mut counts: BTreeMap<(TaskType, TaskStatus), u64> = BTreeMap::new();
        for t in tasks.values() {
            *counts.entry((t.task_type, t.status)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((task_type, status), count)| QueueStat {
                task_type,
                status,
                count,
            })
            .collect())
    }
}
