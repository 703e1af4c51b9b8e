//! Ingestion worker pool.
//!
//! `pool_size` workers each loop: claim a task, run its stage, complete or
//! fail it. A worker holds at most one task at a time. `parse` tasks also
//! take a permit from a shared semaphore sized by
//! `max_concurrent_extractions`, so the extraction collaborator never sees
//! more concurrent documents than that.
//!
//! Each task runs against the `lease_expires_at` stamped when it was
//! claimed, including any wait for an extraction permit. A task still
//! running at that instant is cut off and failed. If another worker has
//! reclaimed it by the time the outcome is recorded, the queue answers
//! [`LeaseLost`] and the outcome is dropped with a warning.
//!
//! Shutdown is cooperative: once the watch channel flips to `true`, workers
//! finish their current task and stop claiming.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use finsight_core::error::LeaseLost;
use finsight_core::queue::{ProcessingTask, TaskType};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use crate::config::WorkerConfig;
use crate::ingest::Ingestor;

/// Tallies from one pool run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub completed: usize,
    pub failed: usize,
    /// Tasks whose outcome was dropped because another worker took them over.
    pub lost: usize,
}

impl std::ops::AddAssign for WorkerReport {
    fn add_assign(&mut self, other: Self) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.lost += other.lost;
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    ingestor: Arc<Ingestor>,
    pool_size: usize,
    lease: Duration,
    poll_interval: Duration,
    extractions: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(ingestor: Arc<Ingestor>, config: &WorkerConfig) -> Self {
        Self {
            ingestor,
            pool_size: config.pool_size.max(1),
            lease: config.lease(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            extractions: Arc::new(Semaphore::new(config.max_concurrent_extractions.max(1))),
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Run until `shutdown` becomes `true`.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<WorkerReport> {
        self.spawn_all(shutdown, false).await
    }

    /// Run until no task is claimable, then return.
    pub async fn drain(&self) -> Result<WorkerReport> {
        let (_tx, rx) = watch::channel(false);
        self.spawn_all(rx, true).await
    }

    async fn spawn_all(&self, shutdown: watch::Receiver<bool>, until_idle: bool) -> Result<WorkerReport> {
        info!(workers = self.pool_size, lease_secs = self.lease.as_secs(), "worker pool starting");

        let mut handles = Vec::with_capacity(self.pool_size);
        for n in 0..self.pool_size {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            let worker_id = format!("worker-{}-{}", std::process::id(), n);
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, shutdown, until_idle).await
            }));
        }

        let mut report = WorkerReport::default();
        for handle in handles {
            report += handle.await.map_err(|e| anyhow!("worker panicked: {}", e))?;
        }
        info!(
            completed = report.completed,
            failed = report.failed,
            lost = report.lost,
            "worker pool stopped"
        );
        Ok(report)
    }

    #[instrument(skip(self, shutdown, until_idle))]
    async fn worker_loop(
        &self,
        worker_id: String,
        mut shutdown: watch::Receiver<bool>,
        until_idle: bool,
    ) -> WorkerReport {
        let mut report = WorkerReport::default();
        let queue = self.ingestor.queue().clone();

        while !*shutdown.borrow() {
            let task = match queue.claim(&worker_id, self.lease).await {
                Ok(Some(task)) => task,
                Ok(None) if until_idle => break,
                Ok(None) => {
                    self.idle(&mut shutdown).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "claim failed");
                    self.idle(&mut shutdown).await;
                    continue;
                }
            };

            let settled = match self.run_task(&task).await {
                Ok(()) => queue.complete(&task.id, &worker_id).await.map(|()| true),
                Err(e) => self
                    .ingestor
                    .record_failure(&task, &worker_id, &e)
                    .await
                    .map(|()| false),
            };
            match settled {
                Ok(true) => report.completed += 1,
                Ok(false) => report.failed += 1,
                Err(e) if LeaseLost::is(&e) => {
                    report.lost += 1;
                    warn!(task_id = %task.id, error = %e, "lease lost; outcome dropped");
                }
                Err(e) => error!(task_id = %task.id, error = %e, "could not record task outcome"),
            }
        }
        report
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn run_task(&self, task: &ProcessingTask) -> Result<()> {
        let work = async {
            let _permit = if task.task_type == TaskType::Parse {
                Some(
                    self.extractions
                        .acquire()
                        .await
                        .map_err(|_| anyhow!("extraction semaphore closed"))?,
                )
            } else {
                None
            };
            self.ingestor.process(task).await
        };

        match timeout(remaining_lease(task, Utc::now(), self.lease), work).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(task_id = %task.id, lease_secs = self.lease.as_secs(), "task exceeded its lease");
                Err(anyhow!(
                    "{} task exceeded its {}s lease",
                    task.task_type,
                    self.lease.as_secs()
                ))
            }
        }
    }
}

/// Time left at `now` on the lease stamped on `task` at claim time.
fn remaining_lease(task: &ProcessingTask, now: DateTime<Utc>, fallback: Duration) -> Duration {
    match task.lease_expires_at {
        Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
        None => fallback,
    }
}

/// Flip `tx` to `true` on Ctrl-C.
pub fn shutdown_on_ctrl_c(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested; finishing in-flight tasks");
            let _ = tx.send(true);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use finsight_core::queue::TaskStatus;

    fn claimed(lease_expires_at: Option<DateTime<Utc>>) -> ProcessingTask {
        let now = Utc::now();
        ProcessingTask {
            id: "t1".into(),
            document_id: "doc".into(),
            task_type: TaskType::Parse,
            status: TaskStatus::Processing,
            priority: 0,
            attempts: 1,
            max_attempts: 3,
            payload: serde_json::json!({}),
            locked_by: Some("w1".into()),
            locked_at: Some(now),
            lease_expires_at,
            last_error: None,
            created_at: now,
        }
    }

    #[test]
    fn test_deadline_counts_from_claim() {
        let claimed_at = Utc::now();
        let task = claimed(Some(claimed_at + chrono::Duration::seconds(10)));

        let later = claimed_at + chrono::Duration::seconds(4);
        assert_eq!(remaining_lease(&task, later, Duration::from_secs(600)), Duration::from_secs(6));

        let expired = claimed_at + chrono::Duration::seconds(11);
        assert_eq!(remaining_lease(&task, expired, Duration::from_secs(600)), Duration::ZERO);
    }

    #[test]
    fn test_unstamped_task_gets_full_lease() {
        let task = claimed(None);
        assert_eq!(
            remaining_lease(&task, Utc::now(), Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }
}
