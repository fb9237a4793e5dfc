//! Bounded worker pool for update tasks.
//!
//! A fixed number of tokio workers pull [`UpdateTask`]s from one shared
//! queue. A task is owned by exactly one worker from start to finish, so the
//! images of one repository group are processed sequentially while groups
//! run in parallel up to the worker count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use imagespy_core::error::{Result, SpyError};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::PoolStats;

/// Unit of work dispatched to the pool. One task per repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateTask {
    /// Refresh the latest flag of each `"<image-name>:<tag>"`, in order.
    ScrapeLatest {
        repository: String,
        images: Vec<String>,
    },
    /// Scrape every tag the registry lists for the repository.
    ScrapeAll { repository: String },
}

impl UpdateTask {
    pub fn repository(&self) -> &str {
        match self {
            UpdateTask::ScrapeLatest { repository, .. } => repository,
            UpdateTask::ScrapeAll { repository } => repository,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpdateTask::ScrapeLatest { .. } => "scrape_latest",
            UpdateTask::ScrapeAll { .. } => "scrape_all",
        }
    }
}

/// Result of handling one task, or the sum over many.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Images scraped successfully
    pub scraped: usize,
    /// Failed scrapes
    pub failures: usize,
}

impl TaskOutcome {
    pub fn merge(&mut self, other: TaskOutcome) {
        self.scraped += other.scraped;
        self.failures += other.failures;
    }
}

/// Executes tasks. Failures are reported in the outcome, never raised.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &UpdateTask) -> TaskOutcome;
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

/// Decrements the active count when a task ends.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fixed-size worker pool.
pub struct WorkerPool {
    worker_count: usize,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Create a pool with `worker_count` workers.
    pub fn new(worker_count: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(SpyError::Queue(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        Ok(Self {
            worker_count,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Cumulative statistics over all runs of this pool.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            worker_count: self.worker_count,
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            active: self.counters.active.load(Ordering::SeqCst),
            peak_active: self.counters.peak_active.load(Ordering::SeqCst),
        }
    }

    /// Run all tasks and wait until every one has been handled.
    ///
    /// Returns the summed outcome. Only a crashed worker is an error.
    pub async fn run(
        &self,
        tasks: Vec<UpdateTask>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<TaskOutcome> {
        if tasks.is_empty() {
            return Ok(TaskOutcome::default());
        }

        let workers = self.worker_count.min(tasks.len());
        let (tx, rx) = mpsc::channel::<UpdateTask>(self.worker_count);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let rx = rx.clone();
            let handler = handler.clone();
            let counters = self.counters.clone();
            handles.push(tokio::spawn(async move {
                let mut total = TaskOutcome::default();
                loop {
                    // Hold the lock only while waiting for the next task
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else { break };

                    let id = Uuid::new_v4();
                    let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
                    counters.peak_active.fetch_max(active, Ordering::SeqCst);
                    let _guard = ActiveGuard(&counters.active);

                    tracing::debug!(
                        worker,
                        task_id = %id,
                        kind = task.kind(),
                        repository = task.repository(),
                        "Task started"
                    );
                    let outcome = handler.handle(&task).await;
                    tracing::debug!(
                        worker,
                        task_id = %id,
                        scraped = outcome.scraped,
                        failures = outcome.failures,
                        "Task finished"
                    );

                    counters.completed.fetch_add(1, Ordering::SeqCst);
                    if outcome.failures > 0 {
                        counters.failed.fetch_add(1, Ordering::SeqCst);
                    }
                    total.merge(outcome);
                }
                total
            }));
        }

        for task in tasks {
            self.counters.submitted.fetch_add(1, Ordering::SeqCst);
            if tx.send(task).await.is_err() {
                return Err(SpyError::Queue("all workers exited".to_string()));
            }
        }
        drop(tx);

        let mut total = TaskOutcome::default();
        for handle in futures::future::join_all(handles).await {
            let outcome = handle.map_err(|e| SpyError::Queue(format!("worker crashed: {}", e)))?;
            total.merge(outcome);
        }
        Ok(total)
    }
}
