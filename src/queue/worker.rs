//! Polling worker loop for the work queue.
//!
//! Each worker runs on its own tokio task: it claims the next eligible
//! item, hands it to the executor (the external collaborator that actually
//! performs the work), records one execution attempt, and applies retry
//! bookkeeping. Consecutive loop errors back off exponentially, capped at
//! a few doublings, so a failing store is never hot-looped against.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::db::Database;
use crate::error::DatabaseError;
use crate::queue::types::{
    ClaimOptions, ExecutionOutcome, Field, Identity, NewWorkItemExecution, WorkItem,
    WorkItemError, WorkItemPatch, WorkItemStatus,
};

/// A failed execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    pub message: String,
    pub details: Option<serde_json::Value>,
    /// Whether a manual retry could plausibly succeed.
    pub recoverable: bool,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            recoverable: true,
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            recoverable: false,
        }
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Executes one claimed work item. Implemented by the host.
#[async_trait]
pub trait WorkItemExecutor: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<serde_json::Value, ExecutionFailure>;
}

/// Configuration for a worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Delay between polls when no work is available.
    pub poll_interval: Duration,
    /// Restrict claiming to one workstream.
    pub workstream: Option<String>,
    /// Cap on exponential backoff doublings after consecutive loop errors.
    pub max_backoff_doublings: u32,
    /// How long `shutdown` waits for the current item before aborting.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            workstream: None,
            max_backoff_doublings: 5,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_workstream(mut self, workstream: impl Into<String>) -> Self {
        self.workstream = Some(workstream.into());
        self
    }
}

/// Backoff delay after `consecutive_errors` loop errors in a row.
fn backoff_delay(base: Duration, consecutive_errors: u32, max_doublings: u32) -> Duration {
    let doublings = consecutive_errors.saturating_sub(1).min(max_doublings);
    base.saturating_mul(1 << doublings)
}

/// A polling worker bound to one queue.
pub struct WorkerLoop {
    store: Arc<dyn Database>,
    queue_id: Uuid,
    identity: Identity,
    executor: Arc<dyn WorkItemExecutor>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
    consecutive_errors: u32,
}

impl WorkerLoop {
    pub fn new(
        store: Arc<dyn Database>,
        queue_id: Uuid,
        identity: Identity,
        executor: Arc<dyn WorkItemExecutor>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            queue_id,
            identity,
            executor,
            config,
            shutdown,
            consecutive_errors: 0,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(&mut self) {
        tracing::info!(
            queue = %self.queue_id,
            worker = %self.identity.label(),
            "worker loop started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(true) => {
                    // Executed something: poll again immediately.
                    self.consecutive_errors = 0;
                }
                Ok(false) => {
                    self.consecutive_errors = 0;
                    if self.wait(self.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    let delay = backoff_delay(
                        self.config.poll_interval,
                        self.consecutive_errors,
                        self.config.max_backoff_doublings,
                    );
                    tracing::warn!(
                        queue = %self.queue_id,
                        consecutive = self.consecutive_errors,
                        delay_ms = delay.as_millis() as u64,
                        "worker loop error, backing off: {}",
                        e
                    );
                    if self.wait(delay).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(queue = %self.queue_id, "worker loop stopped");
    }

    /// Sleep, waking early on shutdown. Returns true when shutting down.
    async fn wait(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown.changed() => *self.shutdown.borrow(),
        }
    }

    /// One poll cycle. Returns true when an item was claimed and executed.
    async fn poll_once(&mut self) -> Result<bool, DatabaseError> {
        self.store.promote_unblocked_items(self.queue_id).await?;

        let opts = ClaimOptions {
            workstream: self.config.workstream.clone(),
        };
        let Some(item) = self
            .store
            .claim_next_item(self.queue_id, &self.identity, &opts)
            .await?
        else {
            return Ok(false);
        };

        tracing::debug!(item = %item.id, title = %item.title, "claimed work item");
        self.execute_item(item).await?;
        Ok(true)
    }

    async fn execute_item(&self, item: WorkItem) -> Result<(), DatabaseError> {
        let started_at = Utc::now();
        let result = self.executor.execute(&item).await;
        let completed_at = Utc::now();
        let attempt_number = item.retry_count + 1;

        self.store
            .record_execution(&NewWorkItemExecution {
                item_id: item.id,
                attempt_number,
                session_key: self.identity.session_key.clone(),
                outcome: match &result {
                    Ok(_) => ExecutionOutcome::Success,
                    Err(_) => ExecutionOutcome::Error,
                },
                error: result.as_ref().err().map(|f| f.message.clone()),
                started_at,
                completed_at,
            })
            .await?;

        match result {
            Ok(value) => {
                let patch = WorkItemPatch {
                    status: Some(WorkItemStatus::Completed),
                    result: Field::Set(value),
                    last_outcome: Field::Set("success".to_string()),
                    completed_at: Field::Set(completed_at),
                    ..Default::default()
                };
                self.store.update_item(item.id, &patch).await?;
                tracing::info!(item = %item.id, "work item completed");
            }
            Err(failure) => {
                let retries_left = item
                    .max_retries
                    .is_none_or(|max| attempt_number <= max);
                let error = WorkItemError {
                    message: failure.message.clone(),
                    details: failure.details.clone(),
                    recoverable: failure.recoverable,
                };

                let patch = if retries_left {
                    WorkItemPatch {
                        status: Some(WorkItemStatus::Pending),
                        status_reason: Field::Set(format!(
                            "Attempt {} failed: {}",
                            attempt_number, failure.message
                        )),
                        assigned_to: Field::Clear,
                        started_at: Field::Clear,
                        retry_count: Some(attempt_number),
                        error: Field::Set(error),
                        last_outcome: Field::Set("error".to_string()),
                        ..Default::default()
                    }
                } else {
                    WorkItemPatch {
                        status: Some(WorkItemStatus::Failed),
                        status_reason: Field::Set(format!(
                            "Retry budget exhausted after attempt {}: {}",
                            attempt_number, failure.message
                        )),
                        retry_count: Some(attempt_number),
                        error: Field::Set(error),
                        last_outcome: Field::Set("error".to_string()),
                        completed_at: Field::Set(completed_at),
                        ..Default::default()
                    }
                };
                self.store.update_item(item.id, &patch).await?;

                if retries_left {
                    tracing::warn!(
                        item = %item.id,
                        attempt = attempt_number,
                        "work item failed, requeued: {}",
                        failure.message
                    );
                } else {
                    tracing::error!(
                        item = %item.id,
                        attempt = attempt_number,
                        recoverable = failure.recoverable,
                        "work item failed terminally: {}",
                        failure.message
                    );
                }
            }
        }
        Ok(())
    }
}

/// Handle for a spawned worker.
pub struct WorkerHandle {
    join: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    drain_timeout: Duration,
}

impl WorkerHandle {
    /// Request cooperative shutdown and wait up to the drain timeout for
    /// the current item to finish before aborting the task.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(self.drain_timeout, &mut self.join)
            .await
            .is_err()
        {
            tracing::warn!("worker did not drain in time, aborting");
            self.join.abort();
        }
    }
}

/// Spawn a worker loop as a background task.
pub fn spawn_worker(
    store: Arc<dyn Database>,
    queue_id: Uuid,
    identity: Identity,
    executor: Arc<dyn WorkItemExecutor>,
    config: WorkerConfig,
) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drain_timeout = config.drain_timeout;
    let mut worker = WorkerLoop::new(store, queue_id, identity, executor, config, shutdown_rx);

    let join = tokio::spawn(async move {
        worker.run().await;
    });

    WorkerHandle {
        join,
        shutdown_tx,
        drain_timeout,
    }
}
