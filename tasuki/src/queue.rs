//! Durable execution queue with pluggable backends and a dead-letter queue.
//!
//! Jobs run with at-least-once semantics: a single worker claims jobs from
//! the backend, invokes the handler, and either completes the job, requeues
//! it, or dead-letters it once its attempt budget is spent. Duplication is
//! possible across crash recovery, so handlers must be idempotent.

pub mod broker;
pub mod cloud;
pub mod kv;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, Result, TasukiError};

/// JSON object payload carried by a job.
pub type JobPayload = serde_json::Map<String, Value>;

/// Handler invoked by the worker for each claimed job.
pub type JobHandler = Arc<dyn Fn(JobPayload) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Generate a fresh job identifier.
#[must_use]
pub fn new_job_id() -> String {
    format!("job_{}", Uuid::new_v4().simple())
}

/// Lifecycle status of a stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Queued,
    /// Claimed by a worker.
    Running,
    /// Completed successfully.
    Done,
    /// Dead-lettered after exhausting its attempts.
    Dead,
}

impl JobStatus {
    /// Get the string representation of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Dead => "dead",
        }
    }
}

/// A claimed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    /// Unique job identifier.
    pub job_id: String,
    /// Opaque JSON payload.
    pub payload: JobPayload,
    /// Attempts consumed so far.
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
}

/// An entry in a backend's dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The dead job's identifier.
    pub job_id: String,
    /// The dead job's payload.
    pub payload: JobPayload,
    /// The final error.
    pub error: String,
    /// Attempts consumed.
    pub attempts: u32,
}

/// Storage backend for the durable queue.
///
/// All four implementations (embedded SQL, key/value, managed cloud queue,
/// log broker) share these semantics; the worker is backend-agnostic.
/// Ordering is best-effort FIFO.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a new job and return its identifier.
    async fn enqueue(
        &self,
        payload: &JobPayload,
        max_attempts: u32,
    ) -> std::result::Result<String, QueueError>;

    /// Claim the oldest queued job, marking it running.
    async fn claim_next(&self) -> std::result::Result<Option<QueueJob>, QueueError>;

    /// Remove a completed job from the active store.
    async fn mark_done(&self, job_id: &str) -> std::result::Result<(), QueueError>;

    /// Move a job from the active store to the dead-letter queue.
    async fn mark_failed(&self, job: &QueueJob, error: &str)
    -> std::result::Result<(), QueueError>;

    /// Return a failed job to the active store, persisting the error and
    /// attempt count.
    async fn requeue(&self, job: &QueueJob, error: &str) -> std::result::Result<(), QueueError>;
}

/// A submission's rendezvous slot. The worker may finish a job before the
/// submitter has registered its channel, so finished outcomes are parked
/// until collected.
enum ResultSlot {
    Waiting(oneshot::Sender<Result<Value>>),
    Finished(Result<Value>),
}

struct QueueShared {
    backend: Arc<dyn QueueBackend>,
    handler: JobHandler,
    poll_interval: Duration,
    running: AtomicBool,
    results: Mutex<HashMap<String, ResultSlot>>,
}

impl QueueShared {
    fn resolve(&self, job_id: &str, outcome: Result<Value>) {
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        match results.remove(job_id) {
            Some(ResultSlot::Waiting(sender)) => {
                let _ = sender.send(outcome);
            }
            _ => {
                results.insert(job_id.to_owned(), ResultSlot::Finished(outcome));
            }
        }
    }
}

/// Runs jobs with at-least-once semantics over a [`QueueBackend`].
pub struct DurableExecutionQueue {
    shared: Arc<QueueShared>,
    max_attempts: u32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DurableExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableExecutionQueue")
            .field("max_attempts", &self.max_attempts)
            .field("running", &self.shared.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DurableExecutionQueue {
    /// Create a queue over the backend with the given handler.
    ///
    /// Defaults: 100ms poll interval, 3 attempts per job.
    #[must_use]
    pub fn new(backend: Arc<dyn QueueBackend>, handler: JobHandler) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                backend,
                handler,
                poll_interval: Duration::from_millis(100),
                running: AtomicBool::new(false),
                results: Mutex::new(HashMap::new()),
            }),
            max_attempts: 3,
            worker: Mutex::new(None),
        }
    }

    /// Override the poll interval (builder pattern).
    ///
    /// Must be called before [`DurableExecutionQueue::start`].
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        let shared = Arc::get_mut(&mut self.shared);
        if let Some(shared) = shared {
            shared.poll_interval = poll_interval;
        }
        self
    }

    /// Override the attempt budget for submitted jobs (builder pattern).
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Start the worker. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("durable queue worker starting");
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(worker_loop(shared));
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop the worker. Pending submissions fail with a stopped-worker
    /// error.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        // Reject anything still waiting.
        let pending: Vec<ResultSlot> = {
            let mut results = self.shared.results.lock().unwrap_or_else(|e| e.into_inner());
            results.drain().map(|(_, slot)| slot).collect()
        };
        for slot in pending {
            if let ResultSlot::Waiting(sender) = slot {
                let _ = sender.send(Err(QueueError::WorkerStopped.into()));
            }
        }
        info!("durable queue worker stopped");
    }

    /// Enqueue a payload and wait for the worker to finish it.
    ///
    /// # Errors
    ///
    /// Rejects with the handler's final error once the job dead-letters,
    /// with a backend error if the enqueue fails, or with
    /// [`QueueError::WorkerStopped`] when the queue shuts down first.
    pub async fn submit(&self, payload: JobPayload) -> Result<Value> {
        let job_id = self
            .shared
            .backend
            .enqueue(&payload, self.max_attempts)
            .await
            .map_err(TasukiError::from)?;
        debug!(job_id = %job_id, "job submitted");

        let receiver = {
            let mut results = self.shared.results.lock().unwrap_or_else(|e| e.into_inner());
            match results.remove(&job_id) {
                // The worker already finished the job.
                Some(ResultSlot::Finished(outcome)) => return outcome,
                _ => {
                    let (sender, receiver) = oneshot::channel();
                    results.insert(job_id.clone(), ResultSlot::Waiting(sender));
                    receiver
                }
            }
        };

        receiver
            .await
            .unwrap_or_else(|_| Err(QueueError::WorkerStopped.into()))
    }

    /// Enqueue a payload without waiting for completion.
    ///
    /// # Errors
    ///
    /// Fails when the backend rejects the enqueue.
    pub async fn enqueue(&self, payload: JobPayload) -> Result<String> {
        Ok(self
            .shared
            .backend
            .enqueue(&payload, self.max_attempts)
            .await?)
    }
}

async fn worker_loop(shared: Arc<QueueShared>) {
    while shared.running.load(Ordering::SeqCst) {
        let claimed = match shared.backend.claim_next().await {
            Ok(job) => job,
            Err(err) => {
                warn!(error = %err, "claim failed, backing off");
                tokio::time::sleep(shared.poll_interval).await;
                continue;
            }
        };

        let Some(mut job) = claimed else {
            tokio::time::sleep(shared.poll_interval).await;
            continue;
        };

        job.attempts += 1;
        debug!(job_id = %job.job_id, attempt = job.attempts, "running job");

        match (shared.handler)(job.payload.clone()).await {
            Ok(result) => {
                if let Err(err) = shared.backend.mark_done(&job.job_id).await {
                    warn!(job_id = %job.job_id, error = %err, "mark_done failed");
                }
                shared.resolve(&job.job_id, Ok(result));
            }
            Err(handler_err) => {
                let error = handler_err.to_string();
                if job.attempts >= job.max_attempts {
                    warn!(job_id = %job.job_id, attempts = job.attempts, %error, "job dead-lettered");
                    if let Err(err) = shared.backend.mark_failed(&job, &error).await {
                        warn!(job_id = %job.job_id, error = %err, "mark_failed failed");
                    }
                    shared.resolve(
                        &job.job_id,
                        Err(QueueError::JobFailed {
                            error,
                            attempts: job.attempts,
                        }
                        .into()),
                    );
                } else {
                    debug!(job_id = %job.job_id, attempt = job.attempts, %error, "requeueing job");
                    if let Err(err) = shared.backend.requeue(&job, &error).await {
                        warn!(job_id = %job.job_id, error = %err, "requeue failed");
                    }
                    tokio::time::sleep(shared.poll_interval).await;
                }
            }
        }
    }
}
