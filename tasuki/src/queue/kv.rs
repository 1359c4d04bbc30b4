//! Distributed key/value queue backend.
//!
//! Mirrors the Redis layout: one list per queue and DLQ holding job IDs,
//! plus a hash per job holding its fields. The transport is abstracted
//! behind [`KvStore`] so deployments inject their client; tests run against
//! the bundled in-memory store.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;

use super::{JobPayload, QueueBackend, QueueJob, new_job_id};
use crate::error::QueueError;

/// Minimal key/value transport the backend needs.
///
/// Lists push at the head and pop at the tail, so a list behaves as a FIFO
/// queue.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Push a value onto the head of a list.
    async fn list_push_front(&self, key: &str, value: &str) -> Result<(), QueueError>;

    /// Pop a value from the tail of a list.
    async fn list_pop_back(&self, key: &str) -> Result<Option<String>, QueueError>;

    /// Length of a list.
    async fn list_len(&self, key: &str) -> Result<usize, QueueError>;

    /// Set fields on a hash.
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), QueueError>;

    /// Get one field from a hash.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, QueueError>;

    /// Delete a key entirely.
    async fn delete(&self, key: &str) -> Result<(), QueueError>;
}

/// In-process [`KvStore`] used by tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn list_push_front(&self, key: &str, value: &str) -> Result<(), QueueError> {
        self.lists
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_owned())
            .or_default()
            .push_front(value.to_owned());
        Ok(())
    }

    async fn list_pop_back(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self
            .lists
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(key)
            .and_then(VecDeque::pop_back))
    }

    async fn list_len(&self, key: &str) -> Result<usize, QueueError> {
        Ok(self
            .lists
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map_or(0, VecDeque::len))
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), QueueError> {
        let mut hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        let hash = hashes.entry(key.to_owned()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, QueueError> {
        Ok(self
            .hashes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn delete(&self, key: &str) -> Result<(), QueueError> {
        self.hashes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        self.lists
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Queue backend over a [`KvStore`].
pub struct KvQueueBackend {
    store: Arc<dyn KvStore>,
    queue_key: String,
    dlq_key: String,
}

impl std::fmt::Debug for KvQueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvQueueBackend")
            .field("queue_key", &self.queue_key)
            .field("dlq_key", &self.dlq_key)
            .finish_non_exhaustive()
    }
}

impl KvQueueBackend {
    /// Create a backend with the default key names.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            queue_key: "tasuki:queue".to_owned(),
            dlq_key: "tasuki:dlq".to_owned(),
        }
    }

    /// Override the queue and DLQ list keys (builder pattern).
    #[must_use]
    pub fn with_keys(mut self, queue_key: impl Into<String>, dlq_key: impl Into<String>) -> Self {
        self.queue_key = queue_key.into();
        self.dlq_key = dlq_key.into();
        self
    }

    fn job_key(job_id: &str) -> String {
        format!("tasuki:job:{job_id}")
    }

    /// Jobs currently waiting in the queue list.
    ///
    /// # Errors
    ///
    /// Fails when the transport fails.
    pub async fn queue_len(&self) -> Result<usize, QueueError> {
        self.store.list_len(&self.queue_key).await
    }

    /// Jobs currently in the DLQ list.
    ///
    /// # Errors
    ///
    /// Fails when the transport fails.
    pub async fn dlq_len(&self) -> Result<usize, QueueError> {
        self.store.list_len(&self.dlq_key).await
    }

    async fn read_job(&self, job_id: &str) -> Result<QueueJob, QueueError> {
        let job_key = Self::job_key(job_id);
        let payload_json = self
            .store
            .hash_get(&job_key, "payload_json")
            .await?
            .unwrap_or_else(|| "{}".to_owned());
        let attempts = self
            .store
            .hash_get(&job_key, "attempts")
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let max_attempts = self
            .store
            .hash_get(&job_key, "max_attempts")
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        let payload: JobPayload = serde_json::from_str(&payload_json)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(QueueJob {
            job_id: job_id.to_owned(),
            payload,
            attempts,
            max_attempts,
        })
    }
}

#[async_trait]
impl QueueBackend for KvQueueBackend {
    async fn enqueue(
        &self,
        payload: &JobPayload,
        max_attempts: u32,
    ) -> Result<String, QueueError> {
        let job_id = new_job_id();
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        self.store
            .hash_set(
                &Self::job_key(&job_id),
                &[
                    ("payload_json".to_owned(), payload_json),
                    ("attempts".to_owned(), "0".to_owned()),
                    ("max_attempts".to_owned(), max_attempts.to_string()),
                ],
            )
            .await?;
        self.store.list_push_front(&self.queue_key, &job_id).await?;
        Ok(job_id)
    }

    async fn claim_next(&self) -> Result<Option<QueueJob>, QueueError> {
        let Some(job_id) = self.store.list_pop_back(&self.queue_key).await? else {
            return Ok(None);
        };
        Ok(Some(self.read_job(&job_id).await?))
    }

    async fn mark_done(&self, job_id: &str) -> Result<(), QueueError> {
        self.store.delete(&Self::job_key(job_id)).await
    }

    async fn mark_failed(&self, job: &QueueJob, error: &str) -> Result<(), QueueError> {
        self.store
            .hash_set(
                &Self::job_key(&job.job_id),
                &[
                    ("error".to_owned(), error.to_owned()),
                    ("attempts".to_owned(), job.attempts.to_string()),
                ],
            )
            .await?;
        self.store.list_push_front(&self.dlq_key, &job.job_id).await
    }

    async fn requeue(&self, job: &QueueJob, error: &str) -> Result<(), QueueError> {
        self.store
            .hash_set(
                &Self::job_key(&job.job_id),
                &[
                    ("attempts".to_owned(), job.attempts.to_string()),
                    ("last_error".to_owned(), error.to_owned()),
                ],
            )
            .await?;
        self.store
            .list_push_front(&self.queue_key, &job.job_id)
            .await
    }
}
