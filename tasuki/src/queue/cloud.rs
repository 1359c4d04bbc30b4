//! Managed cloud queue backend.
//!
//! Mirrors the SQS interaction pattern: enqueue sends a message, claiming
//! receives one and remembers its receipt handle, completion deletes it,
//! and exhausted jobs are forwarded to a dead-letter queue URL. Messages
//! held past the transport's visibility window reappear for re-claiming,
//! so handlers must tolerate duplicates.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JobPayload, QueueBackend, QueueJob, new_job_id};
use crate::error::QueueError;

/// A message received from the cloud queue transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudMessage {
    /// Provider-assigned message identifier.
    pub message_id: String,
    /// Handle required to delete the in-flight message.
    pub receipt_handle: String,
    /// Message body.
    pub body: String,
}

/// Minimal cloud queue transport the backend needs.
#[async_trait]
pub trait CloudQueueApi: Send + Sync {
    /// Send a message, returning its identifier.
    async fn send_message(&self, queue_url: &str, body: &str) -> Result<String, QueueError>;

    /// Receive at most one message, holding it in flight.
    async fn receive_message(&self, queue_url: &str) -> Result<Option<CloudMessage>, QueueError>;

    /// Delete an in-flight message by receipt handle.
    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueError>;
}

#[derive(Debug, Default)]
struct InMemoryQueueState {
    available: VecDeque<(String, String)>,
    inflight: HashMap<String, (String, String)>,
}

/// In-process [`CloudQueueApi`] used by tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryCloudQueue {
    queues: Mutex<HashMap<String, InMemoryQueueState>>,
}

impl InMemoryCloudQueue {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently available on a queue URL.
    #[must_use]
    pub fn available_len(&self, queue_url: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue_url)
            .map_or(0, |state| state.available.len())
    }

    /// Messages currently held in flight on a queue URL.
    #[must_use]
    pub fn inflight_len(&self, queue_url: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue_url)
            .map_or(0, |state| state.inflight.len())
    }

    /// Bodies currently available on a queue URL, oldest first.
    #[must_use]
    pub fn bodies(&self, queue_url: &str) -> Vec<String> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue_url)
            .map_or_else(Vec::new, |state| {
                state.available.iter().map(|(_, body)| body.clone()).collect()
            })
    }

    /// Return every in-flight message to the available pool, simulating a
    /// visibility timeout expiring.
    pub fn expire_visibility(&self, queue_url: &str) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = queues.get_mut(queue_url) {
            for (_, message) in state.inflight.drain() {
                state.available.push_back(message);
            }
        }
    }
}

#[async_trait]
impl CloudQueueApi for InMemoryCloudQueue {
    async fn send_message(&self, queue_url: &str, body: &str) -> Result<String, QueueError> {
        let message_id = Uuid::new_v4().simple().to_string();
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(queue_url.to_owned())
            .or_default()
            .available
            .push_back((message_id.clone(), body.to_owned()));
        Ok(message_id)
    }

    async fn receive_message(
        &self,
        queue_url: &str,
    ) -> Result<Option<CloudMessage>, QueueError> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = queues.get_mut(queue_url) else {
            return Ok(None);
        };
        let Some((message_id, body)) = state.available.pop_front() else {
            return Ok(None);
        };
        let receipt_handle = Uuid::new_v4().simple().to_string();
        state
            .inflight
            .insert(receipt_handle.clone(), (message_id.clone(), body.clone()));
        Ok(Some(CloudMessage {
            message_id,
            receipt_handle,
            body,
        }))
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = queues.get_mut(queue_url) {
            state.inflight.remove(receipt_handle);
        }
        Ok(())
    }
}

/// Wire body for jobs on the cloud queue.
#[derive(Debug, Serialize, Deserialize)]
struct CloudJobBody {
    payload: JobPayload,
    attempts: u32,
    max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Queue backend over a [`CloudQueueApi`].
pub struct CloudQueueBackend {
    api: Arc<dyn CloudQueueApi>,
    queue_url: String,
    dlq_url: Option<String>,
    inflight: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for CloudQueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudQueueBackend")
            .field("queue_url", &self.queue_url)
            .field("dlq_url", &self.dlq_url)
            .finish_non_exhaustive()
    }
}

impl CloudQueueBackend {
    /// Create a backend over the transport for one queue URL.
    #[must_use]
    pub fn new(api: Arc<dyn CloudQueueApi>, queue_url: impl Into<String>) -> Self {
        Self {
            api,
            queue_url: queue_url.into(),
            dlq_url: None,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Set the dead-letter queue URL (builder pattern).
    ///
    /// Without one, exhausted jobs are deleted but not preserved.
    #[must_use]
    pub fn with_dlq_url(mut self, dlq_url: impl Into<String>) -> Self {
        self.dlq_url = Some(dlq_url.into());
        self
    }

    fn take_receipt(&self, job_id: &str) -> Option<String> {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id)
    }
}

#[async_trait]
impl QueueBackend for CloudQueueBackend {
    async fn enqueue(
        &self,
        payload: &JobPayload,
        max_attempts: u32,
    ) -> Result<String, QueueError> {
        let body = serde_json::to_string(&CloudJobBody {
            payload: payload.clone(),
            attempts: 0,
            max_attempts,
            last_error: None,
            error: None,
        })
        .map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.api.send_message(&self.queue_url, &body).await
    }

    async fn claim_next(&self) -> Result<Option<QueueJob>, QueueError> {
        let Some(message) = self.api.receive_message(&self.queue_url).await? else {
            return Ok(None);
        };

        let body: CloudJobBody = serde_json::from_str(&message.body)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let job_id = if message.message_id.is_empty() {
            new_job_id()
        } else {
            message.message_id
        };

        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.clone(), message.receipt_handle);

        Ok(Some(QueueJob {
            job_id,
            payload: body.payload,
            attempts: body.attempts,
            max_attempts: body.max_attempts,
        }))
    }

    async fn mark_done(&self, job_id: &str) -> Result<(), QueueError> {
        if let Some(receipt) = self.take_receipt(job_id) {
            self.api.delete_message(&self.queue_url, &receipt).await?;
        }
        Ok(())
    }

    async fn mark_failed(&self, job: &QueueJob, error: &str) -> Result<(), QueueError> {
        if let Some(receipt) = self.take_receipt(&job.job_id) {
            self.api.delete_message(&self.queue_url, &receipt).await?;
        }
        if let Some(dlq_url) = &self.dlq_url {
            let body = serde_json::to_string(&CloudJobBody {
                payload: job.payload.clone(),
                attempts: job.attempts,
                max_attempts: job.max_attempts,
                last_error: None,
                error: Some(error.to_owned()),
            })
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
            self.api.send_message(dlq_url, &body).await?;
        }
        Ok(())
    }

    async fn requeue(&self, job: &QueueJob, error: &str) -> Result<(), QueueError> {
        if let Some(receipt) = self.take_receipt(&job.job_id) {
            self.api.delete_message(&self.queue_url, &receipt).await?;
        }
        let body = serde_json::to_string(&CloudJobBody {
            payload: job.payload.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: Some(error.to_owned()),
            error: None,
        })
        .map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.api.send_message(&self.queue_url, &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const QUEUE_URL: &str = "https://queue.test/main";
    const DLQ_URL: &str = "https://queue.test/dlq";

    fn setup() -> (Arc<InMemoryCloudQueue>, CloudQueueBackend) {
        let api = Arc::new(InMemoryCloudQueue::new());
        let backend = CloudQueueBackend::new(Arc::clone(&api) as Arc<dyn CloudQueueApi>, QUEUE_URL)
            .with_dlq_url(DLQ_URL);
        (api, backend)
    }

    fn payload(value: i64) -> JobPayload {
        let mut payload = JobPayload::new();
        payload.insert("value".into(), json!(value));
        payload
    }

    #[tokio::test]
    async fn enqueue_then_claim_tracks_receipt() {
        let (api, backend) = setup();
        backend.enqueue(&payload(5), 2).await.unwrap();

        let job = backend.claim_next().await.unwrap().unwrap();
        assert_eq!(job.payload["value"], 5);
        assert_eq!(api.inflight_len(QUEUE_URL), 1);
        assert_eq!(api.available_len(QUEUE_URL), 0);
    }

    #[tokio::test]
    async fn mark_done_deletes_the_message() {
        let (api, backend) = setup();
        backend.enqueue(&payload(1), 1).await.unwrap();
        let job = backend.claim_next().await.unwrap().unwrap();

        backend.mark_done(&job.job_id).await.unwrap();
        assert_eq!(api.inflight_len(QUEUE_URL), 0);
        assert_eq!(api.available_len(QUEUE_URL), 0);
    }

    #[tokio::test]
    async fn mark_failed_forwards_to_dlq() {
        let (api, backend) = setup();
        backend.enqueue(&payload(1), 1).await.unwrap();
        let mut job = backend.claim_next().await.unwrap().unwrap();
        job.attempts += 1;

        backend.mark_failed(&job, "boom").await.unwrap();

        assert_eq!(api.available_len(QUEUE_URL), 0);
        assert_eq!(api.inflight_len(QUEUE_URL), 0);
        let bodies = api.bodies(DLQ_URL);
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].contains("boom"));
    }

    #[tokio::test]
    async fn requeue_sends_back_with_updated_attempts() {
        let (api, backend) = setup();
        backend.enqueue(&payload(1), 3).await.unwrap();
        let mut job = backend.claim_next().await.unwrap().unwrap();
        job.attempts += 1;

        backend.requeue(&job, "transient").await.unwrap();
        assert_eq!(api.available_len(QUEUE_URL), 1);

        let reclaimed = backend.claim_next().await.unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 1);
    }

    #[tokio::test]
    async fn expired_visibility_redelivers_the_message() {
        let (api, backend) = setup();
        backend.enqueue(&payload(1), 2).await.unwrap();

        let first = backend.claim_next().await.unwrap().unwrap();
        api.expire_visibility(QUEUE_URL);

        // The same message is claimable again: at-least-once in action.
        let second = backend.claim_next().await.unwrap().unwrap();
        assert_eq!(first.payload, second.payload);
    }
}
