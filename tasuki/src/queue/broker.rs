//! Log-based broker queue backend.
//!
//! Mirrors the Kafka interaction pattern: enqueue produces to a topic,
//! claiming polls the consumer, and requeueing re-produces the job record.
//! Exhausted jobs are produced to a companion dead-letter topic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{JobPayload, QueueBackend, QueueJob, new_job_id};
use crate::error::QueueError;

/// Producer side of the log transport.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Append a record to the topic.
    async fn produce(&self, topic: &str, record: &str) -> Result<(), QueueError>;
}

/// Consumer side of the log transport.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Poll the next unread record from the topic, if any.
    async fn poll(&self, topic: &str) -> Result<Option<String>, QueueError>;
}

/// In-process broker implementing both transport sides.
#[derive(Debug, Default)]
pub struct InMemoryLogBroker {
    topics: Mutex<HashMap<String, VecDeque<String>>>,
}

impl InMemoryLogBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconsumed records on a topic.
    #[must_use]
    pub fn topic_len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map_or(0, VecDeque::len)
    }

    /// Unconsumed records on a topic, oldest first.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<String> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map_or_else(Vec::new, |records| records.iter().cloned().collect())
    }
}

#[async_trait]
impl LogProducer for InMemoryLogBroker {
    async fn produce(&self, topic: &str, record: &str) -> Result<(), QueueError> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.to_owned())
            .or_default()
            .push_back(record.to_owned());
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for InMemoryLogBroker {
    async fn poll(&self, topic: &str) -> Result<Option<String>, QueueError> {
        Ok(self
            .topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(topic)
            .and_then(VecDeque::pop_front))
    }
}

/// Wire record for jobs on the log topic.
#[derive(Debug, Serialize, Deserialize)]
struct BrokerJobRecord {
    job_id: String,
    payload: JobPayload,
    attempts: u32,
    max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Queue backend over a log producer/consumer pair.
pub struct BrokerQueueBackend {
    producer: Arc<dyn LogProducer>,
    consumer: Arc<dyn LogConsumer>,
    topic: String,
    dlq_topic: String,
    inflight: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for BrokerQueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerQueueBackend")
            .field("topic", &self.topic)
            .field("dlq_topic", &self.dlq_topic)
            .finish_non_exhaustive()
    }
}

impl BrokerQueueBackend {
    /// Create a backend over the transport for one topic.
    ///
    /// Dead letters go to `<topic>.dlq` unless overridden.
    #[must_use]
    pub fn new(
        producer: Arc<dyn LogProducer>,
        consumer: Arc<dyn LogConsumer>,
        topic: impl Into<String>,
    ) -> Self {
        let topic = topic.into();
        let dlq_topic = format!("{topic}.dlq");
        Self {
            producer,
            consumer,
            topic,
            dlq_topic,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Override the dead-letter topic (builder pattern).
    #[must_use]
    pub fn with_dlq_topic(mut self, dlq_topic: impl Into<String>) -> Self {
        self.dlq_topic = dlq_topic.into();
        self
    }

    fn record_for(job: &QueueJob, last_error: Option<&str>, error: Option<&str>) -> Result<String, QueueError> {
        serde_json::to_string(&BrokerJobRecord {
            job_id: job.job_id.clone(),
            payload: job.payload.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: last_error.map(str::to_owned),
            error: error.map(str::to_owned),
        })
        .map_err(|e| QueueError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl QueueBackend for BrokerQueueBackend {
    async fn enqueue(
        &self,
        payload: &JobPayload,
        max_attempts: u32,
    ) -> Result<String, QueueError> {
        let job_id = new_job_id();
        let record = serde_json::to_string(&BrokerJobRecord {
            job_id: job_id.clone(),
            payload: payload.clone(),
            attempts: 0,
            max_attempts,
            last_error: None,
            error: None,
        })
        .map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.producer.produce(&self.topic, &record).await?;
        Ok(job_id)
    }

    async fn claim_next(&self) -> Result<Option<QueueJob>, QueueError> {
        let Some(record) = self.consumer.poll(&self.topic).await? else {
            return Ok(None);
        };
        let record: BrokerJobRecord = serde_json::from_str(&record)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.job_id.clone());

        Ok(Some(QueueJob {
            job_id: record.job_id,
            payload: record.payload,
            attempts: record.attempts,
            max_attempts: record.max_attempts,
        }))
    }

    async fn mark_done(&self, job_id: &str) -> Result<(), QueueError> {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        Ok(())
    }

    async fn mark_failed(&self, job: &QueueJob, error: &str) -> Result<(), QueueError> {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job.job_id);
        let record = Self::record_for(job, None, Some(error))?;
        self.producer.produce(&self.dlq_topic, &record).await
    }

    async fn requeue(&self, job: &QueueJob, error: &str) -> Result<(), QueueError> {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job.job_id);
        let record = Self::record_for(job, Some(error), None)?;
        self.producer.produce(&self.topic, &record).await
    }
}
