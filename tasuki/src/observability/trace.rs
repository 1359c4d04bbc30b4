//! Span tracing with parent/child linkage.
//!
//! A [`Tracer`] hands out [`Span`]s linked into traces. Spans started while
//! another span is active become its children. The scoped helpers run a
//! closure (or future) inside a span and close it with the matching status.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::epoch_millis;

/// OpenTelemetry-style span kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// In-process work.
    Internal,
    /// Handling an inbound request.
    Server,
    /// Calling out to another service.
    Client,
    /// Publishing to a queue or broker.
    Producer,
    /// Consuming from a queue or broker.
    Consumer,
}

/// Span completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    /// Not yet completed.
    Unset,
    /// Completed successfully.
    Ok,
    /// Completed with an error.
    Error,
}

/// An event that occurred during a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    /// Event name.
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Structured attributes.
    pub attributes: HashMap<String, Value>,
}

/// A traced unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Span name.
    pub name: String,
    /// Unique span identifier.
    pub span_id: String,
    /// Identifier of the trace this span belongs to.
    pub trace_id: String,
    /// Parent span, when nested.
    pub parent_span_id: Option<String>,
    /// Span kind.
    pub kind: SpanKind,
    /// Start time, milliseconds since the Unix epoch.
    pub start_time_ms: u64,
    /// End time, when completed.
    pub end_time_ms: Option<u64>,
    /// Completion status.
    pub status: SpanStatus,
    /// Structured attributes.
    pub attributes: HashMap<String, Value>,
    /// Events recorded during the span.
    pub events: Vec<SpanEvent>,
    /// Error message, when the span failed.
    pub error_message: Option<String>,
}

impl Span {
    /// Add an attribute to the span.
    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Record an event inside the span.
    pub fn add_event(&mut self, name: impl Into<String>, attributes: HashMap<String, Value>) {
        self.events.push(SpanEvent {
            name: name.into(),
            timestamp_ms: epoch_millis(),
            attributes,
        });
    }

    /// Mark the span failed and record the message.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status = SpanStatus::Error;
        self.error_message = Some(message.into());
    }

    /// Close the span; an unset status becomes ok.
    pub fn end(&mut self) {
        self.end_time_ms = Some(epoch_millis());
        if self.status == SpanStatus::Unset {
            self.status = SpanStatus::Ok;
        }
    }

    /// Span duration in milliseconds; running spans measure up to now.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.end_time_ms
            .unwrap_or_else(epoch_millis)
            .saturating_sub(self.start_time_ms)
    }
}

#[derive(Debug, Default)]
struct TracerState {
    spans: HashMap<String, Span>,
    current_trace_id: Option<String>,
    /// Stack of active span ids; the top is the parent of new spans.
    active: Vec<String>,
}

/// Hands out spans and records them for later inspection or export.
#[derive(Debug, Default)]
pub struct Tracer {
    service_name: String,
    state: Mutex<TracerState>,
}

impl Tracer {
    /// Create a tracer for the named service.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            state: Mutex::new(TracerState::default()),
        }
    }

    /// The service name spans are attributed to.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Start a span. It joins the current trace, or begins a new one, and
    /// becomes a child of the innermost active span.
    pub fn start_span(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        attributes: HashMap<String, Value>,
    ) -> Span {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let trace_id = state
            .current_trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let span_id = Uuid::new_v4().simple().to_string();
        let parent_span_id = state.active.last().cloned();

        let span = Span {
            name: name.into(),
            span_id: span_id.clone(),
            trace_id: trace_id.clone(),
            parent_span_id,
            kind,
            start_time_ms: epoch_millis(),
            end_time_ms: None,
            status: SpanStatus::Unset,
            attributes,
            events: Vec::new(),
            error_message: None,
        };

        debug!(name = %span.name, span_id = %span_id, "started span");
        state.current_trace_id = Some(trace_id);
        state.active.push(span_id.clone());
        state.spans.insert(span_id, span.clone());
        span
    }

    /// Close a span and store its final state.
    pub fn end_span(&self, mut span: Span, status: SpanStatus) {
        span.status = status;
        span.end();
        debug!(name = %span.name, span_id = %span.span_id, "ended span");

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.active.last() == Some(&span.span_id) {
            state.active.pop();
        } else {
            state.active.retain(|id| id != &span.span_id);
        }
        state.spans.insert(span.span_id.clone(), span);
    }

    /// All spans recorded for a trace.
    #[must_use]
    pub fn trace(&self, trace_id: &str) -> Vec<Span> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut spans: Vec<Span> = state
            .spans
            .values()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect();
        spans.sort_by_key(|s| s.start_time_ms);
        spans
    }

    /// A recorded span by id.
    #[must_use]
    pub fn span(&self, span_id: &str) -> Option<Span> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.spans.get(span_id).cloned()
    }

    /// All recorded spans.
    #[must_use]
    pub fn spans(&self) -> Vec<Span> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.spans.values().cloned().collect()
    }

    /// Run a closure inside a span, closing it with the matching status.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error after recording it on the span.
    pub fn in_span<T, E: std::fmt::Display>(
        &self,
        name: &str,
        kind: SpanKind,
        attributes: HashMap<String, Value>,
        op: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let mut span = self.start_span(name, kind, attributes);
        match op() {
            Ok(value) => {
                self.end_span(span, SpanStatus::Ok);
                Ok(value)
            }
            Err(err) => {
                span.set_error(err.to_string());
                self.end_span(span, SpanStatus::Error);
                Err(err)
            }
        }
    }

    /// Async variant of [`Tracer::in_span`].
    ///
    /// # Errors
    ///
    /// Propagates the future's error after recording it on the span.
    pub async fn in_span_async<T, E, Fut>(
        &self,
        name: &str,
        kind: SpanKind,
        attributes: HashMap<String, Value>,
        fut: Fut,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut span = self.start_span(name, kind, attributes);
        match fut.await {
            Ok(value) => {
                self.end_span(span, SpanStatus::Ok);
                Ok(value)
            }
            Err(err) => {
                span.set_error(err.to_string());
                self.end_span(span, SpanStatus::Error);
                Err(err)
            }
        }
    }
}
