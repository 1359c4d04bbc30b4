//! In-process event bus with pluggable sinks.
//!
//! Every notable runtime action (`planner.start`, `executor.tool.result`,
//! `llm.latency`, ...) is emitted as an [`ObsEvent`]. The bus keeps an
//! append-only history, which tests and debuggers read back, and forwards
//! each event to any subscribed sinks.

use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::epoch_millis;

/// A single observability event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsEvent {
    /// Event name, dotted (`planner.start`, `tool.latency`, ...).
    pub name: String,
    /// Name of the agent that emitted the event.
    pub agent: String,
    /// Structured payload.
    pub payload: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl ObsEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(name: impl Into<String>, agent: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            agent: agent.into(),
            payload,
            timestamp_ms: epoch_millis(),
        }
    }
}

/// Receives events as they are emitted.
pub trait EventSink: Send + Sync {
    /// Handle one event. Must not block.
    fn on_event(&self, event: &ObsEvent);
}

#[derive(Default)]
struct BusInner {
    history: Mutex<Vec<ObsEvent>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

/// Cheaply cloneable in-process event bus.
///
/// Clones share the same history and sink list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.len())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a sink to all future events.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    /// Record an event and forward it to every sink.
    pub fn emit(&self, event: ObsEvent) {
        debug!(name = %event.name, agent = %event.agent, "event");
        for sink in self
            .inner
            .sinks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            sink.on_event(&event);
        }
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    /// Convenience constructor-and-emit.
    pub fn emit_named(&self, name: &str, agent: &str, payload: Value) {
        self.emit(ObsEvent::new(name, agent, payload));
    }

    /// Snapshot of all recorded events, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<ObsEvent> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Recorded events with the given name.
    #[must_use]
    pub fn events_named(&self, name: &str) -> Vec<ObsEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }

    /// Number of recorded events with the given name.
    #[must_use]
    pub fn count_named(&self, name: &str) -> usize {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.name == name)
            .count()
    }

    /// Total number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether no events have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all recorded history.
    pub fn clear(&self) {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
