//! Observability: events, spans, metrics, and Prometheus exposition.
//!
//! The runtime emits structured [`ObsEvent`](events::ObsEvent)s through an
//! in-process [`EventBus`](events::EventBus), traces work with parent/child
//! [`Span`](trace::Span)s, and aggregates latency and cost in a
//! [`MetricsCollector`](metrics::MetricsCollector). The
//! [`prometheus`](prometheus) module renders the collected state as gauge
//! families in the Prometheus text format.

pub mod events;
pub mod metrics;
pub mod prometheus;
pub mod trace;

pub use events::{EventBus, EventSink, ObsEvent};
pub use metrics::{CostMetric, Metric, MetricsCollector, ObservabilityManager};
pub use trace::{Span, SpanKind, SpanStatus, Tracer};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
