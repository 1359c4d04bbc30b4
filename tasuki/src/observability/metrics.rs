//! Metrics collection and the unified observability manager.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::epoch_millis;
use super::trace::{SpanKind, Tracer};

/// A recorded measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name.
    pub name: String,
    /// Unit of measurement (`ms`, `tokens`, ...).
    pub unit: String,
    /// Measured value.
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Structured attributes.
    pub attributes: HashMap<String, Value>,
}

/// A record of tokens and USD cost attributed to one model invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostMetric {
    /// Model name.
    pub model: String,
    /// Provider name.
    pub provider: String,
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Cost in USD.
    pub cost_usd: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

/// Aggregated latency statistics for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Number of samples.
    pub count: usize,
    /// Smallest sample in milliseconds.
    pub min_ms: f64,
    /// Largest sample in milliseconds.
    pub max_ms: f64,
    /// Mean in milliseconds.
    pub avg_ms: f64,
}

/// Aggregated collector statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsStatistics {
    /// Number of recorded metrics.
    pub metric_count: usize,
    /// Number of recorded cost samples.
    pub cost_count: usize,
    /// Total cost across all samples.
    pub total_cost_usd: f64,
    /// Total input tokens.
    pub total_input_tokens: u64,
    /// Total output tokens.
    pub total_output_tokens: u64,
    /// Per-operation latency aggregates.
    pub latency: HashMap<String, LatencyStats>,
    /// Cost grouped by `provider/model`.
    pub cost_by_model: HashMap<String, f64>,
}

#[derive(Debug, Default)]
struct CollectorState {
    metrics: Vec<Metric>,
    cost_metrics: Vec<CostMetric>,
    latency_samples: HashMap<String, Vec<f64>>,
}

/// Collects metrics, latency samples, and cost records.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    state: Mutex<CollectorState>,
}

impl MetricsCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a measurement.
    pub fn record_metric(
        &self,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        attributes: HashMap<String, Value>,
    ) {
        let metric = Metric {
            name: name.into(),
            unit: unit.into(),
            value,
            timestamp_ms: epoch_millis(),
            attributes,
        };
        debug!(name = %metric.name, value, "recorded metric");
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .metrics
            .push(metric);
    }

    /// Record an operation latency sample.
    ///
    /// Also records a `<operation>_latency` metric in milliseconds.
    pub fn record_latency(&self, operation: &str, latency_ms: f64) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .latency_samples
                .entry(operation.to_owned())
                .or_default()
                .push(latency_ms);
        }
        self.record_metric(
            format!("{operation}_latency"),
            latency_ms,
            "ms",
            HashMap::new(),
        );
    }

    /// Record token usage and USD cost for one model invocation.
    pub fn record_cost(
        &self,
        model: impl Into<String>,
        provider: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) {
        let cost = CostMetric {
            model: model.into(),
            provider: provider.into(),
            input_tokens,
            output_tokens,
            cost_usd,
            timestamp_ms: epoch_millis(),
        };
        debug!(model = %cost.model, cost_usd, "recorded cost");
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cost_metrics
            .push(cost);
    }

    /// Snapshot of all recorded metrics.
    #[must_use]
    pub fn metrics(&self) -> Vec<Metric> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .metrics
            .clone()
    }

    /// Snapshot of all recorded cost metrics.
    #[must_use]
    pub fn cost_metrics(&self) -> Vec<CostMetric> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cost_metrics
            .clone()
    }

    /// Snapshot of latency samples per operation.
    #[must_use]
    pub fn latency_samples(&self) -> HashMap<String, Vec<f64>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latency_samples
            .clone()
    }

    /// Aggregate everything recorded so far.
    #[must_use]
    pub fn statistics(&self) -> MetricsStatistics {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut latency = HashMap::new();
        for (operation, samples) in &state.latency_samples {
            if samples.is_empty() {
                continue;
            }
            let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
            let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = samples.iter().sum::<f64>() / samples.len() as f64;
            latency.insert(
                operation.clone(),
                LatencyStats {
                    count: samples.len(),
                    min_ms: min,
                    max_ms: max,
                    avg_ms: avg,
                },
            );
        }

        let mut cost_by_model = HashMap::new();
        for cost in &state.cost_metrics {
            *cost_by_model
                .entry(format!("{}/{}", cost.provider, cost.model))
                .or_insert(0.0) += cost.cost_usd;
        }

        MetricsStatistics {
            metric_count: state.metrics.len(),
            cost_count: state.cost_metrics.len(),
            total_cost_usd: state.cost_metrics.iter().map(|c| c.cost_usd).sum(),
            total_input_tokens: state.cost_metrics.iter().map(|c| c.input_tokens).sum(),
            total_output_tokens: state.cost_metrics.iter().map(|c| c.output_tokens).sum(),
            latency,
            cost_by_model,
        }
    }
}

/// Unified observability: tracing plus metrics under one roof.
#[derive(Debug)]
pub struct ObservabilityManager {
    tracer: Tracer,
    metrics: MetricsCollector,
}

impl Default for ObservabilityManager {
    fn default() -> Self {
        Self::new("tasuki")
    }
}

impl ObservabilityManager {
    /// Create a manager for the named service.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            tracer: Tracer::new(service_name),
            metrics: MetricsCollector::new(),
        }
    }

    /// The span tracer.
    #[must_use]
    pub const fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// The metrics collector.
    #[must_use]
    pub const fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Run a closure inside an `agent_execute:<name>` span.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error after recording it on the span.
    pub fn trace_agent_execution<T, E: std::fmt::Display>(
        &self,
        agent_name: &str,
        goal: &str,
        op: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        self.tracer.in_span(
            &format!("agent_execute:{agent_name}"),
            SpanKind::Internal,
            agent_attributes(agent_name, goal),
            op,
        )
    }

    /// Async variant of [`ObservabilityManager::trace_agent_execution`].
    ///
    /// # Errors
    ///
    /// Propagates the future's error after recording it on the span.
    pub async fn trace_agent_execution_async<T, E, Fut>(
        &self,
        agent_name: &str,
        goal: &str,
        fut: Fut,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
    {
        self.tracer
            .in_span_async(
                &format!("agent_execute:{agent_name}"),
                SpanKind::Internal,
                agent_attributes(agent_name, goal),
                fut,
            )
            .await
    }

    /// Record a tool execution outcome.
    pub fn record_tool_execution(&self, tool_name: &str, latency_ms: f64, success: bool) {
        self.metrics.record_latency("tool_call", latency_ms);
        let mut attributes = HashMap::new();
        attributes.insert("tool".to_owned(), Value::String(tool_name.to_owned()));
        attributes.insert("success".to_owned(), Value::Bool(success));
        self.metrics
            .record_metric("tool_execution", 1.0, "count", attributes);
    }

    /// Record a model invocation's latency, usage, and cost.
    pub fn record_model_call(
        &self,
        model: &str,
        provider: &str,
        latency_ms: f64,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) {
        self.metrics.record_latency("model_call", latency_ms);
        self.metrics
            .record_cost(model, provider, input_tokens, output_tokens, cost_usd);
    }
}

fn agent_attributes(agent_name: &str, goal: &str) -> HashMap<String, Value> {
    let mut attributes = HashMap::new();
    attributes.insert("agent".to_owned(), Value::String(agent_name.to_owned()));
    attributes.insert("goal".to_owned(), Value::String(goal.to_owned()));
    attributes
}
