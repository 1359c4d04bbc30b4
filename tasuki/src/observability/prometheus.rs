//! Prometheus text-format exposition of collected metrics.
//!
//! Renders the observability manager's state as gauge families. Everything
//! is exported as gauges mirroring the latest collected state; counters are
//! not kept separately.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::metrics::ObservabilityManager;

/// Crate version stamped into `agent_sdk_build_info`.
const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Renders observability state as Prometheus gauge families.
#[derive(Debug, Clone, Default)]
pub struct PrometheusExporter {
    observability: Option<Arc<ObservabilityManager>>,
}

impl PrometheusExporter {
    /// Create an exporter over the given manager.
    #[must_use]
    pub fn new(observability: Arc<ObservabilityManager>) -> Self {
        Self {
            observability: Some(observability),
        }
    }

    /// Create an exporter with no backing manager.
    ///
    /// Renders only the `up` and `build_info` families.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            observability: None,
        }
    }

    /// Render the current state in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();

        gauge_header(&mut out, "agent_sdk_up", "Agent SDK process up status");
        out.push_str("agent_sdk_up 1\n");

        gauge_header(&mut out, "agent_sdk_build_info", "Agent SDK build information");
        out.push_str(&format!(
            "agent_sdk_build_info{{version=\"{}\"}} 1\n",
            escape_label(BUILD_VERSION)
        ));

        let Some(observability) = &self.observability else {
            return out;
        };
        let collector = observability.metrics();

        // Metric families grouped by (name, unit, canonical attributes).
        let mut grouped: BTreeMap<(String, String, String), (f64, f64, f64)> = BTreeMap::new();
        for metric in collector.metrics() {
            let key = (
                metric.name.clone(),
                metric.unit.clone(),
                attributes_label(&metric.attributes),
            );
            let entry = grouped.entry(key).or_insert((0.0, 0.0, 0.0));
            entry.0 += metric.value;
            entry.1 += 1.0;
            entry.2 = metric.value;
        }

        gauge_header(&mut out, "agent_sdk_metric_last", "Latest metric value by name");
        for ((name, unit, attributes), (_, _, last)) in &grouped {
            out.push_str(&metric_line("agent_sdk_metric_last", name, unit, attributes, *last));
        }
        gauge_header(&mut out, "agent_sdk_metric_sum", "Sum of metric values by name");
        for ((name, unit, attributes), (sum, _, _)) in &grouped {
            out.push_str(&metric_line("agent_sdk_metric_sum", name, unit, attributes, *sum));
        }
        gauge_header(&mut out, "agent_sdk_metric_count", "Count of metric samples by name");
        for ((name, unit, attributes), (_, count, _)) in &grouped {
            out.push_str(&metric_line("agent_sdk_metric_count", name, unit, attributes, *count));
        }

        // Cost families grouped by (model, provider).
        let mut cost_totals: BTreeMap<(String, String), (f64, f64, f64, f64)> = BTreeMap::new();
        for cost in collector.cost_metrics() {
            let entry = cost_totals
                .entry((cost.model.clone(), cost.provider.clone()))
                .or_insert((0.0, 0.0, 0.0, 0.0));
            entry.0 += cost.cost_usd;
            entry.1 += cost.input_tokens as f64;
            entry.2 += cost.output_tokens as f64;
            entry.3 += 1.0;
        }

        gauge_header(&mut out, "agent_sdk_cost_usd_total", "Total cost in USD per model/provider");
        for ((model, provider), totals) in &cost_totals {
            out.push_str(&cost_line("agent_sdk_cost_usd_total", model, provider, totals.0));
        }
        gauge_header(&mut out, "agent_sdk_input_tokens_total", "Total input tokens per model/provider");
        for ((model, provider), totals) in &cost_totals {
            out.push_str(&cost_line("agent_sdk_input_tokens_total", model, provider, totals.1));
        }
        gauge_header(&mut out, "agent_sdk_output_tokens_total", "Total output tokens per model/provider");
        for ((model, provider), totals) in &cost_totals {
            out.push_str(&cost_line("agent_sdk_output_tokens_total", model, provider, totals.2));
        }
        gauge_header(&mut out, "agent_sdk_cost_sample_count", "Cost metric samples per model/provider");
        for ((model, provider), totals) in &cost_totals {
            out.push_str(&cost_line("agent_sdk_cost_sample_count", model, provider, totals.3));
        }

        // Latency families per operation.
        let samples = collector.latency_samples();
        let mut operations: Vec<&String> = samples.keys().collect();
        operations.sort();

        gauge_header(&mut out, "agent_sdk_latency_avg_ms", "Average latency per operation");
        for operation in &operations {
            let values = &samples[operation.as_str()];
            if values.is_empty() {
                continue;
            }
            let avg = values.iter().sum::<f64>() / values.len() as f64;
            out.push_str(&latency_line("agent_sdk_latency_avg_ms", operation, avg));
        }
        gauge_header(&mut out, "agent_sdk_latency_p95_ms", "P95 latency per operation");
        for operation in &operations {
            if let Some(p95) = percentile(&samples[operation.as_str()], 95.0) {
                out.push_str(&latency_line("agent_sdk_latency_p95_ms", operation, p95));
            }
        }
        gauge_header(&mut out, "agent_sdk_latency_count", "Latency samples per operation");
        for operation in &operations {
            let count = samples[operation.as_str()].len() as f64;
            out.push_str(&latency_line("agent_sdk_latency_count", operation, count));
        }

        out
    }
}

fn gauge_header(out: &mut String, name: &str, help: &str) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n"));
}

fn metric_line(family: &str, name: &str, unit: &str, attributes: &str, value: f64) -> String {
    format!(
        "{family}{{metric=\"{}\",unit=\"{}\",attributes=\"{}\"}} {value}\n",
        escape_label(name),
        escape_label(unit),
        escape_label(attributes),
    )
}

fn cost_line(family: &str, model: &str, provider: &str, value: f64) -> String {
    format!(
        "{family}{{model=\"{}\",provider=\"{}\"}} {value}\n",
        escape_label(model),
        escape_label(provider),
    )
}

fn latency_line(family: &str, operation: &str, value: f64) -> String {
    format!(
        "{family}{{operation=\"{}\"}} {value}\n",
        escape_label(operation),
    )
}

/// Canonical JSON encoding of attributes: sorted keys, compact separators.
fn attributes_label(attributes: &std::collections::HashMap<String, Value>) -> String {
    if attributes.is_empty() {
        return String::new();
    }
    let sorted: BTreeMap<&String, &Value> = attributes.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

fn escape_label(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Nearest-rank percentile over unsorted samples.
fn percentile(values: &[f64], percentile: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    Some(sorted[index.min(sorted.len() - 1)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_exporter_renders_up_and_build_info() {
        let rendered = PrometheusExporter::detached().render();
        assert!(rendered.contains("agent_sdk_up 1"));
        assert!(rendered.contains("agent_sdk_build_info{version="));
        assert!(!rendered.contains("agent_sdk_metric_last{"));
    }

    #[test]
    fn metric_families_are_rendered() {
        let manager = Arc::new(ObservabilityManager::new("test"));
        manager
            .metrics()
            .record_metric("queue_depth", 3.0, "jobs", std::collections::HashMap::new());
        manager
            .metrics()
            .record_metric("queue_depth", 5.0, "jobs", std::collections::HashMap::new());

        let rendered = PrometheusExporter::new(manager).render();
        assert!(rendered.contains(
            "agent_sdk_metric_last{metric=\"queue_depth\",unit=\"jobs\",attributes=\"\"} 5"
        ));
        assert!(rendered.contains(
            "agent_sdk_metric_sum{metric=\"queue_depth\",unit=\"jobs\",attributes=\"\"} 8"
        ));
        assert!(rendered.contains(
            "agent_sdk_metric_count{metric=\"queue_depth\",unit=\"jobs\",attributes=\"\"} 2"
        ));
    }

    #[test]
    fn cost_families_aggregate_per_model() {
        let manager = Arc::new(ObservabilityManager::new("test"));
        manager.metrics().record_cost("gpt-4", "openai", 100, 50, 0.5);
        manager.metrics().record_cost("gpt-4", "openai", 100, 50, 0.25);

        let rendered = PrometheusExporter::new(manager).render();
        assert!(
            rendered.contains("agent_sdk_cost_usd_total{model=\"gpt-4\",provider=\"openai\"} 0.75")
        );
        assert!(rendered.contains(
            "agent_sdk_input_tokens_total{model=\"gpt-4\",provider=\"openai\"} 200"
        ));
        assert!(rendered.contains(
            "agent_sdk_cost_sample_count{model=\"gpt-4\",provider=\"openai\"} 2"
        ));
    }

    #[test]
    fn latency_families_include_avg_p95_count() {
        let manager = Arc::new(ObservabilityManager::new("test"));
        for ms in [10.0, 20.0, 30.0, 40.0] {
            manager.metrics().record_latency("model_call", ms);
        }

        let rendered = PrometheusExporter::new(manager).render();
        assert!(rendered.contains("agent_sdk_latency_avg_ms{operation=\"model_call\"} 25"));
        assert!(rendered.contains("agent_sdk_latency_p95_ms{operation=\"model_call\"} 40"));
        assert!(rendered.contains("agent_sdk_latency_count{operation=\"model_call\"} 4"));
    }

    #[test]
    fn percentile_nearest_rank() {
        assert_eq!(percentile(&[], 95.0), None);
        assert_eq!(percentile(&[1.0], 95.0), Some(1.0));
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 50.0), Some(3.0));
    }

    #[test]
    fn label_escaping() {
        assert_eq!(escape_label("a\"b"), "a\\\"b");
        assert_eq!(escape_label("a\\b"), "a\\\\b");
    }
}
