//! Operational metrics published after each execution tick.

use chrono::{DateTime, Utc};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{DispatchError, Result};

const PREFIX: &str = "hostgrid";

/// A metric name scoped to one host group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub group: String,
    pub name: &'static str,
}

impl MetricKey {
    pub fn new(group: impl Into<String>, name: &'static str) -> Self {
        Self {
            group: group.into(),
            name,
        }
    }
}

/// Destination for aggregate job metrics.
pub trait MetricsSink: Send + Sync {
    fn set(&self, key: &MetricKey, value: f64, timestamp: DateTime<Utc>);
}

/// Per-worker job counts over the job store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerMetrics {
    pub host_group: String,
    pub in_progress: usize,
    pub pending: usize,
    pub completed_last_24h: usize,
    pub errors_last_24h: usize,
    /// Mean run time of jobs completed in the last 24 hours, in seconds.
    pub avg_duration_secs: f64,
}

impl WorkerMetrics {
    pub fn publish(&self, sink: &dyn MetricsSink, at: DateTime<Utc>) {
        let values = [
            ("jobs_in_progress", self.in_progress as f64),
            ("jobs_pending", self.pending as f64),
            ("jobs_completed_24h", self.completed_last_24h as f64),
            ("jobs_errors_24h", self.errors_last_24h as f64),
            ("job_avg_duration_seconds", self.avg_duration_secs),
        ];
        for (name, value) in values {
            sink.set(&MetricKey::new(&self.host_group, name), value, at);
        }
    }
}

/// Exposes metrics as Prometheus gauges labelled by host group.
///
/// Prometheus stamps samples at scrape time, so the timestamp passed to
/// [`MetricsSink::set`] is not forwarded.
pub struct PrometheusSink {
    registry: Registry,
    gauges: GaugeVec,
}

impl PrometheusSink {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let gauges = GaugeVec::new(
            Opts::new(format!("{PREFIX}_jobs"), "Job counts and durations per host group"),
            &["group", "metric"],
        )
        .map_err(|e| DispatchError::Internal(format!("failed to create job gauges: {}", e)))?;
        registry
            .register(Box::new(gauges.clone()))
            .map_err(|e| DispatchError::Internal(format!("failed to register job gauges: {}", e)))?;
        Ok(Self { registry, gauges })
    }

    pub fn value(&self, key: &MetricKey) -> f64 {
        self.gauges
            .with_label_values(&[key.group.as_str(), key.name])
            .get()
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| DispatchError::Internal(format!("failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| DispatchError::Internal(e.to_string()))
    }
}

impl MetricsSink for PrometheusSink {
    fn set(&self, key: &MetricKey, value: f64, _timestamp: DateTime<Utc>) {
        self.gauges
            .with_label_values(&[key.group.as_str(), key.name])
            .set(value);
    }
}
