use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

use crate::config::Config;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| Arc::new(Metrics::new()));

/// Metrics collection for DevRoom
pub struct Metrics {
    pub registry: Registry,

    // Room metrics
    pub rooms_created: Counter,
    pub rooms_deleted: CounterVec,
    pub rooms_active: Gauge,

    // Connection metrics
    pub connections_total: Counter,
    pub connections_active: Gauge,

    // Protocol metrics
    pub events_received: CounterVec,
    pub events_dropped: CounterVec,
    pub join_rejections: CounterVec,
    pub rate_limited: CounterVec,
    pub handler_faults: Counter,

    // HTTP metrics
    pub http_requests: CounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let rooms_created =
            Counter::new("devroom_rooms_created_total", "Total number of rooms created").unwrap();
        registry.register(Box::new(rooms_created.clone())).unwrap();

        let rooms_deleted = CounterVec::new(
            Opts::new("devroom_rooms_deleted_total", "Total number of rooms deleted"),
            &["reason"],
        )
        .unwrap();
        registry.register(Box::new(rooms_deleted.clone())).unwrap();

        let rooms_active = Gauge::new("devroom_rooms_active", "Number of live rooms").unwrap();
        registry.register(Box::new(rooms_active.clone())).unwrap();

        let connections_total = Counter::new(
            "devroom_connections_total",
            "Total number of accepted socket connections",
        )
        .unwrap();
        registry.register(Box::new(connections_total.clone())).unwrap();

        let connections_active =
            Gauge::new("devroom_connections_active", "Number of open socket connections").unwrap();
        registry.register(Box::new(connections_active.clone())).unwrap();

        let events_received = CounterVec::new(
            Opts::new("devroom_events_received_total", "Inbound events decoded"),
            &["event"],
        )
        .unwrap();
        registry.register(Box::new(events_received.clone())).unwrap();

        let events_dropped = CounterVec::new(
            Opts::new("devroom_events_dropped_total", "Inbound frames rejected at decode"),
            &["event"],
        )
        .unwrap();
        registry.register(Box::new(events_dropped.clone())).unwrap();

        let join_rejections = CounterVec::new(
            Opts::new("devroom_join_rejections_total", "Join attempts rejected"),
            &["reason"],
        )
        .unwrap();
        registry.register(Box::new(join_rejections.clone())).unwrap();

        let rate_limited = CounterVec::new(
            Opts::new("devroom_rate_limited_total", "Requests rejected by a rate limiter"),
            &["limiter"],
        )
        .unwrap();
        registry.register(Box::new(rate_limited.clone())).unwrap();

        let handler_faults = Counter::new(
            "devroom_handler_faults_total",
            "Event handlers that panicked and were contained",
        )
        .unwrap();
        registry.register(Box::new(handler_faults.clone())).unwrap();

        let http_requests = CounterVec::new(
            Opts::new("devroom_http_requests_total", "Total admission HTTP requests"),
            &["path", "status"],
        )
        .unwrap();
        registry.register(Box::new(http_requests.clone())).unwrap();

        Self {
            registry,
            rooms_created,
            rooms_deleted,
            rooms_active,
            connections_total,
            connections_active,
            events_received,
            events_dropped,
            join_rejections,
            rate_limited,
            handler_faults,
            http_requests,
        }
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Get metrics as JSON (for dashboards)
    pub fn as_json(&self) -> Result<serde_json::Value> {
        let metric_families = self.registry.gather();
        let metrics: Vec<_> = metric_families
            .iter()
            .map(|family| {
                serde_json::json!({
                    "name": family.get_name(),
                    "help": family.get_help(),
                    "type": format!("{:?}", family.get_field_type()),
                    "metrics": family.get_metric().len(),
                })
            })
            .collect();

        Ok(serde_json::json!({
            "total_metrics": metrics.len(),
            "metrics": metrics,
        }))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize metrics system
pub fn init(_config: &Config) -> Result<Arc<Metrics>> {
    tracing::info!("Metrics system initialized");
    Ok(METRICS.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert!(metrics.encode().is_ok());
    }

    #[test]
    fn test_metrics_json() {
        let metrics = Metrics::new();
        let json = metrics.as_json().unwrap();
        assert!(json["total_metrics"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_room_metrics() {
        let metrics = Metrics::new();
        metrics.rooms_active.set(3.0);
        metrics.rate_limited.with_label_values(&["edits"]).inc();
        let text = metrics.encode().unwrap();
        assert!(text.contains("devroom_rooms_active 3"));
        assert!(text.contains("devroom_rate_limited_total{limiter=\"edits\"} 1"));
    }
}
