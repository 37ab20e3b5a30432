//! Prometheus metrics for plugin-facing operations

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Instant;

/// Metric families exported by the bridge, on their own registry
#[derive(Clone)]
pub struct BridgeMetrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: HistogramVec,
    cached_volumes: IntGauge,
}

impl BridgeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(
                "volume_bridge_requests_total",
                "Plugin-facing requests by operation and outcome",
            ),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "volume_bridge_request_duration_seconds",
                "Duration of plugin-facing requests",
            ),
            &["operation"],
        )
        .map_err(metrics_error)?;
        let cached_volumes = IntGauge::new(
            "volume_bridge_cached_volumes",
            "Volumes currently held in the name cache",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(requests.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(cached_volumes.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            requests,
            duration,
            cached_volumes,
        })
    }

    /// Record one finished request
    pub fn observe(&self, operation: &str, started: Instant, ok: bool) {
        let outcome = if ok { "success" } else { "error" };
        self.requests
            .with_label_values(&[operation, outcome])
            .inc();
        self.duration
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn set_cached_volumes(&self, count: usize) {
        self.cached_volumes
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn request_count(&self, operation: &str, outcome: &str) -> u64 {
        self.requests
            .with_label_values(&[operation, outcome])
            .get()
    }

    /// Text exposition of every family
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_encode() {
        let metrics = BridgeMetrics::new().unwrap();
        metrics.observe("mount", Instant::now(), true);
        metrics.observe("mount", Instant::now(), false);
        metrics.set_cached_volumes(3);

        assert_eq!(metrics.request_count("mount", "success"), 1);
        assert_eq!(metrics.request_count("mount", "error"), 1);

        let (content_type, body) = metrics.encode().unwrap();
        assert!(content_type.starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("volume_bridge_requests_total"));
        assert!(text.contains("volume_bridge_cached_volumes 3"));
    }
}
