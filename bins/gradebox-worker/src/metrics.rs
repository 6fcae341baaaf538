// Prometheus metrics for the worker, served on /metrics

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref EXECUTIONS_TOTAL: IntCounterVec = register(IntCounterVec::new(
        Opts::new("gradebox_executions_total", "Finished executions by track and status"),
        &["track", "status"],
    ));

    pub static ref EXECUTION_DURATION: HistogramVec = register(HistogramVec::new(
        HistogramOpts::new(
            "gradebox_execution_duration_seconds",
            "Wall-clock time of an execution, queue wait excluded",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["track"],
    ));

    pub static ref CONTAINERS_ACTIVE: IntGauge = register(IntGauge::new(
        "gradebox_containers_active",
        "Submission containers currently alive",
    ));
}

fn register<M>(metric: prometheus::Result<M>) -> M
where
    M: prometheus::core::Collector + Clone + 'static,
{
    let metric = metric.expect("static metric definition");
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "Metric registration failed");
    }
    metric
}

pub fn record_execution(track: &str, status: &str, seconds: f64) {
    EXECUTIONS_TOTAL.with_label_values(&[track, status]).inc();
    EXECUTION_DURATION.with_label_values(&[track]).observe(seconds);
}

/// Text exposition of every registered metric
pub fn gather() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_recorded_execution() {
        record_execution("data", "completed", 1.5);
        CONTAINERS_ACTIVE.inc();
        CONTAINERS_ACTIVE.dec();

        let text = gather();
        assert!(text.contains("gradebox_executions_total{status=\"completed\",track=\"data\"}"));
        assert!(text.contains("gradebox_execution_duration_seconds_bucket"));
        assert!(text.contains("gradebox_containers_active"));
    }
}
