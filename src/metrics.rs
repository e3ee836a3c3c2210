use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all taskwarden metrics
const PREFIX: &str = "taskwarden";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Job Execution Metrics
    pub static ref JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_executions_total"), "Total job executions by outcome"),
        &["job", "status"]
    ).expect("Failed to create job_executions_total metric");

    pub static ref JOB_EXECUTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_execution_duration_seconds"),
            "Job execution duration in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["job"]
    ).expect("Failed to create job_execution_duration_seconds metric");

    pub static ref JOB_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_job_running"), "Whether a job currently has an execution in flight"),
        &["job"]
    ).expect("Failed to create job_running metric");

    pub static ref JOB_CONSECUTIVE_FAILURES: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_job_consecutive_failures"), "Current consecutive failure count per job"),
        &["job"]
    ).expect("Failed to create job_consecutive_failures metric");

    pub static ref JOB_RESTARTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_restarts_total"), "Total supervisor-initiated job restarts"),
        &["job"]
    ).expect("Failed to create job_restarts_total metric");

    // Recovery Metrics
    pub static ref RECOVERY_ACTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_recovery_actions_total"), "Recovery actions by kind and outcome"),
        &["action", "outcome"]
    ).expect("Failed to create recovery_actions_total metric");

    // Memory Metrics
    pub static ref MEMORY_RSS_MB: Gauge = Gauge::new(
        format!("{PREFIX}_memory_rss_mb"),
        "Process resident memory in megabytes"
    ).expect("Failed to create memory_rss_mb metric");

    pub static ref MEMORY_USAGE_PCT: Gauge = Gauge::new(
        format!("{PREFIX}_memory_usage_pct"),
        "Resident memory as a percentage of the configured budget"
    ).expect("Failed to create memory_usage_pct metric");

    pub static ref MEMORY_ALERTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_memory_alerts_total"), "Memory pressure alerts by level"),
        &["level"]
    ).expect("Failed to create memory_alerts_total metric");

    pub static ref MEMORY_PRESSURE_HANDLED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_memory_pressure_handled_total"), "Cleanup passes by trigger level"),
        &["level"]
    ).expect("Failed to create memory_pressure_handled_total metric");

    pub static ref MEMORY_CLEANUP_FREED_MB_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_memory_cleanup_freed_mb_total"),
        "Estimated megabytes freed by cleanup strategies"
    ).expect("Failed to create memory_cleanup_freed_mb_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_EXECUTION_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(JOB_CONSECUTIVE_FAILURES.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RESTARTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RECOVERY_ACTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(MEMORY_RSS_MB.clone()));
    let _ = REGISTRY.register(Box::new(MEMORY_USAGE_PCT.clone()));
    let _ = REGISTRY.register(Box::new(MEMORY_ALERTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(MEMORY_PRESSURE_HANDLED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(MEMORY_CLEANUP_FREED_MB_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record one finished job execution cycle
pub fn record_job_execution(job: &str, status: &str, duration: Duration) {
    JOB_EXECUTIONS_TOTAL.with_label_values(&[job, status]).inc();
    JOB_EXECUTION_DURATION_SECONDS
        .with_label_values(&[job])
        .observe(duration.as_secs_f64());
}

/// Mark a job's in-flight state
pub fn set_job_running(job: &str, running: bool) {
    JOB_RUNNING
        .with_label_values(&[job])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn set_consecutive_failures(job: &str, failures: u32) {
    JOB_CONSECUTIVE_FAILURES
        .with_label_values(&[job])
        .set(failures as f64);
}

pub fn record_restart(job: &str) {
    JOB_RESTARTS_TOTAL.with_label_values(&[job]).inc();
}

pub fn record_recovery_action(action: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    RECOVERY_ACTIONS_TOTAL
        .with_label_values(&[action, outcome])
        .inc();
}

pub fn update_memory_gauges(rss_mb: u64, usage_pct: f64) {
    MEMORY_RSS_MB.set(rss_mb as f64);
    MEMORY_USAGE_PCT.set(usage_pct);
}

pub fn record_memory_alert(level: &str) {
    MEMORY_ALERTS_TOTAL.with_label_values(&[level]).inc();
}

pub fn record_pressure_handled(level: &str, freed_mb: u64) {
    MEMORY_PRESSURE_HANDLED_TOTAL
        .with_label_values(&[level])
        .inc();
    MEMORY_CLEANUP_FREED_MB_TOTAL.inc_by(freed_mb as f64);
}

/// Render the registry in the Prometheus text exposition format.
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => String::from_utf8(buffer).unwrap_or_default(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        // This test ensures metrics can be initialized without panic
        init_metrics();

        // Verify we can gather metrics
        let metric_families = REGISTRY.gather();
        assert!(!metric_families.is_empty(), "Metrics should be registered");
    }

    #[test]
    fn test_record_job_execution() {
        init_metrics();

        record_job_execution("notifications", "success", Duration::from_millis(50));
        record_job_execution("notifications", "failed", Duration::from_millis(10));

        let metrics = REGISTRY.gather();
        let job_metrics = metrics
            .iter()
            .find(|m| m.get_name() == "taskwarden_job_executions_total");

        assert!(job_metrics.is_some(), "Job execution metrics should exist");
    }

    #[test]
    fn test_job_running_gauge() {
        init_metrics();

        set_job_running("post_expiry", true);
        set_job_running("post_expiry", false);

        let metrics = REGISTRY.gather();
        let gauge = metrics
            .iter()
            .find(|m| m.get_name() == "taskwarden_job_running");

        assert!(gauge.is_some(), "Job running gauge should exist");
    }

    #[test]
    fn test_memory_gauges() {
        init_metrics();

        update_memory_gauges(280, 54.7);
        record_memory_alert("warning");
        record_pressure_handled("warning", 32);

        let metrics = REGISTRY.gather();
        assert!(metrics
            .iter()
            .any(|m| m.get_name() == "taskwarden_memory_rss_mb"));
        assert!(metrics
            .iter()
            .any(|m| m.get_name() == "taskwarden_memory_alerts_total"));
    }

    #[test]
    fn test_render_metrics_text_format() {
        init_metrics();
        record_recovery_action("restart", true);

        let text = render_metrics();
        assert!(text.contains("taskwarden_recovery_actions_total"));
    }
}
