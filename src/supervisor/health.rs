use super::runner::RunOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// Number of recent executions the rolling statistics are computed over.
const STATS_WINDOW: usize = 100;

/// Error rate over the stats window above which a job is considered degraded.
const DEGRADED_ERROR_RATE: f64 = 0.20;

/// Supervisor's classification of a job's current reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Stopping,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Starting => "starting",
            JobStatus::Healthy => "healthy",
            JobStatus::Degraded => "degraded",
            JobStatus::Unhealthy => "unhealthy",
            JobStatus::Stopping => "stopping",
            JobStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of the most recent execution, kept on the health record.
#[derive(Debug, Clone)]
pub struct LastExecution {
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Mutable per-job health state, owned by the tracker.
#[derive(Debug, Clone)]
pub struct JobHealth {
    pub status: JobStatus,
    pub consecutive_failures: u32,
    /// Resident memory growth attributed to the last run, in megabytes.
    pub memory_usage_mb: u64,
    /// Failure fraction over the stats window.
    pub error_rate: f64,
    pub avg_execution_ms: f64,
    pub last_execution: Option<LastExecution>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub next_scheduled_run: Option<DateTime<Utc>>,
}

/// Cumulative per-job counters. Monotone except for the explicit error reset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobMetrics {
    pub total_executions: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub min_execution_ms: Option<u64>,
    pub avg_execution_ms: f64,
    pub max_execution_ms: u64,
    pub peak_memory_mb: u64,
    pub restart_count: u32,
}

/// A state change emitted by the tracker, observed by the recovery engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, Copy)]
struct RunRecord {
    success: bool,
    duration_ms: u64,
}

/// Per-job state machine fed by runner outcomes.
///
/// Valid edges: `starting → healthy ⇄ degraded ⇄ unhealthy`, any state
/// `→ stopping → stopped` via explicit stop, and `stopped → starting` via
/// explicit (re)start. Everything else is unreachable by construction.
#[derive(Debug)]
pub struct HealthTracker {
    job_name: String,
    error_threshold: u32,
    memory_threshold_mb: u64,
    health: JobHealth,
    metrics: JobMetrics,
    window: VecDeque<RunRecord>,
    consecutive_successes: u32,
}

impl HealthTracker {
    pub fn new(job_name: impl Into<String>, error_threshold: u32, memory_threshold_mb: u64) -> Self {
        Self {
            job_name: job_name.into(),
            error_threshold,
            memory_threshold_mb,
            health: JobHealth {
                status: JobStatus::Stopped,
                consecutive_failures: 0,
                memory_usage_mb: 0,
                error_rate: 0.0,
                avg_execution_ms: 0.0,
                last_execution: None,
                started_at: None,
                restart_count: 0,
                next_scheduled_run: None,
            },
            metrics: JobMetrics::default(),
            window: VecDeque::with_capacity(STATS_WINDOW),
            consecutive_successes: 0,
        }
    }

    pub fn health(&self) -> &JobHealth {
        &self.health
    }

    pub fn metrics(&self) -> &JobMetrics {
        &self.metrics
    }

    pub fn status(&self) -> JobStatus {
        self.health.status
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn set_next_scheduled_run(&mut self, at: Option<DateTime<Utc>>) {
        self.health.next_scheduled_run = at;
    }

    /// Explicit (re)start. Only legal from `stopped`.
    pub fn mark_starting(&mut self) -> Option<Transition> {
        if self.health.status != JobStatus::Stopped {
            return None;
        }
        self.health.started_at = Some(Utc::now());
        self.set_status(JobStatus::Starting)
    }

    pub fn mark_stopping(&mut self) -> Option<Transition> {
        if matches!(self.health.status, JobStatus::Stopping | JobStatus::Stopped) {
            return None;
        }
        self.set_status(JobStatus::Stopping)
    }

    pub fn mark_stopped(&mut self) -> Option<Transition> {
        if self.health.status == JobStatus::Stopped {
            return None;
        }
        self.health.started_at = None;
        self.health.next_scheduled_run = None;
        self.set_status(JobStatus::Stopped)
    }

    pub fn record_restart(&mut self) {
        self.health.restart_count += 1;
        self.metrics.restart_count += 1;
        self.health.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }

    /// Fold one execution outcome into health and metrics.
    ///
    /// A stopped or stopping job performs no runs; a straggler outcome that
    /// arrives after an explicit stop is dropped rather than resurrecting the
    /// state machine.
    pub fn record_outcome(&mut self, outcome: &RunOutcome) -> Option<Transition> {
        if matches!(self.health.status, JobStatus::Stopping | JobStatus::Stopped) {
            debug!(
                "Dropping outcome for {} received while {}",
                self.job_name, self.health.status
            );
            return None;
        }

        let duration_ms = outcome.duration.as_millis() as u64;
        self.push_window(RunRecord {
            success: outcome.success,
            duration_ms,
        });

        self.metrics.total_executions += 1;
        if outcome.success {
            self.metrics.success_count += 1;
        } else {
            self.metrics.failure_count += 1;
        }
        self.metrics.min_execution_ms = Some(
            self.metrics
                .min_execution_ms
                .map_or(duration_ms, |min| min.min(duration_ms)),
        );
        self.metrics.max_execution_ms = self.metrics.max_execution_ms.max(duration_ms);
        self.metrics.avg_execution_ms = running_avg(
            self.metrics.avg_execution_ms,
            self.metrics.total_executions,
            duration_ms,
        );

        let memory_growth = outcome
            .memory_end_mb
            .saturating_sub(outcome.memory_start_mb);
        self.health.memory_usage_mb = memory_growth;
        self.metrics.peak_memory_mb = self.metrics.peak_memory_mb.max(memory_growth);

        self.health.last_execution = Some(LastExecution {
            finished_at: Utc::now(),
            duration_ms,
            success: outcome.success,
            error: outcome.error.clone(),
        });
        self.health.error_rate = self.window_error_rate();
        self.health.avg_execution_ms = self.window_avg_ms();

        if outcome.success {
            self.health.consecutive_failures = 0;
            self.consecutive_successes += 1;
        } else {
            self.health.consecutive_failures += 1;
            self.consecutive_successes = 0;
        }

        self.set_status(self.classify())
    }

    /// Re-evaluate against the latest memory figure without a new execution.
    pub fn apply_memory_usage(&mut self, memory_mb: u64) -> Option<Transition> {
        if matches!(
            self.health.status,
            JobStatus::Stopping | JobStatus::Stopped | JobStatus::Starting
        ) {
            self.health.memory_usage_mb = memory_mb;
            return None;
        }
        self.health.memory_usage_mb = memory_mb;
        self.metrics.peak_memory_mb = self.metrics.peak_memory_mb.max(memory_mb);
        self.set_status(self.classify())
    }

    /// A successful out-of-band probe promotes a starting job.
    pub fn record_probe(&mut self, healthy: bool) -> Option<Transition> {
        match (self.health.status, healthy) {
            (JobStatus::Starting, true) => self.set_status(JobStatus::Healthy),
            (JobStatus::Healthy, false) => self.set_status(JobStatus::Degraded),
            _ => None,
        }
    }

    /// Clear historical error counters so a recovered job is not kept degraded
    /// by stale window contents.
    pub fn reset_error_counters(&mut self) -> Option<Transition> {
        self.window.retain(|record| record.success);
        self.health.consecutive_failures = 0;
        self.health.error_rate = 0.0;
        self.metrics.failure_count = 0;
        if matches!(self.health.status, JobStatus::Degraded | JobStatus::Unhealthy) {
            return self.set_status(self.classify());
        }
        None
    }

    fn classify(&self) -> JobStatus {
        let failures = self.health.consecutive_failures;
        if failures >= self.error_threshold {
            return JobStatus::Unhealthy;
        }
        let over_memory = self.health.memory_usage_mb > self.memory_threshold_mb;
        let over_error_rate = self.health.error_rate > DEGRADED_ERROR_RATE;
        if failures >= 1 || over_memory || over_error_rate {
            return JobStatus::Degraded;
        }
        JobStatus::Healthy
    }

    fn set_status(&mut self, to: JobStatus) -> Option<Transition> {
        let from = self.health.status;
        if from == to {
            return None;
        }
        self.health.status = to;
        debug!("Job {} health: {} -> {}", self.job_name, from, to);
        Some(Transition { from, to })
    }

    fn push_window(&mut self, record: RunRecord) {
        if self.window.len() == STATS_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(record);
    }

    fn window_error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|r| !r.success).count();
        failures as f64 / self.window.len() as f64
    }

    fn window_avg_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let total: u64 = self.window.iter().map(|r| r.duration_ms).sum();
        total as f64 / self.window.len() as f64
    }
}

fn running_avg(current: f64, count: u64, sample_ms: u64) -> f64 {
    if count == 0 {
        return sample_ms as f64;
    }
    current + (sample_ms as f64 - current) / count as f64
}
