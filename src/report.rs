//! Aggregated resilience reporting.
//!
//! Collapses supervisor health, cumulative metrics, recovery history, and the
//! governor's memory view into one serializable report, optionally written to
//! a timestamped artifact.

use crate::memory::{MemoryGovernor, MemoryHealthReport};
use crate::supervisor::{JobInfo, JobStatus, RecoveryActionInfo, SupervisorHandle};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Serialize)]
pub struct ResilienceReport {
    pub generated_at: String,
    /// Worst status across all jobs: healthy, degraded, or unhealthy.
    pub overall_status: String,
    pub status_counts: BTreeMap<String, usize>,
    pub jobs: Vec<JobInfo>,
    pub recovery_actions: Vec<RecoveryActionInfo>,
    pub memory: MemoryReportSection,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct MemoryReportSection {
    pub rss_mb: u64,
    pub virtual_mb: u64,
    pub usage_pct: f64,
    pub trend: String,
    pub leak_detected: bool,
    pub growth_rate_mb_per_min: f64,
    pub leak_confidence: f64,
    pub compaction_attempts: u64,
    pub compactions_succeeded: u64,
    pub snapshots_written: u64,
    pub recent_alerts: Vec<MemoryAlertEntry>,
    pub recent_pressure_events: Vec<PressureEventEntry>,
}

#[derive(Debug, Serialize)]
pub struct MemoryAlertEntry {
    pub level: String,
    pub rss_mb: u64,
    pub usage_pct: f64,
    pub at: String,
}

#[derive(Debug, Serialize)]
pub struct PressureEventEntry {
    pub trigger: String,
    pub strategies_run: Vec<String>,
    pub freed_mb: u64,
    pub at: String,
}

impl From<&MemoryHealthReport> for MemoryReportSection {
    fn from(report: &MemoryHealthReport) -> Self {
        MemoryReportSection {
            rss_mb: report.current.rss_mb,
            virtual_mb: report.current.virtual_mb,
            usage_pct: report.current.usage_pct,
            trend: report.trend.as_str().to_string(),
            leak_detected: report.leak.detected,
            growth_rate_mb_per_min: report.leak.growth_rate_mb_per_min,
            leak_confidence: report.leak.confidence,
            compaction_attempts: report.compaction_attempts,
            compactions_succeeded: report.compactions_succeeded,
            snapshots_written: report.snapshots_written,
            recent_alerts: report
                .recent_alerts
                .iter()
                .map(|alert| MemoryAlertEntry {
                    level: alert.level.as_str().to_string(),
                    rss_mb: alert.usage.rss_mb,
                    usage_pct: alert.usage.usage_pct,
                    at: alert.at.to_rfc3339(),
                })
                .collect(),
            recent_pressure_events: report
                .recent_pressure_events
                .iter()
                .map(|event| PressureEventEntry {
                    trigger: event.trigger.clone(),
                    strategies_run: event.strategies_run.clone(),
                    freed_mb: event.freed_mb,
                    at: event.at.to_rfc3339(),
                })
                .collect(),
        }
    }
}

/// Build the aggregated report from the live supervisor and governor.
pub async fn build_report(
    handle: &SupervisorHandle,
    governor: &MemoryGovernor,
) -> ResilienceReport {
    let jobs = handle.list_jobs().await;
    let recovery_actions = handle.recovery_history(50).await.unwrap_or_default();
    let memory_report = governor.get_health_report();

    let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
    for job in &jobs {
        *status_counts
            .entry(job.health.status.as_str().to_string())
            .or_insert(0) += 1;
    }

    let overall_status = if jobs
        .iter()
        .any(|job| job.health.status == JobStatus::Unhealthy)
    {
        "unhealthy"
    } else if jobs
        .iter()
        .any(|job| matches!(job.health.status, JobStatus::Degraded | JobStatus::Starting))
    {
        "degraded"
    } else {
        "healthy"
    };

    let mut recommendations = Vec::new();
    for job in &jobs {
        if job.health.status == JobStatus::Unhealthy {
            recommendations.push(format!(
                "Job {} is unhealthy with {} consecutive failures; check its last error",
                job.name, job.health.consecutive_failures
            ));
        }
        if job.health.restart_count >= 2 {
            recommendations.push(format!(
                "Job {} has been restarted {} times; the underlying failure is recurring",
                job.name, job.health.restart_count
            ));
        }
    }
    recommendations.extend(memory_report.recommendations.iter().cloned());

    ResilienceReport {
        generated_at: chrono::Utc::now().to_rfc3339(),
        overall_status: overall_status.to_string(),
        status_counts,
        jobs,
        recovery_actions,
        memory: (&memory_report).into(),
        recommendations,
    }
}

/// Serialize the report to a timestamped JSON artifact under `dir`.
pub fn write_artifact(report: &ResilienceReport, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create report directory {:?}", dir))?;
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    let path = dir.join(format!("resilience-report-{}.json", stamp));
    let payload =
        serde_json::to_string_pretty(report).context("Failed to serialize resilience report")?;
    std::fs::write(&path, payload)
        .with_context(|| format!("Failed to write report {:?}", path))?;
    info!("Resilience report written to {:?}", path);
    Ok(path)
}
