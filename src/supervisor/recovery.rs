use super::health::JobStatus;
use crate::metrics;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A concrete remediation step taken in response to degraded health or
/// memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryActionKind {
    Restart,
    Stop,
    ResetErrors,
    MemoryCleanup,
    DependencyCheck,
}

impl RecoveryActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryActionKind::Restart => "restart",
            RecoveryActionKind::Stop => "stop",
            RecoveryActionKind::ResetErrors => "reset_errors",
            RecoveryActionKind::MemoryCleanup => "memory_cleanup",
            RecoveryActionKind::DependencyCheck => "dependency_check",
        }
    }
}

impl std::fmt::Display for RecoveryActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only log entry for one executed recovery action.
#[derive(Debug, Clone)]
pub struct RecoveryAction {
    pub kind: RecoveryActionKind,
    pub job_name: String,
    pub at: DateTime<Utc>,
    pub reason: String,
    pub success: bool,
    pub duration: Duration,
    pub details: Option<String>,
}

/// An action the engine has decided on but not yet executed.
#[derive(Debug, Clone)]
pub struct PlannedRecovery {
    pub kind: RecoveryActionKind,
    pub reason: String,
}

/// The slice of a job's state the recovery policy decides on.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub name: String,
    pub status: JobStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub restart_count: u32,
    pub memory_usage_mb: u64,
    pub memory_threshold_mb: u64,
    pub failure_count: u64,
    pub unmet_dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    /// Restarts allowed before the supervisor gives up on a job.
    pub max_restart_attempts: u32,
    /// Minimum wait between two restarts of the same job.
    pub restart_cooldown: Duration,
    /// How long a dependency check polls before proceeding anyway.
    pub dependency_timeout: Duration,
    pub action_log_cap: usize,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
            restart_cooldown: Duration::from_secs(30),
            dependency_timeout: Duration::from_secs(10),
            action_log_cap: 500,
        }
    }
}

/// Chooses recovery actions from health state and memory signals.
///
/// The engine plans; the supervisor executes and reports back via `record`.
/// A failed action is recorded and the engine continues, it never throws
/// upward.
pub struct RecoveryEngine {
    settings: RecoverySettings,
    actions: VecDeque<RecoveryAction>,
    last_restart: HashMap<String, Instant>,
}

impl RecoveryEngine {
    pub fn new(settings: RecoverySettings) -> Self {
        Self {
            settings,
            actions: VecDeque::new(),
            last_restart: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &RecoverySettings {
        &self.settings
    }

    /// Evaluate the decision policy in order; each slot fires independently,
    /// so several actions can be planned together.
    pub fn plan(&self, snapshot: &JobSnapshot) -> Vec<PlannedRecovery> {
        let mut planned = Vec::new();
        let exhausted = snapshot.restart_count >= self.settings.max_restart_attempts;

        if snapshot.status == JobStatus::Unhealthy && !exhausted {
            if self.cooldown_elapsed(&snapshot.name) {
                planned.push(PlannedRecovery {
                    kind: RecoveryActionKind::Restart,
                    reason: format!(
                        "unhealthy with {} consecutive failures (restart {}/{})",
                        snapshot.consecutive_failures,
                        snapshot.restart_count + 1,
                        self.settings.max_restart_attempts
                    ),
                });
            } else {
                info!(
                    "Job {} is unhealthy but restart cooldown has not elapsed",
                    snapshot.name
                );
            }
        }

        if snapshot.memory_usage_mb >= snapshot.memory_threshold_mb
            && snapshot.memory_threshold_mb > 0
        {
            planned.push(PlannedRecovery {
                kind: RecoveryActionKind::MemoryCleanup,
                reason: format!(
                    "memory usage {} MB at or above threshold {} MB",
                    snapshot.memory_usage_mb, snapshot.memory_threshold_mb
                ),
            });
        }

        if !snapshot.unmet_dependencies.is_empty() {
            planned.push(PlannedRecovery {
                kind: RecoveryActionKind::DependencyCheck,
                reason: format!(
                    "dependencies not healthy: {}",
                    snapshot.unmet_dependencies.join(", ")
                ),
            });
        }

        if snapshot.consecutive_successes >= 2 && snapshot.failure_count > 0 {
            planned.push(PlannedRecovery {
                kind: RecoveryActionKind::ResetErrors,
                reason: format!(
                    "{} consecutive successes; clearing stale error counters",
                    snapshot.consecutive_successes
                ),
            });
        }

        if snapshot.status == JobStatus::Unhealthy && exhausted {
            planned.push(PlannedRecovery {
                kind: RecoveryActionKind::Stop,
                reason: format!(
                    "restart attempts exhausted ({}/{})",
                    snapshot.restart_count, self.settings.max_restart_attempts
                ),
            });
        }

        planned
    }

    pub fn cooldown_elapsed(&self, job_name: &str) -> bool {
        self.last_restart
            .get(job_name)
            .map(|at| at.elapsed() >= self.settings.restart_cooldown)
            .unwrap_or(true)
    }

    /// Note that a restart was executed, starting the cooldown window.
    pub fn note_restart(&mut self, job_name: &str) {
        self.last_restart
            .insert(job_name.to_string(), Instant::now());
    }

    /// Record an executed action, successful or not.
    pub fn record(&mut self, action: RecoveryAction) {
        if action.success {
            info!(
                "Recovery {} on {} succeeded in {:?}: {}",
                action.kind, action.job_name, action.duration, action.reason
            );
        } else {
            warn!(
                "Recovery {} on {} failed in {:?}: {}",
                action.kind, action.job_name, action.duration, action.reason
            );
        }
        metrics::record_recovery_action(action.kind.as_str(), action.success);
        if self.actions.len() >= self.settings.action_log_cap {
            self.actions.pop_front();
        }
        self.actions.push_back(action);
    }

    /// Snapshot of the most recent actions, newest first.
    pub fn recent_actions(&self, limit: usize) -> Vec<RecoveryAction> {
        self.actions.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str) -> JobSnapshot {
        JobSnapshot {
            name: name.to_string(),
            status: JobStatus::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            restart_count: 0,
            memory_usage_mb: 10,
            memory_threshold_mb: 256,
            failure_count: 0,
            unmet_dependencies: Vec::new(),
        }
    }

    fn kinds(planned: &[PlannedRecovery]) -> Vec<RecoveryActionKind> {
        planned.iter().map(|p| p.kind).collect()
    }

    #[test]
    fn test_unhealthy_job_plans_restart() {
        let engine = RecoveryEngine::new(RecoverySettings::default());
        let mut snap = snapshot("a");
        snap.status = JobStatus::Unhealthy;
        snap.consecutive_failures = 5;

        assert_eq!(kinds(&engine.plan(&snap)), vec![RecoveryActionKind::Restart]);
    }

    #[test]
    fn test_restart_gated_by_cooldown() {
        let mut engine = RecoveryEngine::new(RecoverySettings {
            restart_cooldown: Duration::from_secs(3600),
            ..Default::default()
        });
        let mut snap = snapshot("a");
        snap.status = JobStatus::Unhealthy;

        engine.note_restart("a");
        assert!(engine.plan(&snap).is_empty());
    }

    #[test]
    fn test_exhausted_restarts_plan_stop_not_restart() {
        let engine = RecoveryEngine::new(RecoverySettings {
            max_restart_attempts: 2,
            ..Default::default()
        });
        let mut snap = snapshot("a");
        snap.status = JobStatus::Unhealthy;
        snap.restart_count = 2;

        assert_eq!(kinds(&engine.plan(&snap)), vec![RecoveryActionKind::Stop]);
    }

    #[test]
    fn test_memory_over_threshold_plans_cleanup() {
        let engine = RecoveryEngine::new(RecoverySettings::default());
        let mut snap = snapshot("a");
        snap.memory_usage_mb = 300;

        assert_eq!(
            kinds(&engine.plan(&snap)),
            vec![RecoveryActionKind::MemoryCleanup]
        );
    }

    #[test]
    fn test_unmet_dependencies_plan_check() {
        let engine = RecoveryEngine::new(RecoverySettings::default());
        let mut snap = snapshot("b");
        snap.unmet_dependencies = vec!["a".to_string()];

        assert_eq!(
            kinds(&engine.plan(&snap)),
            vec![RecoveryActionKind::DependencyCheck]
        );
    }

    #[test]
    fn test_two_successes_plan_error_reset() {
        let engine = RecoveryEngine::new(RecoverySettings::default());
        let mut snap = snapshot("a");
        snap.consecutive_successes = 2;
        snap.failure_count = 4;

        assert_eq!(
            kinds(&engine.plan(&snap)),
            vec![RecoveryActionKind::ResetErrors]
        );
    }

    #[test]
    fn test_independent_slots_fire_together() {
        let engine = RecoveryEngine::new(RecoverySettings::default());
        let mut snap = snapshot("a");
        snap.status = JobStatus::Unhealthy;
        snap.memory_usage_mb = 500;
        snap.unmet_dependencies = vec!["dep".to_string()];

        let planned = kinds(&engine.plan(&snap));
        assert_eq!(
            planned,
            vec![
                RecoveryActionKind::Restart,
                RecoveryActionKind::MemoryCleanup,
                RecoveryActionKind::DependencyCheck,
            ]
        );
    }

    #[test]
    fn test_action_log_is_bounded() {
        let mut engine = RecoveryEngine::new(RecoverySettings {
            action_log_cap: 10,
            ..Default::default()
        });
        for i in 0..25 {
            engine.record(RecoveryAction {
                kind: RecoveryActionKind::ResetErrors,
                job_name: format!("job{}", i),
                at: Utc::now(),
                reason: "test".to_string(),
                success: true,
                duration: Duration::from_millis(1),
                details: None,
            });
        }
        let recent = engine.recent_actions(100);
        assert_eq!(recent.len(), 10);
        // Newest first.
        assert_eq!(recent[0].job_name, "job24");
    }

    #[test]
    fn test_failed_action_is_recorded_not_thrown() {
        let mut engine = RecoveryEngine::new(RecoverySettings::default());
        engine.record(RecoveryAction {
            kind: RecoveryActionKind::Restart,
            job_name: "a".to_string(),
            at: Utc::now(),
            reason: "test".to_string(),
            success: false,
            duration: Duration::from_millis(5),
            details: Some("start hook failed".to_string()),
        });
        let recent = engine.recent_actions(1);
        assert!(!recent[0].success);
    }
}
