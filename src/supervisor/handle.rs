use super::health::{JobHealth, JobMetrics, JobStatus};
use super::job::{JobError, JobSchedule};
use super::recovery::RecoveryAction;
use super::scheduler::{PhaseReport, SharedState};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Information about a registered job for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub schedule: JobScheduleInfo,
    pub is_running: bool,
    pub health: JobHealthInfo,
    pub metrics: JobMetrics,
}

/// Serializable schedule information.
#[derive(Debug, Clone, Serialize)]
pub struct JobScheduleInfo {
    #[serde(rename = "type")]
    pub schedule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

impl From<&JobSchedule> for JobScheduleInfo {
    fn from(schedule: &JobSchedule) -> Self {
        match schedule {
            JobSchedule::Interval(duration) => JobScheduleInfo {
                schedule_type: "interval".to_string(),
                value_secs: Some(duration.as_secs()),
                cron: None,
            },
            JobSchedule::Cron(expr) => JobScheduleInfo {
                schedule_type: "cron".to_string(),
                value_secs: None,
                cron: Some(expr.clone()),
            },
        }
    }
}

/// Serializable per-job health state.
#[derive(Debug, Clone, Serialize)]
pub struct JobHealthInfo {
    pub status: JobStatus,
    pub consecutive_failures: u32,
    pub memory_usage_mb: u64,
    pub error_rate: f64,
    pub avg_execution_ms: f64,
    pub last_execution: Option<LastExecutionInfo>,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    pub next_scheduled_run: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastExecutionInfo {
    pub finished_at: String,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl From<&JobHealth> for JobHealthInfo {
    fn from(health: &JobHealth) -> Self {
        JobHealthInfo {
            status: health.status,
            consecutive_failures: health.consecutive_failures,
            memory_usage_mb: health.memory_usage_mb,
            error_rate: health.error_rate,
            avg_execution_ms: health.avg_execution_ms,
            last_execution: health.last_execution.as_ref().map(|last| LastExecutionInfo {
                finished_at: last.finished_at.to_rfc3339(),
                duration_ms: last.duration_ms,
                success: last.success,
                error: last.error.clone(),
            }),
            uptime_secs: health
                .started_at
                .map(|at| (Utc::now() - at).num_seconds().max(0) as u64),
            restart_count: health.restart_count,
            next_scheduled_run: health.next_scheduled_run.map(|at| at.to_rfc3339()),
        }
    }
}

/// Serializable recovery action entry.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryActionInfo {
    pub action: String,
    pub job: String,
    pub at: String,
    pub reason: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<RecoveryAction> for RecoveryActionInfo {
    fn from(action: RecoveryAction) -> Self {
        RecoveryActionInfo {
            action: action.kind.as_str().to_string(),
            job: action.job_name,
            at: action.at.to_rfc3339(),
            reason: action.reason,
            success: action.success,
            duration_ms: action.duration.as_millis() as u64,
            details: action.details,
        }
    }
}

/// Command sent to the supervisor loop.
pub enum SupervisorCommand {
    Start {
        name: String,
        response: oneshot::Sender<Result<(), JobError>>,
    },
    Stop {
        name: String,
        response: oneshot::Sender<Result<(), JobError>>,
    },
    Restart {
        name: String,
        response: oneshot::Sender<Result<(), JobError>>,
    },
    Trigger {
        name: String,
        response: oneshot::Sender<Result<(), JobError>>,
    },
    StartAll {
        response: oneshot::Sender<Vec<PhaseReport>>,
    },
    StopAll {
        response: oneshot::Sender<()>,
    },
    HealthCheck {
        name: String,
        response: oneshot::Sender<Result<bool, JobError>>,
    },
    Recover {
        name: String,
        /// None when enqueued fire-and-forget from a timer path.
        response: Option<oneshot::Sender<Vec<RecoveryAction>>>,
    },
    RecoveryHistory {
        limit: usize,
        response: oneshot::Sender<Vec<RecoveryAction>>,
    },
}

/// Handle to interact with the supervisor from operator tooling.
///
/// Reads return snapshots, never live references into supervisor state.
#[derive(Clone)]
pub struct SupervisorHandle {
    command_tx: mpsc::Sender<SupervisorCommand>,
    shared_state: Arc<RwLock<SharedState>>,
}

impl SupervisorHandle {
    pub(crate) fn new(
        command_tx: mpsc::Sender<SupervisorCommand>,
        shared_state: Arc<RwLock<SharedState>>,
    ) -> Self {
        Self {
            command_tx,
            shared_state,
        }
    }

    /// Get information about all registered jobs, sorted by name.
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let state = self.shared_state.read().await;
        let mut jobs: Vec<JobInfo> = state
            .jobs
            .iter()
            .map(|(name, entry)| JobInfo {
                name: name.clone(),
                description: entry.job.description().to_string(),
                enabled: entry.config.enabled,
                schedule: (&entry.config.schedule).into(),
                is_running: entry.running,
                health: entry.tracker.health().into(),
                metrics: entry.tracker.metrics().clone(),
            })
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub async fn get_job(&self, name: &str) -> Option<JobInfo> {
        let state = self.shared_state.read().await;
        state.jobs.get(name).map(|entry| JobInfo {
            name: name.to_string(),
            description: entry.job.description().to_string(),
            enabled: entry.config.enabled,
            schedule: (&entry.config.schedule).into(),
            is_running: entry.running,
            health: entry.tracker.health().into(),
            metrics: entry.tracker.metrics().clone(),
        })
    }

    pub async fn job_exists(&self, name: &str) -> bool {
        self.shared_state.read().await.jobs.contains_key(name)
    }

    pub async fn get_health(&self, name: &str) -> Option<JobHealthInfo> {
        let state = self.shared_state.read().await;
        state.jobs.get(name).map(|entry| entry.tracker.health().into())
    }

    pub async fn get_all_health(&self) -> BTreeMap<String, JobHealthInfo> {
        let state = self.shared_state.read().await;
        state
            .jobs
            .iter()
            .map(|(name, entry)| (name.clone(), entry.tracker.health().into()))
            .collect()
    }

    pub async fn get_metrics(&self, name: &str) -> Option<JobMetrics> {
        let state = self.shared_state.read().await;
        state.jobs.get(name).map(|entry| entry.tracker.metrics().clone())
    }

    pub async fn get_all_metrics(&self) -> BTreeMap<String, JobMetrics> {
        let state = self.shared_state.read().await;
        state
            .jobs
            .iter()
            .map(|(name, entry)| (name.clone(), entry.tracker.metrics().clone()))
            .collect()
    }

    pub async fn is_healthy(&self, name: &str) -> bool {
        let state = self.shared_state.read().await;
        state
            .jobs
            .get(name)
            .map(|entry| entry.tracker.status() == JobStatus::Healthy)
            .unwrap_or(false)
    }

    pub async fn is_job_running(&self, name: &str) -> bool {
        let state = self.shared_state.read().await;
        state.jobs.get(name).map(|entry| entry.running).unwrap_or(false)
    }

    pub async fn start(&self, name: &str) -> Result<(), JobError> {
        self.lifecycle_command(name, |name, response| SupervisorCommand::Start { name, response })
            .await
    }

    pub async fn stop(&self, name: &str) -> Result<(), JobError> {
        self.lifecycle_command(name, |name, response| SupervisorCommand::Stop { name, response })
            .await
    }

    pub async fn restart(&self, name: &str) -> Result<(), JobError> {
        self.lifecycle_command(name, |name, response| SupervisorCommand::Restart {
            name,
            response,
        })
        .await
    }

    /// Run a job now, outside its schedule. Rejected if already in flight.
    pub async fn trigger(&self, name: &str) -> Result<(), JobError> {
        self.lifecycle_command(name, |name, response| SupervisorCommand::Trigger {
            name,
            response,
        })
        .await
    }

    /// Start every enabled job in dependency-respecting phases.
    pub async fn start_all(&self) -> Result<Vec<PhaseReport>, JobError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SupervisorCommand::StartAll {
                response: response_tx,
            })
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor not available".to_string()))?;
        response_rx
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor did not respond".to_string()))
    }

    /// Stop every job in reverse dependency order.
    pub async fn stop_all(&self) -> Result<(), JobError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SupervisorCommand::StopAll {
                response: response_tx,
            })
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor not available".to_string()))?;
        response_rx
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor did not respond".to_string()))
    }

    /// Run the job's out-of-band health probe and fold the result into its
    /// health state. Returns whether the probe reported healthy.
    pub async fn perform_health_check(&self, name: &str) -> Result<bool, JobError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SupervisorCommand::HealthCheck {
                name: name.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor not available".to_string()))?;
        response_rx
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor did not respond".to_string()))?
    }

    /// Evaluate and execute the recovery policy for a job.
    pub async fn perform_recovery(&self, name: &str) -> Result<Vec<RecoveryActionInfo>, JobError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SupervisorCommand::Recover {
                name: name.to_string(),
                response: Some(response_tx),
            })
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor not available".to_string()))?;
        let actions = response_rx
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor did not respond".to_string()))?;
        Ok(actions.into_iter().map(RecoveryActionInfo::from).collect())
    }

    /// Recent recovery actions across all jobs, newest first.
    pub async fn recovery_history(&self, limit: usize) -> Result<Vec<RecoveryActionInfo>, JobError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SupervisorCommand::RecoveryHistory {
                limit,
                response: response_tx,
            })
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor not available".to_string()))?;
        let actions = response_rx
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor did not respond".to_string()))?;
        Ok(actions.into_iter().map(RecoveryActionInfo::from).collect())
    }

    async fn lifecycle_command(
        &self,
        name: &str,
        build: impl FnOnce(String, oneshot::Sender<Result<(), JobError>>) -> SupervisorCommand,
    ) -> Result<(), JobError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build(name.to_string(), response_tx))
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor not available".to_string()))?;
        response_rx
            .await
            .map_err(|_| JobError::ExecutionFailed("Supervisor did not respond".to_string()))?
    }
}
