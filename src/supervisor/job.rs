use super::context::ExecutionContext;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Schedule for when a job should run.
#[derive(Debug, Clone)]
pub enum JobSchedule {
    /// Run at fixed intervals
    Interval(Duration),
    /// Run at specific times using cron syntax (minute hour day-of-month month day-of-week)
    Cron(String),
}

impl JobSchedule {
    /// Compute the next fire time strictly after `after`.
    pub fn next_fire(
        &self,
        after: chrono::DateTime<chrono::Utc>,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        match self {
            JobSchedule::Interval(interval) => {
                Some(after + chrono::Duration::from_std(*interval).unwrap_or_default())
            }
            JobSchedule::Cron(expr) => cron_next_fire(expr, after),
        }
    }

    /// Validate the schedule at registration time.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            JobSchedule::Interval(interval) => {
                if interval.is_zero() {
                    Err("interval must be non-zero".to_string())
                } else {
                    Ok(())
                }
            }
            JobSchedule::Cron(expr) => parse_cron(expr).map(|_| ()),
        }
    }
}

/// One parsed cron field: either a wildcard, a step over the wildcard, or a value list.
#[derive(Debug, Clone)]
enum CronField {
    Any,
    Step(u32),
    Values(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Step(step) => *step > 0 && value % step == 0,
            CronField::Values(values) => values.contains(&value),
        }
    }
}

fn parse_cron_field(field: &str, min: u32, max: u32) -> Result<CronField, String> {
    if field == "*" {
        return Ok(CronField::Any);
    }
    if let Some(step) = field.strip_prefix("*/") {
        let step: u32 = step
            .parse()
            .map_err(|_| format!("invalid step in cron field '{}'", field))?;
        if step == 0 {
            return Err(format!("zero step in cron field '{}'", field));
        }
        return Ok(CronField::Step(step));
    }
    let mut values = Vec::new();
    for part in field.split(',') {
        let value: u32 = part
            .parse()
            .map_err(|_| format!("invalid value in cron field '{}'", field))?;
        if value < min || value > max {
            return Err(format!(
                "cron value {} out of range {}..={}",
                value, min, max
            ));
        }
        values.push(value);
    }
    Ok(CronField::Values(values))
}

fn parse_cron(expr: &str) -> Result<[CronField; 5], String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!(
            "cron expression must have 5 fields, got {}: '{}'",
            fields.len(),
            expr
        ));
    }
    Ok([
        parse_cron_field(fields[0], 0, 59)?,
        parse_cron_field(fields[1], 0, 23)?,
        parse_cron_field(fields[2], 1, 31)?,
        parse_cron_field(fields[3], 1, 12)?,
        parse_cron_field(fields[4], 0, 6)?,
    ])
}

/// Scan forward minute by minute for the next matching time. Bounded to one
/// year so a never-matching expression cannot spin forever.
fn cron_next_fire(
    expr: &str,
    after: chrono::DateTime<chrono::Utc>,
) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::{Datelike, Timelike};

    let fields = parse_cron(expr).ok()?;
    let mut candidate = (after + chrono::Duration::minutes(1))
        .with_second(0)?
        .with_nanosecond(0)?;
    let limit = after + chrono::Duration::days(366);

    while candidate < limit {
        let matches = fields[0].matches(candidate.minute())
            && fields[1].matches(candidate.hour())
            && fields[2].matches(candidate.day())
            && fields[3].matches(candidate.month())
            && fields[4].matches(candidate.weekday().num_days_from_sunday());
        if matches {
            return Some(candidate);
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

/// Immutable per-registration configuration for a job.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Unique job name, used as the registry key.
    pub name: String,
    /// Disabled jobs are registered but never scheduled.
    pub enabled: bool,
    pub schedule: JobSchedule,
    /// Additional attempts after the initial one within a single cycle.
    pub max_retries: u32,
    /// Delay between an attempt failing and its retry starting.
    pub retry_delay: Duration,
    /// A single attempt is cancelled and counted as failed past this.
    pub execution_timeout: Duration,
    /// Memory growth above this marks the job degraded and eligible for cleanup.
    pub memory_threshold_mb: u64,
    /// Consecutive failures at which the job becomes unhealthy.
    pub error_threshold: u32,
    /// Minimum wait between a stop and the re-start during a restart.
    pub restart_delay: Duration,
    /// Lower priority starts earlier within a startup phase.
    pub priority: u32,
    /// Names of jobs that should be healthy before this one starts.
    pub depends_on: Vec<String>,
    /// Cadence of the out-of-band health probe timer.
    pub health_check_interval: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            schedule: JobSchedule::Interval(Duration::from_secs(60)),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            execution_timeout: Duration::from_secs(30),
            memory_threshold_mb: 256,
            error_threshold: 5,
            restart_delay: Duration::from_millis(500),
            priority: 10,
            depends_on: Vec::new(),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl JobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration. Called at registration; a failure here is a
    /// hard error raised before the job is ever scheduled.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if self.execution_timeout.is_zero() {
            return Err(RegistrationError::ZeroTimeout(self.name.clone()));
        }
        if self.error_threshold == 0 {
            return Err(RegistrationError::ZeroErrorThreshold(self.name.clone()));
        }
        if self.depends_on.iter().any(|dep| dep == &self.name) {
            return Err(RegistrationError::SelfDependency(self.name.clone()));
        }
        if let Err(reason) = self.schedule.validate() {
            return Err(RegistrationError::InvalidSchedule {
                job: self.name.clone(),
                reason,
            });
        }
        Ok(())
    }
}

/// Errors raised at registration time, before a job is ever scheduled.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("job name must not be empty")]
    EmptyName,
    #[error("job '{0}' has a zero execution timeout")]
    ZeroTimeout(String),
    #[error("job '{0}' has a zero error threshold")]
    ZeroErrorThreshold(String),
    #[error("job '{0}' depends on itself")]
    SelfDependency(String),
    #[error("job '{job}' has an invalid schedule: {reason}")]
    InvalidSchedule { job: String, reason: String },
    #[error("config name '{config}' does not match job name '{job}'")]
    NameMismatch { config: String, job: String },
}

/// Errors that can occur during job execution and lifecycle control.
#[derive(Debug)]
pub enum JobError {
    NotFound,
    AlreadyRunning,
    Disabled,
    Stopped,
    ExecutionFailed(String),
    Cancelled,
    Timeout,
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::NotFound => write!(f, "Job not found"),
            JobError::AlreadyRunning => write!(f, "Job is already running"),
            JobError::Disabled => write!(f, "Job is disabled"),
            JobError::Stopped => write!(f, "Job is stopped"),
            JobError::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
            JobError::Cancelled => write!(f, "Job was cancelled"),
            JobError::Timeout => write!(f, "Job timed out"),
        }
    }
}

impl std::error::Error for JobError {}

/// Trait for background jobs.
///
/// A job's unit of work may suspend at I/O boundaries; other jobs keep running
/// during the suspension. Long-running work should check
/// `ctx.is_cancelled()` and return early with `JobError::Cancelled`.
#[async_trait]
pub trait BackgroundJob: Send + Sync {
    /// Unique identifier for this job. Must match the registered `JobConfig` name.
    fn name(&self) -> &str;

    /// Description of what this job does.
    fn description(&self) -> &str {
        ""
    }

    /// Execute one cycle of the job's work.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), JobError>;

    /// Out-of-band liveness probe, called on the health-check timer even when
    /// the job has not fired recently. Default assumes healthy.
    async fn health_check(&self) -> bool {
        true
    }

    /// Release job-owned caches under memory pressure. Returns an estimate of
    /// the megabytes freed.
    async fn cleanup(&self) -> u64 {
        0
    }

    /// Called once when the job is started.
    async fn on_start(&self) {}

    /// Called once when the job is stopped.
    async fn on_stop(&self) {}
}
