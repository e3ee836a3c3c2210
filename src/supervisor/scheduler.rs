use super::handle::{SupervisorCommand, SupervisorHandle};
use super::health::{HealthTracker, JobStatus};
use super::job::{BackgroundJob, JobConfig, JobError, RegistrationError};
use super::recovery::{
    JobSnapshot, PlannedRecovery, RecoveryAction, RecoveryActionKind, RecoveryEngine,
    RecoverySettings,
};
use super::runner::JobRunner;
use crate::memory::{MemoryAlert, MemoryGovernor};
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval of the health probe used to bound supervisor loop sleeps.
const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// Poll cadence while waiting for a startup phase to become ready.
const PHASE_POLL: Duration = Duration::from_millis(25);

/// Poll cadence of the advisory dependency wait during recovery.
const DEPENDENCY_POLL: Duration = Duration::from_millis(50);

/// Budget for one out-of-band health probe invocation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervisor-level configuration.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long each startup phase waits for its jobs to become ready before
    /// the next phase begins anyway.
    pub phase_timeout: Duration,
    /// Grace given to an in-flight execution before its token is cancelled.
    pub stop_grace: Duration,
    pub recovery: RecoverySettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            phase_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            recovery: RecoverySettings::default(),
        }
    }
}

/// One registered job and its mutable supervision state.
pub struct JobEntry {
    pub(crate) job: Arc<dyn BackgroundJob>,
    pub(crate) config: JobConfig,
    pub(crate) tracker: HealthTracker,
    pub(crate) running: bool,
    /// Participates in scheduling. Cleared by stop.
    pub(crate) started: bool,
    /// Set when restart attempts are exhausted; only an explicit operator
    /// start clears it.
    pub(crate) permanently_stopped: bool,
    pub(crate) next_health_check_at: Option<DateTime<Utc>>,
}

/// Registry shared between the supervisor loop and its handle.
#[derive(Default)]
pub struct SharedState {
    pub(crate) jobs: HashMap<String, JobEntry>,
}

/// Result of one startup phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub index: usize,
    pub jobs: Vec<String>,
    /// Whether every job reached readiness before the phase timeout.
    pub ready: bool,
}

/// Owns the set of registered jobs, drives their timers, and executes
/// lifecycle and recovery decisions.
///
/// One explicitly constructed instance per process; the handle is the
/// management surface handed to operator tooling.
pub struct Supervisor {
    shared_state: Arc<RwLock<SharedState>>,
    settings: SupervisorSettings,
    runner: JobRunner,
    recovery: RecoveryEngine,
    governor: Arc<MemoryGovernor>,
    command_receiver: mpsc::Receiver<SupervisorCommand>,
    /// Sender back into our own queue for fire-and-forget recovery enqueues.
    self_tx: mpsc::Sender<SupervisorCommand>,
    alert_receiver: mpsc::Receiver<MemoryAlert>,
    shutdown_token: CancellationToken,
    running_handles: HashMap<String, JoinHandle<()>>,
    job_cancel_tokens: HashMap<String, CancellationToken>,
}

/// Create a supervisor and its management handle.
pub fn create_supervisor(
    settings: SupervisorSettings,
    governor: Arc<MemoryGovernor>,
    shutdown_token: CancellationToken,
) -> (Supervisor, SupervisorHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let shared_state = Arc::new(RwLock::new(SharedState::default()));
    let alert_receiver = governor.subscribe_alerts();

    let supervisor = Supervisor {
        shared_state: Arc::clone(&shared_state),
        recovery: RecoveryEngine::new(settings.recovery.clone()),
        settings,
        runner: JobRunner::new(),
        governor,
        command_receiver: command_rx,
        self_tx: command_tx.clone(),
        alert_receiver,
        shutdown_token,
        running_handles: HashMap::new(),
        job_cancel_tokens: HashMap::new(),
    };
    let handle = SupervisorHandle::new(command_tx, shared_state);

    (supervisor, handle)
}

impl Supervisor {
    /// Register a job under the given configuration. Re-registration with the
    /// same name replaces the previous registration. Malformed configuration
    /// is a hard error raised here, before the job is ever scheduled.
    pub async fn register(
        &mut self,
        config: JobConfig,
        job: Arc<dyn BackgroundJob>,
    ) -> Result<(), RegistrationError> {
        config.validate()?;
        if job.name() != config.name {
            return Err(RegistrationError::NameMismatch {
                config: config.name.clone(),
                job: job.name().to_string(),
            });
        }

        info!("Registering job: {} - {}", config.name, job.description());
        let tracker = HealthTracker::new(
            &config.name,
            config.error_threshold,
            config.memory_threshold_mb,
        );
        let mut state = self.shared_state.write().await;
        state.jobs.insert(
            config.name.clone(),
            JobEntry {
                job,
                config,
                tracker,
                running: false,
                started: false,
                permanently_stopped: false,
                next_health_check_at: None,
            },
        );
        Ok(())
    }

    pub async fn job_count(&self) -> usize {
        self.shared_state.read().await.jobs.len()
    }

    /// Main supervisor loop.
    pub async fn run(&mut self) {
        let job_count = self.job_count().await;
        info!("Starting supervisor with {} registered jobs", job_count);

        loop {
            self.reap_finished_runs().await;

            let sleep_duration = self.time_until_next_event().await;
            debug!("Supervisor sleeping for {:?} until next event", sleep_duration);

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.run_due_jobs().await;
                    self.run_due_health_checks().await;
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd).await;
                }
                Some(alert) = self.alert_receiver.recv() => {
                    self.handle_memory_alert(alert).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Supervisor received shutdown signal");
                    self.stop_all().await;
                    break;
                }
            }
        }

        info!("Supervisor stopped");
    }

    async fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Start { name, response } => {
                let _ = response.send(self.start_job(&name).await);
            }
            SupervisorCommand::Stop { name, response } => {
                let _ = response.send(self.stop_job(&name, false).await);
            }
            SupervisorCommand::Restart { name, response } => {
                let _ = response.send(self.restart_job(&name).await);
            }
            SupervisorCommand::Trigger { name, response } => {
                let _ = response.send(self.trigger_job(&name).await);
            }
            SupervisorCommand::StartAll { response } => {
                let _ = response.send(self.start_all().await);
            }
            SupervisorCommand::StopAll { response } => {
                self.stop_all().await;
                let _ = response.send(());
            }
            SupervisorCommand::HealthCheck { name, response } => {
                let _ = response.send(self.perform_health_check(&name).await);
            }
            SupervisorCommand::Recover { name, response } => {
                let actions = self.perform_recovery(&name).await;
                if let Some(response) = response {
                    let _ = response.send(actions);
                }
            }
            SupervisorCommand::RecoveryHistory { limit, response } => {
                let _ = response.send(self.recovery.recent_actions(limit));
            }
        }
    }

    /// Sleep until the earliest due schedule or health-check timer, capped at
    /// the default tick.
    async fn time_until_next_event(&self) -> Duration {
        let now = Utc::now();
        let mut min_duration = DEFAULT_TICK;

        let state = self.shared_state.read().await;
        for entry in state.jobs.values() {
            if !entry.started {
                continue;
            }
            let mut candidates = Vec::with_capacity(2);
            if !entry.running {
                if let Some(next_run) = entry.tracker.health().next_scheduled_run {
                    candidates.push(next_run);
                }
            }
            if let Some(next_check) = entry.next_health_check_at {
                candidates.push(next_check);
            }
            for at in candidates {
                if at <= now {
                    return Duration::ZERO;
                }
                let until = (at - now).to_std().unwrap_or(Duration::from_secs(1));
                if until < min_duration {
                    min_duration = until;
                }
            }
        }

        min_duration
    }

    async fn run_due_jobs(&mut self) {
        let now = Utc::now();
        let due: Vec<String> = {
            let state = self.shared_state.read().await;
            state
                .jobs
                .iter()
                .filter(|(_, entry)| {
                    entry.started
                        && !entry.running
                        && !entry.permanently_stopped
                        && entry
                            .tracker
                            .health()
                            .next_scheduled_run
                            .map(|at| at <= now)
                            .unwrap_or(false)
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in due {
            self.spawn_run(&name, "schedule").await;
        }
    }

    /// Fire due health-check timers. Probes run as spawned tasks so a slow
    /// probe never stalls the loop; staleness detection happens inline.
    async fn run_due_health_checks(&mut self) {
        let now = Utc::now();
        let mut probes: Vec<(String, Arc<dyn BackgroundJob>)> = Vec::new();

        {
            let mut state = self.shared_state.write().await;
            for (name, entry) in state.jobs.iter_mut() {
                if !entry.started {
                    continue;
                }
                let due = entry
                    .next_health_check_at
                    .map(|at| at <= now)
                    .unwrap_or(false);
                if !due {
                    continue;
                }
                entry.next_health_check_at = Some(
                    now + chrono::Duration::from_std(entry.config.health_check_interval)
                        .unwrap_or_default(),
                );

                // A job whose schedule timer is long past due without an
                // execution in flight has silently stopped firing; re-arm it.
                let stale_after = chrono::Duration::from_std(
                    entry.config.health_check_interval * 2,
                )
                .unwrap_or_default();
                if !entry.running {
                    if let Some(next_run) = entry.tracker.health().next_scheduled_run {
                        if next_run + stale_after < now {
                            warn!(
                                "Job {} missed its scheduled run at {}; re-arming",
                                name, next_run
                            );
                            entry.tracker.set_next_scheduled_run(Some(now));
                        }
                    }
                }

                probes.push((name.clone(), Arc::clone(&entry.job)));
            }
        }

        for (name, job) in probes {
            let shared = Arc::clone(&self.shared_state);
            tokio::spawn(async move {
                let healthy = match tokio::time::timeout(PROBE_TIMEOUT, job.health_check()).await {
                    Ok(healthy) => healthy,
                    Err(_) => {
                        warn!("Health probe for {} timed out", name);
                        false
                    }
                };
                let mut state = shared.write().await;
                if let Some(entry) = state.jobs.get_mut(&name) {
                    entry.tracker.record_probe(healthy);
                }
            });
        }
    }

    /// Spawn one execution cycle of a job.
    async fn spawn_run(&mut self, name: &str, triggered_by: &str) {
        let (job, config) = {
            let mut state = self.shared_state.write().await;
            let entry = match state.jobs.get_mut(name) {
                Some(entry) => entry,
                None => {
                    error!("Attempted to run unknown job: {}", name);
                    return;
                }
            };
            if entry.running {
                debug!("Skipping run for {}: already in flight", name);
                return;
            }
            entry.running = true;
            // Advance the schedule before the run starts so a long execution
            // cannot produce a tight re-fire loop.
            let next = entry.config.schedule.next_fire(Utc::now());
            entry.tracker.set_next_scheduled_run(next);
            (Arc::clone(&entry.job), entry.config.clone())
        };

        info!("Starting job: {} (triggered_by: {})", name, triggered_by);
        metrics::set_job_running(name, true);

        let cancel = self.shutdown_token.child_token();
        self.job_cancel_tokens.insert(name.to_string(), cancel.clone());

        let runner = self.runner.clone();
        let shared = Arc::clone(&self.shared_state);
        let self_tx = self.self_tx.clone();
        let job_name = name.to_string();

        let handle = tokio::spawn(async move {
            let result = runner.run(job, &config, cancel, 0).await;

            match result {
                Ok(outcome) => {
                    let status_label = if outcome.success {
                        "success"
                    } else if outcome.timed_out {
                        "timeout"
                    } else {
                        "failed"
                    };
                    if outcome.success {
                        info!(
                            "Job {} completed successfully in {:?} ({} attempt(s))",
                            job_name, outcome.duration, outcome.attempts
                        );
                    } else {
                        error!(
                            "Job {} failed after {:?}: {}",
                            job_name,
                            outcome.duration,
                            outcome.error.as_deref().unwrap_or("unknown error")
                        );
                    }
                    metrics::record_job_execution(&job_name, status_label, outcome.duration);

                    let needs_recovery = {
                        let mut state = shared.write().await;
                        match state.jobs.get_mut(&job_name) {
                            Some(entry) => {
                                entry.running = false;
                                let transition = entry.tracker.record_outcome(&outcome);
                                metrics::set_consecutive_failures(
                                    &job_name,
                                    entry.tracker.health().consecutive_failures,
                                );
                                let reset_due = outcome.success
                                    && entry.tracker.consecutive_successes() >= 2
                                    && entry.tracker.metrics().failure_count > 0;
                                let degraded = matches!(
                                    transition.map(|t| t.to),
                                    Some(JobStatus::Degraded) | Some(JobStatus::Unhealthy)
                                );
                                degraded || reset_due
                            }
                            None => false,
                        }
                    };
                    metrics::set_job_running(&job_name, false);

                    if needs_recovery {
                        // Enqueue, do not await: recovery duration must never
                        // couple into the timer cadence.
                        let _ = self_tx.try_send(SupervisorCommand::Recover {
                            name: job_name.clone(),
                            response: None,
                        });
                    }
                }
                Err(JobError::AlreadyRunning) => {
                    // Another execution holds the single-flight slot; its
                    // completion clears the running flag.
                    warn!("Run for {} rejected: execution still in flight", job_name);
                }
                Err(e) => {
                    error!("Run for {} could not start: {}", job_name, e);
                    let mut state = shared.write().await;
                    if let Some(entry) = state.jobs.get_mut(&job_name) {
                        entry.running = false;
                    }
                    metrics::set_job_running(&job_name, false);
                }
            }
        });

        self.running_handles.insert(name.to_string(), handle);
    }

    async fn trigger_job(&mut self, name: &str) -> Result<(), JobError> {
        {
            let state = self.shared_state.read().await;
            let entry = state.jobs.get(name).ok_or(JobError::NotFound)?;
            if !entry.config.enabled {
                return Err(JobError::Disabled);
            }
            if entry.permanently_stopped || !entry.started {
                return Err(JobError::Stopped);
            }
            if entry.running || self.runner.is_in_flight(name) {
                return Err(JobError::AlreadyRunning);
            }
        }
        self.spawn_run(name, "manual").await;
        Ok(())
    }

    async fn start_job(&mut self, name: &str) -> Result<(), JobError> {
        let job = {
            let mut state = self.shared_state.write().await;
            let entry = state.jobs.get_mut(name).ok_or(JobError::NotFound)?;
            if !entry.config.enabled {
                return Err(JobError::Disabled);
            }
            if entry.started {
                return Ok(());
            }
            if entry.permanently_stopped {
                info!("Reviving permanently stopped job {} by operator start", name);
                entry.permanently_stopped = false;
            }
            entry.started = true;
            entry.tracker.mark_starting();
            entry.tracker.set_next_scheduled_run(Some(Utc::now()));
            entry.next_health_check_at = Some(
                Utc::now()
                    + chrono::Duration::from_std(entry.config.health_check_interval)
                        .unwrap_or_default(),
            );
            Arc::clone(&entry.job)
        };

        job.on_start().await;
        self.spawn_run(name, "start").await;
        Ok(())
    }

    async fn stop_job(&mut self, name: &str, permanent: bool) -> Result<(), JobError> {
        let job = {
            let mut state = self.shared_state.write().await;
            let entry = state.jobs.get_mut(name).ok_or(JobError::NotFound)?;
            entry.started = false;
            entry.next_health_check_at = None;
            if permanent {
                entry.permanently_stopped = true;
            }
            entry.tracker.mark_stopping();
            Arc::clone(&entry.job)
        };

        let handle = self.running_handles.remove(name);
        let token = self.job_cancel_tokens.remove(name);
        drain_job_task(name, handle, token, self.settings.stop_grace).await;

        job.on_stop().await;

        {
            let mut state = self.shared_state.write().await;
            if let Some(entry) = state.jobs.get_mut(name) {
                entry.running = false;
                entry.tracker.mark_stopped();
            }
        }
        metrics::set_job_running(name, false);
        info!("Job {} stopped", name);
        Ok(())
    }

    /// Stop, wait out the restart delay, then start again. Counted toward the
    /// job's restart total.
    async fn restart_job(&mut self, name: &str) -> Result<(), JobError> {
        let restart_delay = {
            let mut state = self.shared_state.write().await;
            let entry = state.jobs.get_mut(name).ok_or(JobError::NotFound)?;
            entry.tracker.record_restart();
            entry.config.restart_delay
        };
        metrics::record_restart(name);
        self.recovery.note_restart(name);

        self.stop_job(name, false).await?;
        tokio::time::sleep(restart_delay).await;
        self.start_job(name).await
    }

    /// Start every enabled job in dependency-respecting phases. A phase that
    /// misses its readiness timeout logs a warning and later phases proceed
    /// anyway.
    async fn start_all(&mut self) -> Vec<PhaseReport> {
        let phases = {
            let state = self.shared_state.read().await;
            let jobs: Vec<(String, u32, Vec<String>)> = state
                .jobs
                .values()
                .filter(|entry| entry.config.enabled)
                .map(|entry| {
                    (
                        entry.config.name.clone(),
                        entry.config.priority,
                        entry.config.depends_on.clone(),
                    )
                })
                .collect();
            layer_phases(jobs)
        };

        info!("Starting all jobs in {} phase(s)", phases.len());
        let mut reports = Vec::with_capacity(phases.len());

        for (i, phase) in phases.iter().enumerate() {
            let index = i + 1;
            info!("Startup phase {}: {:?}", index, phase);
            for name in phase {
                if let Err(e) = self.start_job(name).await {
                    warn!("Failed to start {} in phase {}: {}", name, index, e);
                }
            }

            let ready = self.wait_phase_ready(phase).await;
            if !ready {
                warn!(
                    "Startup phase {} timed out waiting for {:?}; continuing with later phases",
                    index, phase
                );
            }
            reports.push(PhaseReport {
                index,
                jobs: phase.clone(),
                ready,
            });
        }

        reports
    }

    /// Wait up to the phase timeout for every job in the phase to be healthy,
    /// or at least still starting without an error.
    async fn wait_phase_ready(&self, phase: &[String]) -> bool {
        let deadline = Instant::now() + self.settings.phase_timeout;
        loop {
            let ready = {
                let state = self.shared_state.read().await;
                phase.iter().all(|name| {
                    state
                        .jobs
                        .get(name)
                        .map(|entry| {
                            let health = entry.tracker.health();
                            match health.status {
                                JobStatus::Healthy => true,
                                JobStatus::Starting => health.consecutive_failures == 0,
                                _ => false,
                            }
                        })
                        .unwrap_or(true)
                })
            };
            if ready {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(PHASE_POLL).await;
        }
    }

    /// Mirror image of startup: phases in reverse dependency order, each job
    /// given the grace period to finish its current execution before its
    /// token is cancelled. Stragglers are logged and never block later phases.
    async fn stop_all(&mut self) {
        let phases = {
            let state = self.shared_state.read().await;
            let jobs: Vec<(String, u32, Vec<String>)> = state
                .jobs
                .values()
                .filter(|entry| entry.started)
                .map(|entry| {
                    (
                        entry.config.name.clone(),
                        entry.config.priority,
                        entry.config.depends_on.clone(),
                    )
                })
                .collect();
            layer_phases(jobs)
        };

        info!("Stopping all jobs in {} phase(s)", phases.len());

        for phase in phases.iter().rev() {
            let mut draining = Vec::with_capacity(phase.len());
            {
                let mut state = self.shared_state.write().await;
                for name in phase {
                    if let Some(entry) = state.jobs.get_mut(name) {
                        entry.started = false;
                        entry.next_health_check_at = None;
                        entry.tracker.mark_stopping();
                        draining.push((
                            name.clone(),
                            self.running_handles.remove(name),
                            self.job_cancel_tokens.remove(name),
                            Arc::clone(&entry.job),
                        ));
                    }
                }
            }

            let grace = self.settings.stop_grace;
            futures::future::join_all(draining.into_iter().map(
                |(name, handle, token, job)| async move {
                    drain_job_task(&name, handle, token, grace).await;
                    job.on_stop().await;
                    name
                },
            ))
            .await;

            let mut state = self.shared_state.write().await;
            for name in phase {
                if let Some(entry) = state.jobs.get_mut(name) {
                    entry.running = false;
                    entry.tracker.mark_stopped();
                }
                metrics::set_job_running(name, false);
            }
        }

        info!("All jobs stopped");
    }

    async fn perform_health_check(&mut self, name: &str) -> Result<bool, JobError> {
        let job = {
            let state = self.shared_state.read().await;
            let entry = state.jobs.get(name).ok_or(JobError::NotFound)?;
            Arc::clone(&entry.job)
        };

        let healthy = match tokio::time::timeout(PROBE_TIMEOUT, job.health_check()).await {
            Ok(healthy) => healthy,
            Err(_) => {
                warn!("Health probe for {} timed out", name);
                false
            }
        };

        let mut state = self.shared_state.write().await;
        if let Some(entry) = state.jobs.get_mut(name) {
            entry.tracker.record_probe(healthy);
        }
        Ok(healthy)
    }

    /// The governor's sampler noticed pressure; check every started job
    /// against its own memory threshold and run recovery for offenders.
    async fn handle_memory_alert(&mut self, alert: MemoryAlert) {
        warn!(
            "Memory alert {} received ({} MB resident, {:.1}% of budget)",
            alert.level, alert.usage.rss_mb, alert.usage.usage_pct
        );

        let offenders: Vec<String> = {
            let state = self.shared_state.read().await;
            state
                .jobs
                .iter()
                .filter(|(_, entry)| {
                    entry.started
                        && entry.config.memory_threshold_mb > 0
                        && entry.tracker.health().memory_usage_mb
                            >= entry.config.memory_threshold_mb
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in offenders {
            self.perform_recovery(&name).await;
        }
    }

    /// Evaluate the recovery policy for one job and execute every planned
    /// action. Failed actions are recorded and never propagate.
    async fn perform_recovery(&mut self, name: &str) -> Vec<RecoveryAction> {
        let snapshot = match self.snapshot_job(name).await {
            Some(snapshot) => snapshot,
            None => {
                warn!("Recovery requested for unknown job: {}", name);
                return Vec::new();
            }
        };

        let planned = self.recovery.plan(&snapshot);
        if planned.is_empty() {
            debug!("No recovery actions applicable for {}", name);
            return Vec::new();
        }

        let mut executed = Vec::with_capacity(planned.len());
        for plan in planned {
            let action = self.execute_planned(name, plan).await;
            self.recovery.record(action.clone());
            executed.push(action);
        }
        executed
    }

    async fn execute_planned(&mut self, name: &str, plan: PlannedRecovery) -> RecoveryAction {
        let started = Instant::now();
        let at = Utc::now();
        let (success, details) = match plan.kind {
            RecoveryActionKind::Restart => match self.restart_job(name).await {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            },
            RecoveryActionKind::MemoryCleanup => {
                let job = {
                    let state = self.shared_state.read().await;
                    state.jobs.get(name).map(|entry| Arc::clone(&entry.job))
                };
                let freed_by_job = match job {
                    Some(job) => job.cleanup().await,
                    None => 0,
                };
                let freed_by_governor = self.governor.trigger_cleanup(&format!("job:{}", name));
                let freed = freed_by_job + freed_by_governor;
                (true, Some(format!("freed ~{} MB", freed)))
            }
            RecoveryActionKind::DependencyCheck => {
                let deadline = Instant::now() + self.recovery.settings().dependency_timeout;
                let mut met = false;
                while Instant::now() < deadline {
                    if self.unmet_dependencies(name).await.is_empty() {
                        met = true;
                        break;
                    }
                    tokio::time::sleep(DEPENDENCY_POLL).await;
                }
                if met {
                    (true, Some("dependencies became healthy".to_string()))
                } else {
                    // Advisory: proceed anyway rather than deadlock.
                    warn!(
                        "Dependencies of {} still not healthy after {:?}; proceeding anyway",
                        name,
                        self.recovery.settings().dependency_timeout
                    );
                    (false, Some("proceeded after dependency timeout".to_string()))
                }
            }
            RecoveryActionKind::ResetErrors => {
                let mut state = self.shared_state.write().await;
                match state.jobs.get_mut(name) {
                    Some(entry) => {
                        entry.tracker.reset_error_counters();
                        metrics::set_consecutive_failures(name, 0);
                        (true, None)
                    }
                    None => (false, Some("job no longer registered".to_string())),
                }
            }
            RecoveryActionKind::Stop => {
                let result = self.stop_job(name, true).await;
                error!(
                    "FATAL: job {} permanently stopped after exhausting restart attempts; operator intervention required",
                    name
                );
                match result {
                    Ok(()) => (true, Some("job permanently disabled".to_string())),
                    Err(e) => (false, Some(e.to_string())),
                }
            }
        };

        RecoveryAction {
            kind: plan.kind,
            job_name: name.to_string(),
            at,
            reason: plan.reason,
            success,
            duration: started.elapsed(),
            details,
        }
    }

    async fn snapshot_job(&self, name: &str) -> Option<JobSnapshot> {
        let unmet = self.unmet_dependencies(name).await;
        let state = self.shared_state.read().await;
        let entry = state.jobs.get(name)?;
        let health = entry.tracker.health();
        Some(JobSnapshot {
            name: name.to_string(),
            status: health.status,
            consecutive_failures: health.consecutive_failures,
            consecutive_successes: entry.tracker.consecutive_successes(),
            restart_count: health.restart_count,
            memory_usage_mb: health.memory_usage_mb,
            memory_threshold_mb: entry.config.memory_threshold_mb,
            failure_count: entry.tracker.metrics().failure_count,
            unmet_dependencies: unmet,
        })
    }

    /// Registered dependencies of `name` that are not currently healthy.
    /// Unregistered dependencies are advisory and reported as met.
    async fn unmet_dependencies(&self, name: &str) -> Vec<String> {
        let state = self.shared_state.read().await;
        let entry = match state.jobs.get(name) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        entry
            .config
            .depends_on
            .iter()
            .filter(|dep| {
                match state.jobs.get(dep.as_str()) {
                    Some(dep_entry) => dep_entry.tracker.status() != JobStatus::Healthy,
                    None => {
                        debug!("Job {} depends on unregistered job {}", name, dep);
                        false
                    }
                }
            })
            .cloned()
            .collect()
    }

    async fn reap_finished_runs(&mut self) {
        let finished: Vec<String> = self
            .running_handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        for name in finished {
            if let Some(handle) = self.running_handles.remove(&name) {
                let _ = handle.await;
            }
            self.job_cancel_tokens.remove(&name);
        }
    }
}

/// Finish or cancel one job's in-flight task: grace first, then token
/// cancellation, then drop.
async fn drain_job_task(
    name: &str,
    handle: Option<JoinHandle<()>>,
    token: Option<CancellationToken>,
    grace: Duration,
) {
    let mut handle = match handle {
        Some(handle) => handle,
        None => return,
    };
    if handle.is_finished() {
        let _ = handle.await;
        return;
    }
    if tokio::time::timeout(grace, &mut handle).await.is_ok() {
        return;
    }
    if let Some(token) = &token {
        debug!("Cancelling in-flight execution of {}", name);
        token.cancel();
    }
    if tokio::time::timeout(grace, &mut handle).await.is_err() {
        warn!("Job {} ignored cancellation past its grace period", name);
        handle.abort();
    }
}

/// Group jobs into startup phases: a job joins the first phase after all of
/// its registered dependencies, ordered within a phase by ascending priority
/// then name. A dependency cycle degrades to one final catch-all phase.
fn layer_phases(jobs: Vec<(String, u32, Vec<String>)>) -> Vec<Vec<String>> {
    let mut remaining: HashMap<String, (u32, Vec<String>)> = jobs
        .into_iter()
        .map(|(name, priority, deps)| (name, (priority, deps)))
        .collect();
    let mut phases = Vec::new();

    while !remaining.is_empty() {
        let mut phase: Vec<String> = remaining
            .iter()
            .filter(|(_, (_, deps))| deps.iter().all(|dep| !remaining.contains_key(dep)))
            .map(|(name, _)| name.clone())
            .collect();

        if phase.is_empty() {
            warn!(
                "Dependency cycle among {:?}; starting them in one phase",
                remaining.keys().collect::<Vec<_>>()
            );
            phase = remaining.keys().cloned().collect();
        }

        phase.sort_by(|a, b| {
            let pa = remaining.get(a).map(|(p, _)| *p).unwrap_or(u32::MAX);
            let pb = remaining.get(b).map(|(p, _)| *p).unwrap_or(u32::MAX);
            pa.cmp(&pb).then_with(|| a.cmp(b))
        });
        for name in &phase {
            remaining.remove(name);
        }
        phases.push(phase);
    }

    phases
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GovernorSettings;
    use crate::supervisor::context::ExecutionContext;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn jobs(specs: &[(&str, u32, &[&str])]) -> Vec<(String, u32, Vec<String>)> {
        specs
            .iter()
            .map(|(name, priority, deps)| {
                (
                    name.to_string(),
                    *priority,
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_layer_phases_staggers_by_dependency() {
        // A (priority 1, no deps), B (priority 1, depends on A),
        // C (priority 5, no deps).
        let phases = layer_phases(jobs(&[
            ("a", 1, &[]),
            ("b", 1, &["a"]),
            ("c", 5, &[]),
        ]));
        assert_eq!(phases, vec![vec!["a".to_string(), "c".to_string()], vec!["b".to_string()]]);
    }

    #[test]
    fn test_layer_phases_orders_by_priority_within_phase() {
        let phases = layer_phases(jobs(&[("late", 9, &[]), ("early", 1, &[]), ("mid", 5, &[])]));
        assert_eq!(
            phases,
            vec![vec![
                "early".to_string(),
                "mid".to_string(),
                "late".to_string()
            ]]
        );
    }

    #[test]
    fn test_layer_phases_chain() {
        let phases = layer_phases(jobs(&[("c", 1, &["b"]), ("b", 1, &["a"]), ("a", 1, &[])]));
        assert_eq!(phases.len(), 3);
        assert_eq!(phases[0], vec!["a".to_string()]);
        assert_eq!(phases[1], vec!["b".to_string()]);
        assert_eq!(phases[2], vec!["c".to_string()]);
    }

    #[test]
    fn test_layer_phases_cycle_degrades_to_single_phase() {
        let phases = layer_phases(jobs(&[("a", 1, &["b"]), ("b", 1, &["a"])]));
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].len(), 2);
    }

    #[test]
    fn test_layer_phases_unregistered_dependency_does_not_block() {
        let phases = layer_phases(jobs(&[("a", 1, &["ghost"])]));
        assert_eq!(phases, vec![vec!["a".to_string()]]);
    }

    struct TickJob {
        name: &'static str,
        executions: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl BackgroundJob for TickJob {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test tick job"
        }
        async fn execute(&self, _ctx: &ExecutionContext) -> Result<(), JobError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(JobError::ExecutionFailed("tick failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn fast_config(name: &str) -> JobConfig {
        let mut config = JobConfig::new(name);
        config.schedule = super::super::job::JobSchedule::Interval(Duration::from_millis(50));
        config.max_retries = 0;
        config.retry_delay = Duration::from_millis(1);
        config.execution_timeout = Duration::from_millis(500);
        config.error_threshold = 2;
        config.restart_delay = Duration::from_millis(10);
        config.health_check_interval = Duration::from_millis(100);
        config
    }

    fn test_supervisor() -> (Supervisor, SupervisorHandle, CancellationToken) {
        let governor = Arc::new(MemoryGovernor::new(GovernorSettings::default()));
        let shutdown = CancellationToken::new();
        let (supervisor, handle) = create_supervisor(
            SupervisorSettings {
                phase_timeout: Duration::from_secs(2),
                stop_grace: Duration::from_millis(200),
                recovery: RecoverySettings {
                    max_restart_attempts: 2,
                    restart_cooldown: Duration::from_millis(1),
                    dependency_timeout: Duration::from_millis(100),
                    action_log_cap: 100,
                },
            },
            governor,
            shutdown.clone(),
        );
        (supervisor, handle, shutdown)
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let (mut supervisor, handle, _shutdown) = test_supervisor();
        let executions = Arc::new(AtomicUsize::new(0));
        supervisor
            .register(
                fast_config("tick"),
                Arc::new(TickJob {
                    name: "tick",
                    executions,
                    fail: false,
                }),
            )
            .await
            .unwrap();

        assert_eq!(supervisor.job_count().await, 1);
        let jobs = handle.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "tick");
        assert!(!jobs[0].is_running);
        assert_eq!(jobs[0].health.status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn test_register_rejects_name_mismatch() {
        let (mut supervisor, _handle, _shutdown) = test_supervisor();
        let executions = Arc::new(AtomicUsize::new(0));
        let result = supervisor
            .register(
                fast_config("expected"),
                Arc::new(TickJob {
                    name: "actual",
                    executions,
                    fail: false,
                }),
            )
            .await;
        assert!(matches!(result, Err(RegistrationError::NameMismatch { .. })));
    }

    #[tokio::test]
    async fn test_started_job_runs_and_becomes_healthy() {
        let (mut supervisor, handle, shutdown) = test_supervisor();
        let executions = Arc::new(AtomicUsize::new(0));
        supervisor
            .register(
                fast_config("tick"),
                Arc::new(TickJob {
                    name: "tick",
                    executions: Arc::clone(&executions),
                    fail: false,
                }),
            )
            .await
            .unwrap();

        let supervisor_task = tokio::spawn(async move { supervisor.run().await });

        handle.start("tick").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(executions.load(Ordering::SeqCst) >= 2);
        assert!(handle.is_healthy("tick").await);

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), supervisor_task).await;
    }

    #[tokio::test]
    async fn test_stopped_job_receives_no_further_runs() {
        let (mut supervisor, handle, shutdown) = test_supervisor();
        let executions = Arc::new(AtomicUsize::new(0));
        supervisor
            .register(
                fast_config("tick"),
                Arc::new(TickJob {
                    name: "tick",
                    executions: Arc::clone(&executions),
                    fail: false,
                }),
            )
            .await
            .unwrap();

        let supervisor_task = tokio::spawn(async move { supervisor.run().await });

        handle.start("tick").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop("tick").await.unwrap();

        let health = handle.get_health("tick").await.unwrap();
        assert_eq!(health.status, JobStatus::Stopped);

        let count_at_stop = executions.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(executions.load(Ordering::SeqCst), count_at_stop);

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), supervisor_task).await;
    }

    #[tokio::test]
    async fn test_trigger_rejects_stopped_job() {
        let (mut supervisor, handle, shutdown) = test_supervisor();
        let executions = Arc::new(AtomicUsize::new(0));
        supervisor
            .register(
                fast_config("tick"),
                Arc::new(TickJob {
                    name: "tick",
                    executions,
                    fail: false,
                }),
            )
            .await
            .unwrap();

        let supervisor_task = tokio::spawn(async move { supervisor.run().await });

        let result = handle.trigger("tick").await;
        assert!(matches!(result, Err(JobError::Stopped)));
        let result = handle.trigger("missing").await;
        assert!(matches!(result, Err(JobError::NotFound)));

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), supervisor_task).await;
    }

    #[tokio::test]
    async fn test_disabled_job_cannot_start() {
        let (mut supervisor, handle, shutdown) = test_supervisor();
        let executions = Arc::new(AtomicUsize::new(0));
        let mut config = fast_config("off");
        config.enabled = false;
        supervisor
            .register(
                config,
                Arc::new(TickJob {
                    name: "off",
                    executions,
                    fail: false,
                }),
            )
            .await
            .unwrap();

        let supervisor_task = tokio::spawn(async move { supervisor.run().await });

        let result = handle.start("off").await;
        assert!(matches!(result, Err(JobError::Disabled)));

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), supervisor_task).await;
    }

    #[tokio::test]
    async fn test_restart_increments_restart_count() {
        let (mut supervisor, handle, shutdown) = test_supervisor();
        let executions = Arc::new(AtomicUsize::new(0));
        supervisor
            .register(
                fast_config("tick"),
                Arc::new(TickJob {
                    name: "tick",
                    executions,
                    fail: false,
                }),
            )
            .await
            .unwrap();

        let supervisor_task = tokio::spawn(async move { supervisor.run().await });

        handle.start("tick").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.restart("tick").await.unwrap();

        let health = handle.get_health("tick").await.unwrap();
        assert_eq!(health.restart_count, 1);

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), supervisor_task).await;
    }
}
