use super::context::ExecutionContext;
use super::job::{BackgroundJob, JobConfig, JobError};
use crate::memory::probe;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long a timed-out attempt is given to observe its cancellation token
/// before the attempt task is dropped.
const CANCEL_DRAIN: Duration = Duration::from_millis(250);

/// Terminal result of one execution cycle (initial attempt plus retries).
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub timed_out: bool,
    pub duration: Duration,
    pub error: Option<String>,
    /// Attempts consumed this cycle, including the initial one.
    pub attempts: u32,
    pub memory_start_mb: u64,
    pub memory_end_mb: u64,
}

/// Executes one job's unit of work under a timeout and a single-flight guard.
///
/// The runner owns the authoritative in-flight registry: a second `run` call
/// for a job with a live execution is rejected immediately, never queued.
#[derive(Clone, Default)]
pub struct JobRunner {
    in_flight: Arc<Mutex<HashMap<String, Uuid>>>,
}

struct InFlightGuard {
    in_flight: Arc<Mutex<HashMap<String, Uuid>>>,
    job_name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.remove(&self.job_name);
        }
    }
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self, job_name: &str) -> bool {
        self.in_flight
            .lock()
            .map(|map| map.contains_key(job_name))
            .unwrap_or(false)
    }

    /// Run one cycle of `job`: the initial attempt plus up to
    /// `config.max_retries` immediate retries. Failures are only reported
    /// upward once retries are exhausted.
    pub async fn run(
        &self,
        job: Arc<dyn BackgroundJob>,
        config: &JobConfig,
        cancel: CancellationToken,
        previous_retry_count: u32,
    ) -> Result<RunOutcome, JobError> {
        let correlation_id = Uuid::new_v4();
        let _guard = {
            let mut map = self
                .in_flight
                .lock()
                .map_err(|_| JobError::ExecutionFailed("in-flight registry poisoned".to_string()))?;
            if map.contains_key(&config.name) {
                debug!("Rejecting run for {}: execution still in flight", config.name);
                return Err(JobError::AlreadyRunning);
            }
            map.insert(config.name.clone(), correlation_id);
            InFlightGuard {
                in_flight: Arc::clone(&self.in_flight),
                job_name: config.name.clone(),
            }
        };

        let cycle_start = Instant::now();
        let memory_start_mb = probe::process_rss_mb();
        let mut retry_count = previous_retry_count;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempt = self
                .attempt(Arc::clone(&job), config, &cancel, correlation_id, retry_count)
                .await;

            match attempt {
                AttemptResult::Success => {
                    return Ok(RunOutcome {
                        success: true,
                        timed_out: false,
                        duration: cycle_start.elapsed(),
                        error: None,
                        attempts,
                        memory_start_mb,
                        memory_end_mb: probe::process_rss_mb(),
                    });
                }
                AttemptResult::Cancelled => {
                    // Shutdown or explicit stop; do not burn retries.
                    return Ok(RunOutcome {
                        success: false,
                        timed_out: false,
                        duration: cycle_start.elapsed(),
                        error: Some("cancelled".to_string()),
                        attempts,
                        memory_start_mb,
                        memory_end_mb: probe::process_rss_mb(),
                    });
                }
                AttemptResult::Failed { timed_out, error } => {
                    if retry_count < config.max_retries && !cancel.is_cancelled() {
                        retry_count += 1;
                        debug!(
                            "Job {} attempt failed ({}), retry {}/{} after {:?}",
                            config.name, error, retry_count, config.max_retries, config.retry_delay
                        );
                        tokio::time::sleep(config.retry_delay).await;
                        continue;
                    }
                    warn!(
                        "Job {} failed after {} attempt(s): {}",
                        config.name, attempts, error
                    );
                    return Ok(RunOutcome {
                        success: false,
                        timed_out,
                        duration: cycle_start.elapsed(),
                        error: Some(error),
                        attempts,
                        memory_start_mb,
                        memory_end_mb: probe::process_rss_mb(),
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        job: Arc<dyn BackgroundJob>,
        config: &JobConfig,
        cancel: &CancellationToken,
        correlation_id: Uuid,
        retry_count: u32,
    ) -> AttemptResult {
        // Per-attempt child token: a timeout cancels this attempt only, while
        // a parent cancellation still reaches the job body.
        let attempt_token = cancel.child_token();
        let ctx = ExecutionContext::new(
            config.name.as_str(),
            correlation_id,
            config.execution_timeout,
            retry_count,
            attempt_token.clone(),
            probe::process_rss_mb(),
        );

        let mut task = tokio::spawn(async move { job.execute(&ctx).await });

        match tokio::time::timeout(config.execution_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => AttemptResult::Success,
            Ok(Ok(Err(JobError::Cancelled))) => AttemptResult::Cancelled,
            Ok(Ok(Err(err))) => AttemptResult::Failed {
                timed_out: false,
                error: err.to_string(),
            },
            Ok(Err(join_err)) => AttemptResult::Failed {
                timed_out: false,
                error: format!("Task panic: {}", join_err),
            },
            Err(_elapsed) => {
                attempt_token.cancel();
                // Give the body a moment to observe the token; there is no
                // preemptive kill beyond dropping the attempt task.
                let _ = tokio::time::timeout(CANCEL_DRAIN, &mut task).await;
                task.abort();
                AttemptResult::Failed {
                    timed_out: true,
                    error: format!("timed out after {:?}", config.execution_timeout),
                }
            }
        }
    }
}

enum AttemptResult {
    Success,
    Cancelled,
    Failed { timed_out: bool, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingJob {
        name: &'static str,
        executions: AtomicU32,
        fail_always: bool,
    }

    #[async_trait]
    impl BackgroundJob for CountingJob {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<(), JobError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if self.fail_always {
                Err(JobError::ExecutionFailed("always fails".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct SlowJob;

    #[async_trait]
    impl BackgroundJob for SlowJob {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, ctx: &ExecutionContext) -> Result<(), JobError> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(()),
                _ = ctx.cancellation_token.cancelled() => Err(JobError::Cancelled),
            }
        }
    }

    fn fast_config(name: &str) -> JobConfig {
        let mut config = JobConfig::new(name);
        config.max_retries = 3;
        config.retry_delay = Duration::from_millis(1);
        config.execution_timeout = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn test_success_outcome() {
        let runner = JobRunner::new();
        let job = Arc::new(CountingJob {
            name: "ok",
            executions: AtomicU32::new(0),
            fail_always: false,
        });
        let outcome = runner
            .run(job.clone(), &fast_config("ok"), CancellationToken::new(), 0)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(job.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_bound_initial_plus_max_retries() {
        let runner = JobRunner::new();
        let job = Arc::new(CountingJob {
            name: "fails",
            executions: AtomicU32::new(0),
            fail_always: true,
        });
        let outcome = runner
            .run(job.clone(), &fast_config("fails"), CancellationToken::new(), 0)
            .await
            .unwrap();
        assert!(!outcome.success);
        // max_retries=3 means exactly 4 attempts: 1 initial + 3 retries.
        assert_eq!(outcome.attempts, 4);
        assert_eq!(job.executions.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_is_failure_and_cancels_context() {
        let runner = JobRunner::new();
        let mut config = fast_config("slow");
        config.max_retries = 0;
        let outcome = runner
            .run(Arc::new(SlowJob), &config, CancellationToken::new(), 0)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn test_single_flight_rejects_second_run() {
        let runner = JobRunner::new();
        let config = Arc::new(fast_config("slow"));
        let mut slow_config = (*config).clone();
        slow_config.execution_timeout = Duration::from_secs(5);

        let first = {
            let runner = runner.clone();
            let config = slow_config.clone();
            tokio::spawn(async move {
                runner
                    .run(Arc::new(SlowJob), &config, CancellationToken::new(), 0)
                    .await
            })
        };

        // Wait until the first run holds the in-flight slot.
        let mut waited = 0;
        while !runner.is_in_flight("slow") && waited < 100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += 1;
        }
        assert!(runner.is_in_flight("slow"));

        let second = runner
            .run(Arc::new(SlowJob), &slow_config, CancellationToken::new(), 0)
            .await;
        assert!(matches!(second, Err(JobError::AlreadyRunning)));

        first.abort();
        let _ = first.await;
    }

    #[tokio::test]
    async fn test_in_flight_slot_released_after_run() {
        let runner = JobRunner::new();
        let job = Arc::new(CountingJob {
            name: "ok",
            executions: AtomicU32::new(0),
            fail_always: false,
        });
        let _ = runner
            .run(job, &fast_config("ok"), CancellationToken::new(), 0)
            .await
            .unwrap();
        assert!(!runner.is_in_flight("ok"));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_retries() {
        let runner = JobRunner::new();
        let token = CancellationToken::new();
        token.cancel();
        let mut config = fast_config("slow");
        config.max_retries = 5;
        let outcome = runner
            .run(Arc::new(SlowJob), &config, token, 0)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_panicking_job_is_a_failure_not_a_crash() {
        struct PanicJob;

        #[async_trait]
        impl BackgroundJob for PanicJob {
            fn name(&self) -> &str {
                "panics"
            }
            async fn execute(&self, _ctx: &ExecutionContext) -> Result<(), JobError> {
                panic!("job body exploded");
            }
        }

        let runner = JobRunner::new();
        let mut config = fast_config("panics");
        config.max_retries = 1;
        let outcome = runner
            .run(Arc::new(PanicJob), &config, CancellationToken::new(), 0)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.error.unwrap().contains("panic"));
    }
}
