//! Synthetic jobs for end-to-end resilience validation.
//!
//! The `test` and `stress` commands run these through the real supervisor:
//! a job with a configurable failure rate, a job that grows memory on every
//! run, and a job that starts failing after a fixed number of executions.

use crate::memory::CleanupStrategy;
use crate::supervisor::{BackgroundJob, ExecutionContext, JobError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Fails a configurable fraction of its runs at random.
pub struct FlakyJob {
    name: String,
    failure_rate: f64,
    work: Duration,
}

impl FlakyJob {
    pub fn new(name: impl Into<String>, failure_rate: f64, work: Duration) -> Self {
        Self {
            name: name.into(),
            failure_rate,
            work,
        }
    }
}

#[async_trait]
impl BackgroundJob for FlakyJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Synthetic job with a configurable random failure rate"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), JobError> {
        tokio::select! {
            _ = tokio::time::sleep(self.work) => {}
            _ = ctx.cancellation_token.cancelled() => return Err(JobError::Cancelled),
        }
        if rand::random::<f64>() < self.failure_rate {
            Err(JobError::ExecutionFailed("induced random failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Allocates and retains memory on every run to exercise the governor.
pub struct MemoryHogJob {
    name: String,
    growth_mb_per_run: u64,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl MemoryHogJob {
    pub fn new(name: impl Into<String>, growth_mb_per_run: u64) -> Self {
        Self {
            name: name.into(),
            growth_mb_per_run,
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn retained_mb(&self) -> u64 {
        let buffers = self.buffers.lock().expect("hog buffers poisoned");
        buffers.iter().map(|b| b.len() as u64).sum::<u64>() / 1024 / 1024
    }

    /// Drop every retained buffer; returns the megabytes released.
    pub fn release_buffers(&self) -> u64 {
        let mut buffers = self.buffers.lock().expect("hog buffers poisoned");
        let freed = buffers.iter().map(|b| b.len() as u64).sum::<u64>() / 1024 / 1024;
        buffers.clear();
        buffers.shrink_to_fit();
        debug!("Memory hog released ~{} MB", freed);
        freed
    }
}

#[async_trait]
impl BackgroundJob for MemoryHogJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Synthetic job that retains memory on every execution"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let bytes = (self.growth_mb_per_run as usize) * 1024 * 1024;
        // Touch every page so the allocation is actually resident.
        let buffer = vec![0xA5u8; bytes];
        self.buffers
            .lock()
            .expect("hog buffers poisoned")
            .push(buffer);
        Ok(())
    }

    async fn cleanup(&self) -> u64 {
        self.release_buffers()
    }
}

/// Cleanup strategy that sheds the hog job's retained buffers, registered
/// with the governor by the validation harness.
pub struct HogCacheStrategy {
    hog: Arc<MemoryHogJob>,
}

impl HogCacheStrategy {
    pub fn new(hog: Arc<MemoryHogJob>) -> Self {
        Self { hog }
    }
}

impl CleanupStrategy for HogCacheStrategy {
    fn name(&self) -> &str {
        "synthetic_hog_buffers"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn threshold_pct(&self) -> f64 {
        50.0
    }

    fn run(&self) -> u64 {
        self.hog.release_buffers()
    }
}

/// Succeeds for its first N executions, then fails every run. Counts survive
/// restarts, so the supervisor eventually exhausts its restart budget.
pub struct CrashAfterJob {
    name: String,
    crash_after: u32,
    executions: AtomicU32,
}

impl CrashAfterJob {
    pub fn new(name: impl Into<String>, crash_after: u32) -> Self {
        Self {
            name: name.into(),
            crash_after,
            executions: AtomicU32::new(0),
        }
    }

    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundJob for CrashAfterJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Synthetic job that starts failing after a fixed number of executions"
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<(), JobError> {
        let count = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.crash_after {
            Err(JobError::ExecutionFailed(format!(
                "induced crash (execution {} past limit {})",
                count, self.crash_after
            )))
        } else {
            Ok(())
        }
    }
}

/// Always succeeds after a short pause. Used as a dependency anchor in the
/// validation scenarios.
pub struct SteadyJob {
    name: String,
    work: Duration,
}

impl SteadyJob {
    pub fn new(name: impl Into<String>, work: Duration) -> Self {
        Self {
            name: name.into(),
            work,
        }
    }
}

#[async_trait]
impl BackgroundJob for SteadyJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Synthetic job that always succeeds"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), JobError> {
        tokio::select! {
            _ = tokio::time::sleep(self.work) => Ok(()),
            _ = ctx.cancellation_token.cancelled() => Err(JobError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(name: &str) -> ExecutionContext {
        ExecutionContext::new(
            name,
            Uuid::new_v4(),
            Duration::from_secs(1),
            0,
            CancellationToken::new(),
            0,
        )
    }

    #[tokio::test]
    async fn test_flaky_job_at_rate_zero_always_succeeds() {
        let job = FlakyJob::new("flaky", 0.0, Duration::ZERO);
        for _ in 0..20 {
            assert!(job.execute(&ctx("flaky")).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_flaky_job_at_rate_one_always_fails() {
        let job = FlakyJob::new("flaky", 1.0, Duration::ZERO);
        for _ in 0..20 {
            assert!(job.execute(&ctx("flaky")).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_memory_hog_grows_and_releases() {
        let job = MemoryHogJob::new("hog", 2);
        job.execute(&ctx("hog")).await.unwrap();
        job.execute(&ctx("hog")).await.unwrap();
        assert_eq!(job.retained_mb(), 4);

        let freed = job.cleanup().await;
        assert_eq!(freed, 4);
        assert_eq!(job.retained_mb(), 0);
    }

    #[tokio::test]
    async fn test_hog_strategy_delegates_to_job() {
        let hog = Arc::new(MemoryHogJob::new("hog", 1));
        hog.execute(&ctx("hog")).await.unwrap();
        let strategy = HogCacheStrategy::new(Arc::clone(&hog));
        assert_eq!(strategy.run(), 1);
        assert_eq!(hog.retained_mb(), 0);
    }

    #[tokio::test]
    async fn test_crash_after_job_fails_past_limit() {
        let job = CrashAfterJob::new("crash", 3);
        for _ in 0..3 {
            assert!(job.execute(&ctx("crash")).await.is_ok());
        }
        for _ in 0..5 {
            assert!(job.execute(&ctx("crash")).await.is_err());
        }
        assert_eq!(job.executions(), 8);
    }

    #[tokio::test]
    async fn test_steady_job_observes_cancellation() {
        let token = CancellationToken::new();
        let context = ExecutionContext::new(
            "steady",
            Uuid::new_v4(),
            Duration::from_secs(1),
            0,
            token.clone(),
            0,
        );
        let job = SteadyJob::new("steady", Duration::from_secs(30));
        token.cancel();
        let result = job.execute(&context).await;
        assert!(matches!(result, Err(JobError::Cancelled)));
    }
}
