use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context provided to a job for one execution.
///
/// Created when a run starts and discarded when it ends; its data is folded
/// into the job's health and metrics. At most one context is live per job at
/// any time.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Name of the job being executed.
    pub job_name: String,

    /// Unique id for this execution.
    pub execution_id: Uuid,

    /// Correlation id carried through logs for this run and any retries of it.
    pub correlation_id: Uuid,

    /// Wall-clock start of this attempt.
    pub started_at: DateTime<Utc>,

    /// Budget for this attempt; the run is cancelled past it.
    pub timeout: Duration,

    /// How many retries preceded this attempt within the current cycle.
    pub retry_count: u32,

    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// Process resident memory when the attempt started, in megabytes.
    pub memory_at_start_mb: u64,
}

impl ExecutionContext {
    pub fn new(
        job_name: impl Into<String>,
        correlation_id: Uuid,
        timeout: Duration,
        retry_count: u32,
        cancellation_token: CancellationToken,
        memory_at_start_mb: u64,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            execution_id: Uuid::new_v4(),
            correlation_id,
            started_at: Utc::now(),
            timeout,
            retry_count,
            cancellation_token,
            memory_at_start_mb,
        }
    }

    /// Check if cancellation has been requested.
    ///
    /// Jobs should periodically check this during long-running operations
    /// and return early with `JobError::Cancelled` if true.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_ids_are_unique() {
        let token = CancellationToken::new();
        let correlation = Uuid::new_v4();
        let a = ExecutionContext::new("job", correlation, Duration::from_secs(1), 0, token.clone(), 0);
        let b = ExecutionContext::new("job", correlation, Duration::from_secs(1), 1, token, 0);
        assert_ne!(a.execution_id, b.execution_id);
        assert_eq!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn test_cancellation_is_observed() {
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new(
            "job",
            Uuid::new_v4(),
            Duration::from_secs(1),
            0,
            token.clone(),
            0,
        );
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
