//! Taskwarden library
//!
//! Background task supervision with memory governance for a long-lived
//! service process: periodic job scheduling, per-job health tracking,
//! graduated recovery, and a process memory governor feeding cleanup and
//! restart decisions.

pub mod config;
pub mod memory;
pub mod metrics;
pub mod report;
pub mod supervisor;
pub mod synthetic;

// Re-export commonly used types for convenience
pub use memory::{GovernorSettings, MemoryGovernor, PressureLevel};
pub use supervisor::{
    create_supervisor, BackgroundJob, ExecutionContext, JobConfig, JobError, JobSchedule,
    JobStatus, Supervisor, SupervisorHandle, SupervisorSettings,
};
