//! Process memory governance.
//!
//! Samples process memory on a fixed timer, detects sustained growth, and
//! executes graduated cleanup actions at rising severity thresholds.

pub mod governor;
pub mod probe;
pub mod snapshot;
pub mod strategy;

pub use governor::{
    GovernorSettings, LeakReport, MemoryAlert, MemoryGovernor, MemoryHealthReport,
    MemoryPressureEvent, MemoryTrend, MemoryUsage, PressureLevel,
};
pub use snapshot::MemorySnapshot;
pub use strategy::{CleanupStrategy, CompactionHook, NoopCompaction, StrategyRegistry};
