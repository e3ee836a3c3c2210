//! Process memory probing via sysinfo.
//!
//! Kept separate from the governor so the job runner can record per-run
//! memory without holding a governor reference.

use lazy_static::lazy_static;
use std::sync::Mutex;
use sysinfo::{ProcessesToUpdate, System};

lazy_static! {
    // One reused System keeps per-sample cost down; callers hold the lock
    // only for the duration of a refresh.
    static ref PROBE: Mutex<System> = Mutex::new(System::new());
}

/// Snapshot of the current process's memory figures, in megabytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory {
    pub rss_mb: u64,
    pub virtual_mb: u64,
}

/// Sample the current process. Returns zeroed figures if the process cannot
/// be inspected rather than failing the caller.
pub fn sample_process(sys: &mut System) -> ProcessMemory {
    let pid = match sysinfo::get_current_pid() {
        Ok(pid) => pid,
        Err(e) => {
            tracing::warn!("Failed to resolve current pid for memory probe: {}", e);
            return ProcessMemory::default();
        }
    };
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match sys.process(pid) {
        Some(proc) => ProcessMemory {
            rss_mb: proc.memory() / 1024 / 1024,
            virtual_mb: proc.virtual_memory() / 1024 / 1024,
        },
        None => ProcessMemory::default(),
    }
}

/// Current resident set size of this process in megabytes.
pub fn process_rss_mb() -> u64 {
    PROBE
        .lock()
        .map(|mut sys| sample_process(&mut sys).rss_mb)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_reports_nonzero_rss() {
        let mut sys = System::new();
        let sample = sample_process(&mut sys);
        // A running test binary has a measurable resident size.
        assert!(sample.rss_mb > 0);
        assert!(sample.virtual_mb >= sample.rss_mb);
    }

    #[test]
    fn test_process_rss_helper() {
        assert!(process_rss_mb() > 0);
    }
}
