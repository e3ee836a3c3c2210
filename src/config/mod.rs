mod file_config;

pub use file_config::{
    FileConfig, MemoryConfig, RecoveryConfig, SupervisorConfig, SyntheticConfig,
};

use crate::memory::GovernorSettings;
use crate::supervisor::{RecoverySettings, SupervisorSettings};
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub report_dir: PathBuf,
    pub memory_budget_mb: u64,
    pub sample_interval_secs: u64,
    pub diagnostics: bool,
    pub snapshot_dir: PathBuf,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            report_dir: PathBuf::from("reports"),
            memory_budget_mb: 512,
            sample_interval_secs: 30,
            diagnostics: false,
            snapshot_dir: PathBuf::from("memory-snapshots"),
        }
    }
}

/// Settings for the synthetic validation jobs.
#[derive(Debug, Clone)]
pub struct SyntheticSettings {
    pub flaky_failure_rate: f64,
    pub flaky_interval: Duration,
    pub hog_growth_mb_per_run: u64,
    pub hog_interval: Duration,
    pub crash_after_executions: u32,
    pub crash_interval: Duration,
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self {
            flaky_failure_rate: 0.3,
            flaky_interval: Duration::from_millis(500),
            hog_growth_mb_per_run: 8,
            hog_interval: Duration::from_millis(750),
            crash_after_executions: 5,
            crash_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub report_dir: PathBuf,
    pub supervisor: SupervisorSettings,
    pub governor: GovernorSettings,
    pub synthetic: SyntheticSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let report_dir = file
            .report_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| cli.report_dir.clone());

        let sup = file.supervisor.unwrap_or_default();
        let rec = file.recovery.unwrap_or_default();
        let recovery_defaults = RecoverySettings::default();
        let supervisor_defaults = SupervisorSettings::default();
        let supervisor = SupervisorSettings {
            phase_timeout: sup
                .phase_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(supervisor_defaults.phase_timeout),
            stop_grace: sup
                .stop_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(supervisor_defaults.stop_grace),
            recovery: RecoverySettings {
                max_restart_attempts: rec
                    .max_restart_attempts
                    .unwrap_or(recovery_defaults.max_restart_attempts),
                restart_cooldown: rec
                    .restart_cooldown_secs
                    .map(Duration::from_secs)
                    .unwrap_or(recovery_defaults.restart_cooldown),
                dependency_timeout: rec
                    .dependency_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(recovery_defaults.dependency_timeout),
                action_log_cap: rec.action_log_cap.unwrap_or(recovery_defaults.action_log_cap),
            },
        };

        let mem = file.memory.unwrap_or_default();
        let governor_defaults = GovernorSettings::default();
        let governor = GovernorSettings {
            sample_interval: mem
                .sample_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(cli.sample_interval_secs)),
            memory_budget_mb: mem.budget_mb.unwrap_or(cli.memory_budget_mb),
            warning_pct: mem.warning_pct.unwrap_or(governor_defaults.warning_pct),
            critical_pct: mem.critical_pct.unwrap_or(governor_defaults.critical_pct),
            emergency_pct: mem.emergency_pct.unwrap_or(governor_defaults.emergency_pct),
            history_cap: mem.history_cap.unwrap_or(governor_defaults.history_cap),
            leak_window: mem.leak_window.unwrap_or(governor_defaults.leak_window),
            diagnostics_enabled: mem.diagnostics_enabled.unwrap_or(cli.diagnostics),
            snapshot_dir: mem
                .snapshot_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| cli.snapshot_dir.clone()),
            snapshot_retained: mem
                .snapshot_retained
                .unwrap_or(governor_defaults.snapshot_retained),
        };

        let syn = file.synthetic.unwrap_or_default();
        let synthetic_defaults = SyntheticSettings::default();
        let synthetic = SyntheticSettings {
            flaky_failure_rate: syn
                .flaky_failure_rate
                .unwrap_or(synthetic_defaults.flaky_failure_rate),
            flaky_interval: syn
                .flaky_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(synthetic_defaults.flaky_interval),
            hog_growth_mb_per_run: syn
                .hog_growth_mb_per_run
                .unwrap_or(synthetic_defaults.hog_growth_mb_per_run),
            hog_interval: syn
                .hog_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(synthetic_defaults.hog_interval),
            crash_after_executions: syn
                .crash_after_executions
                .unwrap_or(synthetic_defaults.crash_after_executions),
            crash_interval: syn
                .crash_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(synthetic_defaults.crash_interval),
        };

        Ok(Self {
            report_dir,
            supervisor,
            governor,
            synthetic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults_from_cli() {
        let cli = CliConfig::default();
        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.governor.memory_budget_mb, 512);
        assert_eq!(config.governor.sample_interval, Duration::from_secs(30));
        assert_eq!(config.report_dir, PathBuf::from("reports"));
    }

    #[test]
    fn test_toml_overrides_cli() {
        let cli = CliConfig {
            memory_budget_mb: 256,
            ..Default::default()
        };
        let file: FileConfig = toml::from_str(
            r#"
            report_dir = "out"

            [memory]
            budget_mb = 2048
            sample_interval_secs = 5

            [supervisor]
            stop_grace_secs = 3
            "#,
        )
        .unwrap();

        let config = AppConfig::resolve(&cli, Some(file)).unwrap();
        assert_eq!(config.governor.memory_budget_mb, 2048);
        assert_eq!(config.governor.sample_interval, Duration::from_secs(5));
        assert_eq!(config.supervisor.stop_grace, Duration::from_secs(3));
        assert_eq!(config.report_dir, PathBuf::from("out"));
    }
}
