use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub report_dir: Option<String>,

    // Feature configs
    pub supervisor: Option<SupervisorConfig>,
    pub recovery: Option<RecoveryConfig>,
    pub memory: Option<MemoryConfig>,
    pub synthetic: Option<SyntheticConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    pub phase_timeout_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_restart_attempts: Option<u32>,
    pub restart_cooldown_secs: Option<u64>,
    pub dependency_timeout_secs: Option<u64>,
    pub action_log_cap: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    pub sample_interval_secs: Option<u64>,
    pub budget_mb: Option<u64>,
    pub warning_pct: Option<f64>,
    pub critical_pct: Option<f64>,
    pub emergency_pct: Option<f64>,
    pub history_cap: Option<usize>,
    pub leak_window: Option<usize>,
    pub diagnostics_enabled: Option<bool>,
    pub snapshot_dir: Option<String>,
    pub snapshot_retained: Option<usize>,
}

/// Knobs for the synthetic jobs driven by the `test` and `stress` commands.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SyntheticConfig {
    pub flaky_failure_rate: Option<f64>,
    pub flaky_interval_ms: Option<u64>,
    pub hog_growth_mb_per_run: Option<u64>,
    pub hog_interval_ms: Option<u64>,
    pub crash_after_executions: Option<u32>,
    pub crash_interval_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_parses_with_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.report_dir.is_none());
        assert!(config.memory.is_none());
    }

    #[test]
    fn test_partial_config_parses() {
        let config: FileConfig = toml::from_str(
            r#"
            report_dir = "/var/lib/taskwarden/reports"

            [memory]
            budget_mb = 1024
            warning_pct = 70.0

            [recovery]
            max_restart_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(
            config.report_dir.as_deref(),
            Some("/var/lib/taskwarden/reports")
        );
        let memory = config.memory.unwrap();
        assert_eq!(memory.budget_mb, Some(1024));
        assert_eq!(memory.warning_pct, Some(70.0));
        assert!(memory.critical_pct.is_none());
        assert_eq!(config.recovery.unwrap().max_restart_attempts, Some(5));
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = FileConfig::load(Path::new("/nonexistent/taskwarden.toml"));
        assert!(result.is_err());
    }
}
