use super::probe;
use super::snapshot::{self, MemorySnapshot};
use super::strategy::{CleanupStrategy, CompactionHook, NoopCompaction, StrategyRegistry};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use sysinfo::System;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Growth rate (MB per minute) above which the leak heuristic fires.
const LEAK_GROWTH_MB_PER_MIN: f64 = 1.0;

/// Each leak-window sample must be at least this fraction of its predecessor
/// for the window to count as monotonically non-decreasing.
const LEAK_MONOTONE_TOLERANCE: f64 = 0.95;

/// Growth rate (MB per minute) separating a stable trend from a moving one.
const TREND_STABLE_BAND: f64 = 0.5;

/// Leveled memory pressure condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Warning,
    Critical,
    Emergency,
}

impl PressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
            PressureLevel::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable memory sample.
#[derive(Debug, Clone)]
pub struct MemoryUsage {
    pub rss_mb: u64,
    pub virtual_mb: u64,
    /// Mapped-but-nonresident estimate: virtual size minus resident size.
    pub external_mb: u64,
    /// Resident size as a percentage of the configured memory budget.
    pub usage_pct: f64,
    pub at: DateTime<Utc>,
}

/// Leveled notification carrying the sample that triggered it.
#[derive(Debug, Clone)]
pub struct MemoryAlert {
    pub level: PressureLevel,
    pub usage: MemoryUsage,
    pub at: DateTime<Utc>,
}

/// Record of one cleanup pass: which strategies ran and how much they freed.
#[derive(Debug, Clone)]
pub struct MemoryPressureEvent {
    /// Pressure level for sampler-driven passes, None for manual triggers.
    pub level: Option<PressureLevel>,
    pub trigger: String,
    pub strategies_run: Vec<String>,
    pub freed_mb: u64,
    pub compaction_triggered: bool,
    pub at: DateTime<Utc>,
}

/// Verdict of the leak heuristic over the detection window.
#[derive(Debug, Clone)]
pub struct LeakReport {
    pub detected: bool,
    pub growth_rate_mb_per_min: f64,
    /// 0-100, scaled from the growth rate.
    pub confidence: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTrend {
    Increasing,
    Decreasing,
    Stable,
}

impl MemoryTrend {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTrend::Increasing => "increasing",
            MemoryTrend::Decreasing => "decreasing",
            MemoryTrend::Stable => "stable",
        }
    }
}

/// Read model aggregating the governor's view of process memory.
#[derive(Debug, Clone)]
pub struct MemoryHealthReport {
    pub current: MemoryUsage,
    pub trend: MemoryTrend,
    pub leak: LeakReport,
    pub compaction_attempts: u64,
    pub compactions_succeeded: u64,
    pub snapshots_written: u64,
    pub recent_alerts: Vec<MemoryAlert>,
    pub recent_pressure_events: Vec<MemoryPressureEvent>,
    pub recommendations: Vec<String>,
}

/// Governor configuration.
#[derive(Debug, Clone)]
pub struct GovernorSettings {
    pub sample_interval: Duration,
    /// Service memory budget; usage percentages are relative to this.
    pub memory_budget_mb: u64,
    pub warning_pct: f64,
    pub critical_pct: f64,
    pub emergency_pct: f64,
    pub history_cap: usize,
    pub leak_window: usize,
    pub diagnostics_enabled: bool,
    pub snapshot_dir: PathBuf,
    pub snapshot_retained: usize,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(30),
            memory_budget_mb: 512,
            warning_pct: 75.0,
            critical_pct: 85.0,
            emergency_pct: 95.0,
            history_cap: 1000,
            leak_window: 10,
            diagnostics_enabled: false,
            snapshot_dir: PathBuf::from("memory-snapshots"),
            snapshot_retained: 5,
        }
    }
}

#[derive(Default)]
struct GovernorState {
    history: VecDeque<MemoryUsage>,
    leak_window: VecDeque<MemoryUsage>,
    alerts: VecDeque<MemoryAlert>,
    pressure_events: VecDeque<MemoryPressureEvent>,
    compaction_attempts: u64,
    compactions_succeeded: u64,
    snapshots_written: u64,
}

const ALERT_HISTORY_CAP: usize = 50;
const EVENT_HISTORY_CAP: usize = 50;

/// Samples process memory, detects sustained growth, and executes graduated
/// cleanup at rising severity thresholds.
///
/// One instance per process, explicitly constructed and passed to whatever
/// owns the process lifecycle. The sampler runs on its own timer; pressure
/// handling is spawned and never awaited by the sampling loop.
pub struct MemoryGovernor {
    settings: GovernorSettings,
    state: Mutex<GovernorState>,
    sys: Mutex<System>,
    strategies: RwLock<StrategyRegistry>,
    compaction: Box<dyn CompactionHook>,
    alert_tx: Mutex<Option<mpsc::Sender<MemoryAlert>>>,
    monitor_cancel: Mutex<Option<CancellationToken>>,
}

impl MemoryGovernor {
    pub fn new(settings: GovernorSettings) -> Self {
        Self::with_compaction_hook(settings, Box::new(NoopCompaction))
    }

    pub fn with_compaction_hook(settings: GovernorSettings, hook: Box<dyn CompactionHook>) -> Self {
        Self {
            settings,
            state: Mutex::new(GovernorState::default()),
            sys: Mutex::new(System::new()),
            strategies: RwLock::new(StrategyRegistry::new()),
            compaction: hook,
            alert_tx: Mutex::new(None),
            monitor_cancel: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &GovernorSettings {
        &self.settings
    }

    pub fn register_strategy(&self, strategy: Arc<dyn CleanupStrategy>) {
        self.strategies
            .write()
            .expect("strategy registry poisoned")
            .register(strategy);
    }

    /// Subscribe to alerts raised by the sampling loop. A slow subscriber
    /// loses alerts rather than stalling the sampler.
    pub fn subscribe_alerts(&self) -> mpsc::Receiver<MemoryAlert> {
        let (tx, rx) = mpsc::channel(32);
        *self.alert_tx.lock().expect("alert sender poisoned") = Some(tx);
        rx
    }

    /// Take a fresh sample without recording it.
    pub fn get_current_usage(&self) -> MemoryUsage {
        let pm = {
            let mut sys = self.sys.lock().expect("system handle poisoned");
            probe::sample_process(&mut sys)
        };
        self.usage_from(pm.rss_mb, pm.virtual_mb)
    }

    /// Start the periodic sampler on its own timer, independent of any job's
    /// schedule.
    pub fn start_monitoring(governor: &Arc<Self>) {
        let mut slot = governor
            .monitor_cancel
            .lock()
            .expect("monitor slot poisoned");
        if slot.is_some() {
            warn!("Memory monitoring already running");
            return;
        }
        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());
        drop(slot);

        info!(
            "Starting memory monitoring: every {:?}, budget {} MB, thresholds {}/{}/{}%",
            governor.settings.sample_interval,
            governor.settings.memory_budget_mb,
            governor.settings.warning_pct,
            governor.settings.critical_pct,
            governor.settings.emergency_pct
        );

        let governor = Arc::clone(governor);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(governor.settings.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(level) = governor.sample_tick() {
                            let inner = Arc::clone(&governor);
                            // Fire and forget: a slow cleanup never delays the
                            // next sample.
                            tokio::spawn(async move { inner.handle_pressure(level).await; });
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("Memory monitoring stopped");
                        break;
                    }
                }
            }
        });
    }

    pub fn stop_monitoring(&self) {
        if let Some(cancel) = self
            .monitor_cancel
            .lock()
            .expect("monitor slot poisoned")
            .take()
        {
            cancel.cancel();
        }
    }

    /// One sampler tick: record, then report only the highest applicable
    /// level so the caller can spawn the pressure response.
    fn sample_tick(&self) -> Option<PressureLevel> {
        let usage = self.record_sample();
        let level = self.evaluate_level(&usage)?;
        self.push_alert(MemoryAlert {
            level,
            usage,
            at: Utc::now(),
        });
        Some(level)
    }

    fn record_sample(&self) -> MemoryUsage {
        let pm = {
            let mut sys = self.sys.lock().expect("system handle poisoned");
            probe::sample_process(&mut sys)
        };
        let usage = self.usage_from(pm.rss_mb, pm.virtual_mb);
        metrics::update_memory_gauges(usage.rss_mb, usage.usage_pct);
        self.push_sample(usage.clone());
        usage
    }

    fn push_sample(&self, usage: MemoryUsage) {
        let mut state = self.state.lock().expect("governor state poisoned");
        if state.history.len() >= self.settings.history_cap {
            state.history.pop_front();
        }
        state.history.push_back(usage.clone());
        if state.leak_window.len() >= self.settings.leak_window {
            state.leak_window.pop_front();
        }
        state.leak_window.push_back(usage);
    }

    /// Evaluate thresholds in descending severity so only the highest
    /// applicable level fires per tick.
    fn evaluate_level(&self, usage: &MemoryUsage) -> Option<PressureLevel> {
        if usage.usage_pct >= self.settings.emergency_pct {
            Some(PressureLevel::Emergency)
        } else if usage.usage_pct >= self.settings.critical_pct {
            Some(PressureLevel::Critical)
        } else if usage.usage_pct >= self.settings.warning_pct {
            Some(PressureLevel::Warning)
        } else {
            None
        }
    }

    fn push_alert(&self, alert: MemoryAlert) {
        warn!(
            "Memory pressure {}: {} MB resident ({:.1}% of budget)",
            alert.level, alert.usage.rss_mb, alert.usage.usage_pct
        );
        metrics::record_memory_alert(alert.level.as_str());
        {
            let mut state = self.state.lock().expect("governor state poisoned");
            if state.alerts.len() >= ALERT_HISTORY_CAP {
                state.alerts.pop_front();
            }
            state.alerts.push_back(alert.clone());
        }
        let maybe_tx = self
            .alert_tx
            .lock()
            .expect("alert sender poisoned")
            .clone();
        if let Some(tx) = maybe_tx {
            if tx.try_send(alert).is_err() {
                debug!("Alert subscriber not keeping up; alert dropped");
            }
        }
    }

    /// Execute the cleanup response for a pressure level: all enabled
    /// strategies whose threshold is at or below current usage, in descending
    /// priority order, plus compaction and diagnostics at the higher levels.
    pub async fn handle_pressure(&self, level: PressureLevel) -> MemoryPressureEvent {
        let usage = self.get_current_usage();
        let (ran, freed_mb) = self
            .strategies
            .read()
            .expect("strategy registry poisoned")
            .execute_eligible(usage.usage_pct);

        let mut compaction_triggered = false;
        if level >= PressureLevel::Critical {
            compaction_triggered = self.attempt_compaction();
        }

        if level >= PressureLevel::Critical && self.settings.diagnostics_enabled {
            self.capture_snapshot(level.as_str());
        }

        let event = MemoryPressureEvent {
            level: Some(level),
            trigger: format!("pressure:{}", level),
            strategies_run: ran,
            freed_mb,
            compaction_triggered,
            at: Utc::now(),
        };
        info!(
            "Pressure {} handled: {} strategies ran, ~{} MB freed",
            level,
            event.strategies_run.len(),
            freed_mb
        );
        metrics::record_pressure_handled(level.as_str(), freed_mb);
        self.push_event(event.clone());
        event
    }

    /// Manually triggered cleanup, e.g. from a recovery action scoped to one
    /// job. Runs all enabled strategies regardless of threshold.
    pub fn trigger_cleanup(&self, trigger: &str) -> u64 {
        let (ran, freed_mb) = self
            .strategies
            .read()
            .expect("strategy registry poisoned")
            .execute_all();
        info!(
            "Manual cleanup ({}): {} strategies ran, ~{} MB freed",
            trigger,
            ran.len(),
            freed_mb
        );
        metrics::record_pressure_handled("manual", freed_mb);
        self.push_event(MemoryPressureEvent {
            level: None,
            trigger: trigger.to_string(),
            strategies_run: ran,
            freed_mb,
            compaction_triggered: false,
            at: Utc::now(),
        });
        freed_mb
    }

    fn attempt_compaction(&self) -> bool {
        let triggered = self.compaction.trigger();
        let mut state = self.state.lock().expect("governor state poisoned");
        state.compaction_attempts += 1;
        if triggered {
            state.compactions_succeeded += 1;
        }
        triggered
    }

    fn capture_snapshot(&self, trigger: &str) {
        let mut recent: Vec<u64> = {
            let state = self.state.lock().expect("governor state poisoned");
            state.history.iter().rev().take(20).map(|u| u.rss_mb).collect()
        };
        recent.reverse();
        let usage = self.get_current_usage();
        let leak = self.detect_leak();
        let snapshot = MemorySnapshot {
            captured_at: Utc::now().to_rfc3339(),
            trigger: trigger.to_string(),
            rss_mb: usage.rss_mb,
            virtual_mb: usage.virtual_mb,
            usage_pct: usage.usage_pct,
            recent_rss_mb: recent,
            leak_detected: leak.detected,
            growth_rate_mb_per_min: leak.growth_rate_mb_per_min,
        };
        match snapshot::write_snapshot(
            &self.settings.snapshot_dir,
            &snapshot,
            self.settings.snapshot_retained,
        ) {
            Ok(_) => {
                let mut state = self.state.lock().expect("governor state poisoned");
                state.snapshots_written += 1;
            }
            Err(e) => error!("Failed to capture memory snapshot: {:#}", e),
        }
    }

    fn push_event(&self, event: MemoryPressureEvent) {
        let mut state = self.state.lock().expect("governor state poisoned");
        if state.pressure_events.len() >= EVENT_HISTORY_CAP {
            state.pressure_events.pop_front();
        }
        state.pressure_events.push_back(event);
    }

    /// Flag a leak when the full detection window shows growth above
    /// 1 MB/min and is monotonically non-decreasing.
    pub fn detect_leak(&self) -> LeakReport {
        let state = self.state.lock().expect("governor state poisoned");
        let window = &state.leak_window;
        if window.len() < self.settings.leak_window {
            return LeakReport {
                detected: false,
                growth_rate_mb_per_min: 0.0,
                confidence: 0.0,
                samples: window.len(),
            };
        }

        let growth_rate = growth_rate_mb_per_min(window.iter());
        let monotone = window
            .iter()
            .zip(window.iter().skip(1))
            .all(|(prev, next)| next.rss_mb as f64 >= prev.rss_mb as f64 * LEAK_MONOTONE_TOLERANCE);

        let detected = growth_rate > LEAK_GROWTH_MB_PER_MIN && monotone;
        LeakReport {
            detected,
            growth_rate_mb_per_min: growth_rate,
            confidence: (growth_rate.abs() * 20.0).min(100.0),
            samples: window.len(),
        }
    }

    /// Trend over a wider recent window than leak detection uses.
    pub fn trend(&self) -> MemoryTrend {
        let state = self.state.lock().expect("governor state poisoned");
        let recent: Vec<&MemoryUsage> = state.history.iter().rev().take(100).collect();
        if recent.len() < 2 {
            return MemoryTrend::Stable;
        }
        let rate = growth_rate_mb_per_min(recent.into_iter().rev());
        if rate > TREND_STABLE_BAND {
            MemoryTrend::Increasing
        } else if rate < -TREND_STABLE_BAND {
            MemoryTrend::Decreasing
        } else {
            MemoryTrend::Stable
        }
    }

    /// The read model the recovery engine and dashboards consume.
    pub fn get_health_report(&self) -> MemoryHealthReport {
        let current = self.get_current_usage();
        let trend = self.trend();
        let leak = self.detect_leak();
        let (
            compaction_attempts,
            compactions_succeeded,
            snapshots_written,
            recent_alerts,
            recent_pressure_events,
        ) = {
            let state = self.state.lock().expect("governor state poisoned");
            (
                state.compaction_attempts,
                state.compactions_succeeded,
                state.snapshots_written,
                state.alerts.iter().rev().take(10).cloned().collect(),
                state.pressure_events.iter().rev().take(10).cloned().collect(),
            )
        };

        let mut recommendations = Vec::new();
        if leak.detected {
            recommendations.push(format!(
                "Sustained growth of {:.2} MB/min over the detection window; inspect job cache churn and recent pressure events",
                leak.growth_rate_mb_per_min
            ));
        }
        if current.usage_pct >= self.settings.warning_pct {
            recommendations.push(format!(
                "Resident memory at {:.1}% of the {} MB budget; consider raising the budget or lowering cleanup thresholds",
                current.usage_pct, self.settings.memory_budget_mb
            ));
        }
        if self
            .strategies
            .read()
            .expect("strategy registry poisoned")
            .is_empty()
        {
            recommendations
                .push("No cleanup strategies registered; pressure handling frees nothing".to_string());
        }
        if recommendations.is_empty() {
            recommendations.push("Memory usage is within budget".to_string());
        }

        MemoryHealthReport {
            current,
            trend,
            leak,
            compaction_attempts,
            compactions_succeeded,
            snapshots_written,
            recent_alerts,
            recent_pressure_events,
            recommendations,
        }
    }

    fn usage_from(&self, rss_mb: u64, virtual_mb: u64) -> MemoryUsage {
        MemoryUsage {
            rss_mb,
            virtual_mb,
            external_mb: virtual_mb.saturating_sub(rss_mb),
            usage_pct: rss_mb as f64 / self.settings.memory_budget_mb.max(1) as f64 * 100.0,
            at: Utc::now(),
        }
    }
}

fn growth_rate_mb_per_min<'a>(samples: impl Iterator<Item = &'a MemoryUsage>) -> f64 {
    let samples: Vec<&MemoryUsage> = samples.collect();
    let (first, last) = match (samples.first(), samples.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return 0.0,
    };
    let minutes = (last.at - first.at).num_milliseconds() as f64 / 60_000.0;
    if minutes <= 0.0 {
        return 0.0;
    }
    (last.rss_mb as f64 - first.rss_mb as f64) / minutes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn governor() -> MemoryGovernor {
        MemoryGovernor::new(GovernorSettings {
            memory_budget_mb: 100,
            leak_window: 10,
            ..Default::default()
        })
    }

    fn sample_at(governor: &MemoryGovernor, rss_mb: u64, at: DateTime<Utc>) {
        let usage = MemoryUsage {
            rss_mb,
            virtual_mb: rss_mb * 2,
            external_mb: rss_mb,
            usage_pct: rss_mb as f64 / governor.settings.memory_budget_mb as f64 * 100.0,
            at,
        };
        governor.push_sample(usage);
    }

    fn fill_window(governor: &MemoryGovernor, rss_values: &[u64]) {
        let start = Utc::now() - chrono::Duration::minutes(rss_values.len() as i64);
        for (i, rss) in rss_values.iter().enumerate() {
            sample_at(governor, *rss, start + chrono::Duration::minutes(i as i64));
        }
    }

    #[test]
    fn test_threshold_precedence_only_highest_fires() {
        let governor = governor();
        let usage = |pct: f64| MemoryUsage {
            rss_mb: pct as u64,
            virtual_mb: 0,
            external_mb: 0,
            usage_pct: pct,
            at: Utc::now(),
        };

        assert_eq!(governor.evaluate_level(&usage(50.0)), None);
        assert_eq!(
            governor.evaluate_level(&usage(80.0)),
            Some(PressureLevel::Warning)
        );
        assert_eq!(
            governor.evaluate_level(&usage(90.0)),
            Some(PressureLevel::Critical)
        );
        // Above emergency only the emergency path fires, never all three.
        assert_eq!(
            governor.evaluate_level(&usage(99.0)),
            Some(PressureLevel::Emergency)
        );
    }

    #[test]
    fn test_leak_detected_on_monotone_growth() {
        let governor = governor();
        // 2 MB per minute over 10 samples, strictly increasing.
        fill_window(&governor, &[10, 12, 14, 16, 18, 20, 22, 24, 26, 28]);

        let report = governor.detect_leak();
        assert!(report.detected);
        assert!(report.growth_rate_mb_per_min > 1.0);
        assert!(report.confidence >= 20.0);
    }

    #[test]
    fn test_no_leak_on_flat_window() {
        let governor = governor();
        fill_window(&governor, &[50; 10]);
        let report = governor.detect_leak();
        assert!(!report.detected);
    }

    #[test]
    fn test_no_leak_on_oscillating_window() {
        let governor = governor();
        // Same overall growth but a deep dip breaks monotonicity.
        fill_window(&governor, &[10, 30, 10, 30, 10, 30, 10, 30, 10, 40]);
        let report = governor.detect_leak();
        assert!(!report.detected);
    }

    #[test]
    fn test_no_leak_verdict_before_window_full() {
        let governor = governor();
        fill_window(&governor, &[10, 20, 30]);
        let report = governor.detect_leak();
        assert!(!report.detected);
        assert_eq!(report.samples, 3);
    }

    #[test]
    fn test_history_and_window_are_bounded() {
        let governor = MemoryGovernor::new(GovernorSettings {
            history_cap: 20,
            leak_window: 5,
            ..Default::default()
        });
        fill_window(&governor, &vec![10; 50]);
        let state = governor.state.lock().unwrap();
        assert_eq!(state.history.len(), 20);
        assert_eq!(state.leak_window.len(), 5);
    }

    #[test]
    fn test_trend_increasing() {
        let governor = governor();
        fill_window(&governor, &[10, 15, 20, 25, 30, 35, 40, 45, 50, 55]);
        assert_eq!(governor.trend(), MemoryTrend::Increasing);
    }

    #[test]
    fn test_trend_stable() {
        let governor = governor();
        fill_window(&governor, &[30; 10]);
        assert_eq!(governor.trend(), MemoryTrend::Stable);
    }

    struct FixedStrategy {
        name: &'static str,
        priority: u32,
        threshold: f64,
        freed: u64,
        runs: AtomicU64,
    }

    impl CleanupStrategy for FixedStrategy {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        fn threshold_pct(&self) -> f64 {
            self.threshold
        }
        fn run(&self) -> u64 {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.freed
        }
    }

    #[tokio::test]
    async fn test_handle_pressure_sums_strategy_estimates() {
        let governor = governor();
        governor.register_strategy(Arc::new(FixedStrategy {
            name: "a",
            priority: 10,
            threshold: 0.0,
            freed: 12,
            runs: AtomicU64::new(0),
        }));
        governor.register_strategy(Arc::new(FixedStrategy {
            name: "b",
            priority: 5,
            threshold: 0.0,
            freed: 8,
            runs: AtomicU64::new(0),
        }));

        let event = governor.handle_pressure(PressureLevel::Warning).await;
        assert_eq!(event.freed_mb, 20);
        assert_eq!(event.strategies_run, vec!["a", "b"]);
        assert!(!event.compaction_triggered);
    }

    #[tokio::test]
    async fn test_critical_pressure_attempts_compaction() {
        struct AlwaysCompacts;
        impl CompactionHook for AlwaysCompacts {
            fn trigger(&self) -> bool {
                true
            }
        }

        let governor = MemoryGovernor::with_compaction_hook(
            GovernorSettings::default(),
            Box::new(AlwaysCompacts),
        );
        let event = governor.handle_pressure(PressureLevel::Critical).await;
        assert!(event.compaction_triggered);

        let report = governor.get_health_report();
        assert_eq!(report.compaction_attempts, 1);
        assert_eq!(report.compactions_succeeded, 1);
    }

    #[tokio::test]
    async fn test_critical_with_diagnostics_writes_capped_snapshots() {
        let dir = tempfile::TempDir::new().unwrap();
        let governor = MemoryGovernor::new(GovernorSettings {
            diagnostics_enabled: true,
            snapshot_dir: dir.path().to_path_buf(),
            snapshot_retained: 2,
            ..Default::default()
        });

        for _ in 0..4 {
            governor.handle_pressure(PressureLevel::Critical).await;
            tokio::time::sleep(Duration::from_millis(3)).await;
        }

        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
        assert_eq!(governor.get_health_report().snapshots_written, 4);
    }

    #[test]
    fn test_manual_cleanup_ignores_thresholds() {
        let governor = governor();
        governor.register_strategy(Arc::new(FixedStrategy {
            name: "high-bar",
            priority: 1,
            threshold: 99.9,
            freed: 7,
            runs: AtomicU64::new(0),
        }));
        let freed = governor.trigger_cleanup("job:flaky");
        assert_eq!(freed, 7);
    }

    #[test]
    fn test_health_report_recommends_on_leak() {
        let governor = governor();
        fill_window(&governor, &[10, 15, 20, 25, 30, 35, 40, 45, 50, 55]);
        let report = governor.get_health_report();
        assert!(report.leak.detected);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("Sustained growth")));
    }
}
