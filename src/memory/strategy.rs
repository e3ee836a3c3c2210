use std::sync::Arc;
use tracing::{debug, warn};

/// A registered cleanup action that frees an estimated amount of memory.
///
/// Strategies are concrete implementations behind this trait rather than
/// captured closures, so the governor never holds hidden references into
/// unrelated subsystems.
pub trait CleanupStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Higher priority runs earlier.
    fn priority(&self) -> u32;

    /// The strategy is only eligible once usage reaches this percentage.
    fn threshold_pct(&self) -> f64;

    fn enabled(&self) -> bool {
        true
    }

    /// Perform the cleanup. Returns an estimate of the megabytes freed.
    fn run(&self) -> u64;
}

/// Priority-ordered registry of cleanup strategies.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn CleanupStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Arc<dyn CleanupStrategy>) {
        debug!(
            "Registering cleanup strategy '{}' (priority {}, threshold {}%)",
            strategy.name(),
            strategy.priority(),
            strategy.threshold_pct()
        );
        self.strategies.push(strategy);
        self.strategies
            .sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Run every enabled strategy whose threshold is at or below the current
    /// usage percentage, in descending priority order. Returns the names run
    /// and the total megabytes freed.
    pub fn execute_eligible(&self, usage_pct: f64) -> (Vec<String>, u64) {
        self.execute_where(|strategy| strategy.threshold_pct() <= usage_pct)
    }

    /// Run every enabled strategy regardless of threshold, in descending
    /// priority order. Used for manually triggered cleanup.
    pub fn execute_all(&self) -> (Vec<String>, u64) {
        self.execute_where(|_| true)
    }

    fn execute_where(&self, eligible: impl Fn(&dyn CleanupStrategy) -> bool) -> (Vec<String>, u64) {
        let mut ran = Vec::new();
        let mut freed_mb = 0u64;
        for strategy in &self.strategies {
            if !strategy.enabled() || !eligible(strategy.as_ref()) {
                continue;
            }
            let freed = strategy.run();
            debug!("Cleanup strategy '{}' freed ~{} MB", strategy.name(), freed);
            freed_mb += freed;
            ran.push(strategy.name().to_string());
        }
        if ran.is_empty() {
            warn!("No eligible cleanup strategies ran");
        }
        (ran, freed_mb)
    }
}

/// Hook for a runtime-exposed manual compaction trigger. The default build
/// has none, so the default implementation is a no-op that reports false.
pub trait CompactionHook: Send + Sync {
    /// Attempt compaction; returns whether anything was actually triggered.
    fn trigger(&self) -> bool;
}

pub struct NoopCompaction;

impl CompactionHook for NoopCompaction {
    fn trigger(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingStrategy {
        name: &'static str,
        priority: u32,
        threshold: f64,
        enabled: bool,
        freed: u64,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl CleanupStrategy for RecordingStrategy {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        fn threshold_pct(&self) -> f64 {
            self.threshold
        }
        fn enabled(&self) -> bool {
            self.enabled
        }
        fn run(&self) -> u64 {
            self.order.lock().unwrap().push(self.name);
            self.freed
        }
    }

    fn registry_with(
        order: &Arc<Mutex<Vec<&'static str>>>,
        specs: &[(&'static str, u32, f64, bool, u64)],
    ) -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        for (name, priority, threshold, enabled, freed) in specs {
            registry.register(Arc::new(RecordingStrategy {
                name,
                priority: *priority,
                threshold: *threshold,
                enabled: *enabled,
                freed: *freed,
                order: Arc::clone(order),
            }));
        }
        registry
    }

    #[test]
    fn test_eligible_strategies_run_in_descending_priority() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(
            &order,
            &[
                ("mid", 8, 85.0, true, 20),
                ("high", 10, 80.0, true, 10),
                ("low", 6, 90.0, true, 5),
            ],
        );

        let (ran, freed) = registry.execute_eligible(92.0);
        assert_eq!(ran, vec!["high", "mid", "low"]);
        assert_eq!(freed, 35);
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_threshold_filters_strategies() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(
            &order,
            &[
                ("high", 10, 80.0, true, 10),
                ("mid", 8, 85.0, true, 20),
                ("low", 6, 90.0, true, 5),
            ],
        );

        let (ran, freed) = registry.execute_eligible(86.0);
        assert_eq!(ran, vec!["high", "mid"]);
        assert_eq!(freed, 30);
    }

    #[test]
    fn test_disabled_strategies_are_skipped() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(
            &order,
            &[
                ("on", 10, 0.0, true, 10),
                ("off", 20, 0.0, false, 100),
            ],
        );

        let (ran, freed) = registry.execute_all();
        assert_eq!(ran, vec!["on"]);
        assert_eq!(freed, 10);
    }

    #[test]
    fn test_noop_compaction_reports_false() {
        assert!(!NoopCompaction.trigger());
    }

    #[test]
    fn test_registry_counts() {
        struct Counting(AtomicUsize);
        impl CleanupStrategy for Counting {
            fn name(&self) -> &str {
                "counting"
            }
            fn priority(&self) -> u32 {
                1
            }
            fn threshold_pct(&self) -> f64 {
                0.0
            }
            fn run(&self) -> u64 {
                self.0.fetch_add(1, Ordering::SeqCst);
                0
            }
        }

        let mut registry = StrategyRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(Counting(AtomicUsize::new(0))));
        assert_eq!(registry.len(), 1);
    }
}
