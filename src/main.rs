use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use taskwarden::config::{self, AppConfig, CliConfig, SyntheticSettings};
use taskwarden::memory::MemoryGovernor;
use taskwarden::metrics;
use taskwarden::report;
use taskwarden::supervisor::{create_supervisor, JobConfig, JobSchedule, SupervisorHandle};
use taskwarden::synthetic::{CrashAfterJob, FlakyJob, HogCacheStrategy, MemoryHogJob, SteadyJob};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    match path_buf.canonicalize() {
        Ok(path) => Ok(path),
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                Ok(path_buf)
            } else {
                Err(format!("Error resolving path '{}': {}", s, msg))
            }
        }
    }
}

#[derive(Parser, Debug)]
#[clap(about = "Background task supervisor with memory governance")]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory resilience report artifacts are written to.
    #[clap(long, default_value = "reports")]
    pub report_dir: PathBuf,

    /// Memory budget of the process in megabytes; pressure thresholds are
    /// percentages of this.
    #[clap(long, default_value_t = 512)]
    pub memory_budget_mb: u64,

    /// Interval between memory samples in seconds.
    #[clap(long, default_value_t = 30)]
    pub sample_interval_secs: u64,

    /// Capture diagnostic memory snapshots under critical pressure.
    #[clap(long)]
    pub diagnostics: bool,

    /// Directory diagnostic memory snapshots are written to.
    #[clap(long, default_value = "memory-snapshots")]
    pub snapshot_dir: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor with the synthetic job set until interrupted.
    Run,
    /// Print current job health and metrics after a short spin-up.
    Status,
    /// Run the synthetic resilience validation scenario and print a summary.
    Test,
    /// Run a high-churn synthetic load for the given duration, then report.
    Stress {
        #[clap(long, default_value_t = 30_000)]
        duration_ms: u64,
    },
    /// Run briefly and write the aggregated resilience report artifact.
    Report,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            report_dir: args.report_dir.clone(),
            memory_budget_mb: args.memory_budget_mb,
            sample_interval_secs: args.sample_interval_secs,
            diagnostics: args.diagnostics,
            snapshot_dir: args.snapshot_dir.clone(),
        }
    }
}

struct Harness {
    handle: SupervisorHandle,
    governor: Arc<MemoryGovernor>,
    shutdown: CancellationToken,
    supervisor_task: JoinHandle<()>,
}

impl Harness {
    async fn shut_down(self) {
        let _ = self.handle.stop_all().await;
        self.governor.stop_monitoring();
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.supervisor_task).await;
    }
}

/// Wire governor + supervisor and register the synthetic job set mirroring
/// the production jobs: post expiry, notification dispatch, content
/// analysis, digest export.
async fn spawn_harness(config: &AppConfig) -> Result<Harness> {
    let governor = Arc::new(MemoryGovernor::new(config.governor.clone()));
    let shutdown = CancellationToken::new();
    let (mut supervisor, handle) = create_supervisor(
        config.supervisor.clone(),
        Arc::clone(&governor),
        shutdown.clone(),
    );

    let syn = &config.synthetic;

    let mut post_expiry = JobConfig::new("post_expiry");
    post_expiry.schedule = JobSchedule::Interval(syn.flaky_interval);
    post_expiry.priority = 1;
    post_expiry.max_retries = 2;
    post_expiry.error_threshold = 3;
    post_expiry.restart_delay = Duration::from_millis(200);
    post_expiry.health_check_interval = Duration::from_secs(2);
    supervisor
        .register(
            post_expiry,
            Arc::new(SteadyJob::new("post_expiry", Duration::from_millis(10))),
        )
        .await?;

    let mut dispatch = JobConfig::new("notification_dispatch");
    dispatch.schedule = JobSchedule::Interval(syn.flaky_interval);
    dispatch.priority = 2;
    dispatch.depends_on = vec!["post_expiry".to_string()];
    dispatch.max_retries = 2;
    dispatch.retry_delay = Duration::from_millis(50);
    dispatch.error_threshold = 4;
    dispatch.restart_delay = Duration::from_millis(200);
    dispatch.health_check_interval = Duration::from_secs(2);
    supervisor
        .register(
            dispatch,
            Arc::new(FlakyJob::new(
                "notification_dispatch",
                syn.flaky_failure_rate,
                Duration::from_millis(20),
            )),
        )
        .await?;

    let hog = Arc::new(MemoryHogJob::new(
        "content_analysis",
        syn.hog_growth_mb_per_run,
    ));
    governor.register_strategy(Arc::new(HogCacheStrategy::new(Arc::clone(&hog))));
    let mut analysis = JobConfig::new("content_analysis");
    analysis.schedule = JobSchedule::Interval(syn.hog_interval);
    analysis.priority = 5;
    analysis.memory_threshold_mb = (syn.hog_growth_mb_per_run * 4).max(16);
    analysis.error_threshold = 3;
    analysis.restart_delay = Duration::from_millis(200);
    analysis.health_check_interval = Duration::from_secs(2);
    supervisor.register(analysis, hog).await?;

    let mut export = JobConfig::new("digest_export");
    export.schedule = JobSchedule::Interval(syn.crash_interval);
    export.priority = 8;
    export.max_retries = 0;
    export.error_threshold = 2;
    export.restart_delay = Duration::from_millis(100);
    export.health_check_interval = Duration::from_secs(2);
    supervisor
        .register(
            export,
            Arc::new(CrashAfterJob::new(
                "digest_export",
                syn.crash_after_executions,
            )),
        )
        .await?;

    MemoryGovernor::start_monitoring(&governor);
    info!(
        "Supervisor initialized with {} job(s)",
        supervisor.job_count().await
    );
    let supervisor_task = tokio::spawn(async move { supervisor.run().await });

    Ok(Harness {
        handle,
        governor,
        shutdown,
        supervisor_task,
    })
}

async fn print_status(handle: &SupervisorHandle) -> Result<()> {
    let jobs = handle.list_jobs().await;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

async fn run_command(config: &AppConfig) -> Result<()> {
    let harness = spawn_harness(config).await?;
    let phases = harness.handle.start_all().await?;
    for phase in &phases {
        info!(
            "Phase {} ({:?}) ready: {}",
            phase.index, phase.jobs, phase.ready
        );
    }

    info!("Supervisor running; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating graceful shutdown");
    harness.shut_down().await;
    Ok(())
}

async fn status_command(config: &AppConfig) -> Result<()> {
    let harness = spawn_harness(config).await?;
    harness.handle.start_all().await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    print_status(&harness.handle).await?;
    harness.shut_down().await;
    Ok(())
}

async fn validation_run(config: &AppConfig, duration: Duration) -> Result<()> {
    // Validation runs should not sit out a full production phase timeout
    // when an induced failure lands on a job's very first execution.
    let mut config = config.clone();
    config.supervisor.phase_timeout = config.supervisor.phase_timeout.min(Duration::from_secs(5));
    let config = &config;

    let harness = spawn_harness(config).await?;
    let started = std::time::Instant::now();

    let phases = harness.handle.start_all().await?;
    for phase in &phases {
        println!(
            "phase {}: {:?} ready={}",
            phase.index, phase.jobs, phase.ready
        );
    }

    while started.elapsed() < duration {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let resilience = report::build_report(&harness.handle, &harness.governor).await;
    println!();
    println!("overall: {}", resilience.overall_status);
    for (status, count) in &resilience.status_counts {
        println!("  {}: {}", status, count);
    }
    println!("recovery actions: {}", resilience.recovery_actions.len());
    for action in resilience.recovery_actions.iter().take(10) {
        println!(
            "  [{}] {} on {} success={} ({})",
            action.at, action.action, action.job, action.success, action.reason
        );
    }
    println!(
        "memory: {} MB resident ({:.1}% of budget), trend {}",
        resilience.memory.rss_mb, resilience.memory.usage_pct, resilience.memory.trend
    );
    for recommendation in &resilience.recommendations {
        println!("  note: {}", recommendation);
    }

    let artifact = report::write_artifact(&resilience, &config.report_dir)?;
    println!("report written to {:?}", artifact);

    harness.shut_down().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    let cli_config: CliConfig = (&cli_args).into();
    let mut app_config = AppConfig::resolve(&cli_config, file_config)?;

    metrics::init_metrics();

    match cli_args.command {
        Command::Run => run_command(&app_config).await,
        Command::Status => status_command(&app_config).await,
        Command::Test => validation_run(&app_config, Duration::from_secs(8)).await,
        Command::Stress { duration_ms } => {
            // Higher churn: more failures, tighter schedules.
            let base = app_config.synthetic.clone();
            app_config.synthetic = SyntheticSettings {
                flaky_failure_rate: (base.flaky_failure_rate * 2.0).min(0.6),
                flaky_interval: base.flaky_interval / 4,
                hog_growth_mb_per_run: base.hog_growth_mb_per_run * 2,
                hog_interval: base.hog_interval / 4,
                crash_after_executions: base.crash_after_executions,
                crash_interval: base.crash_interval / 4,
            };
            validation_run(&app_config, Duration::from_millis(duration_ms)).await
        }
        Command::Report => validation_run(&app_config, Duration::from_secs(3)).await,
    }
    .inspect_err(|e| error!("Command failed: {:#}", e))
}
