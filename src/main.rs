//! flashloop entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flashloop::api::{create_router, AppState};
use flashloop::config::{Config, VERBOSE_LOG_FILTER};
use flashloop::control::{ControlLoop, RecordStore};
use flashloop::ledger::Ledger;
use flashloop::metrics;
use flashloop::monitor::{CostMonitor, CostMonitorConfig};
use flashloop::parity::{load_corpus, standard_corpus, verify_optimized, ParityCase, ParityReport};
use flashloop::rollout::{RollbackReason, RolloutController};
use flashloop::service::ExecutionService;
use flashloop::utils::shutdown_signal;

/// Atomic flash-loan arbitrage engine.
#[derive(Parser, Debug)]
#[command(name = "flashloop")]
#[command(about = "Atomic flash-loan arbitrage engine with parity-gated progressive rollout")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the parity gate, then serve the execution API (default).
    Serve {
        /// HTTP server port (overrides PORT).
        #[arg(short, long)]
        port: Option<u16>,

        /// Acknowledge the persisted rollback so a passing parity run can
        /// re-approve the optimized engine.
        #[arg(long)]
        clear_rollback: bool,
    },

    /// Run the parity corpus against both engines.
    Parity {
        /// Seed for fuzz case generation.
        #[arg(long, default_value_t = 0x5eed)]
        seed: u64,

        /// Number of fuzz cases added to the boundary corpus.
        #[arg(long, default_value_t = 256)]
        fuzz_cases: usize,

        /// Additional JSON corpus file.
        #[arg(long)]
        corpus: Option<PathBuf>,

        /// Write the structured report to this file.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show persisted rollout state and cost summaries.
    Status {
        /// Data directory holding the record logs.
        #[arg(long, env = "DATA_DIR", default_value = "data")]
        data_dir: PathBuf,
    },

    /// Check configuration validity.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let filter = match Config::load() {
        _ if args.verbose => EnvFilter::new(VERBOSE_LOG_FILTER),
        Ok(config) => EnvFilter::new(config.log_filter()),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    // Handle subcommands
    match args.command {
        Some(Command::Serve {
            port,
            clear_rollback,
        }) => cmd_serve(port, clear_rollback).await,
        Some(Command::Parity {
            seed,
            fuzz_cases,
            corpus,
            report,
        }) => cmd_parity(seed, fuzz_cases, corpus, report),
        Some(Command::Status { data_dir }) => cmd_status(data_dir),
        Some(Command::CheckConfig) => cmd_check_config(),
        None => cmd_serve(None, false).await,
    }
}

/// Check configuration validity.
fn cmd_check_config() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("FLASHLOOP - CONFIGURATION CHECK");
    println!("======================================================================");

    // Load configuration
    print!("Loading configuration... ");
    let config = match Config::load() {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration load failed"));
        }
    };

    // Validate configuration
    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    // Load world state
    print!("Loading world state from {}... ", config.world_state_path);
    match Ledger::load(&config.world_state_path) {
        Ok(ledger) => println!(
            "OK ({} accounts, {} venues)",
            ledger.balances().len(),
            ledger.venues().len()
        ),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("World state load failed"));
        }
    }

    println!();
    println!("Engine owner:      {}", config.engine_owner);
    println!("Engine account:    {}", config.engine_account);
    println!("Loan provider:     {}", config.loan_provider_account);
    println!("Loan premium:      {} bps", config.loan_premium_bps);
    println!("Rollout ladder:    {:?}", config.rollout_ladder);
    println!("Rollback below:    {}", config.rollback_threshold);
    println!("Shadow verify:     {}", config.shadow_verify);
    println!("Data directory:    {}", config.data_dir);
    Ok(())
}

fn build_corpus(
    seed: u64,
    fuzz_cases: usize,
    extra: Option<&PathBuf>,
) -> anyhow::Result<Vec<ParityCase>> {
    let mut cases = standard_corpus(seed, fuzz_cases);
    if let Some(path) = extra {
        let loaded = load_corpus(path)?;
        info!(path = %path.display(), cases = loaded.len(), "Loaded parity corpus");
        cases.extend(loaded);
    }
    Ok(cases)
}

fn print_report(report: &ParityReport) {
    println!(
        "Parity: {}/{} cases passed, {} divergences, {} class mismatches",
        report.cases_passed,
        report.cases_run,
        report.divergences.len(),
        report.class_mismatches.len()
    );
    println!(
        "Cost: reference {} / optimized {} units{}",
        report.reference_cost_total(),
        report.optimized_cost_total(),
        report
            .cost_savings()
            .map(|savings| format!(" ({}% saved)", (savings * Decimal::ONE_HUNDRED).round_dp(2)))
            .unwrap_or_default()
    );
    for divergence in &report.divergences {
        println!(
            "  DIVERGENCE {} {}: reference={} candidate={}",
            divergence.case_id, divergence.field, divergence.reference, divergence.candidate
        );
    }
    for mismatch in &report.class_mismatches {
        println!(
            "  CLASS {}: expected {:?}, reference {:?}, optimized {:?}",
            mismatch.case_id, mismatch.expected, mismatch.reference, mismatch.candidate
        );
    }
}

/// Run the parity corpus and exit non-zero on any divergence.
fn cmd_parity(
    seed: u64,
    fuzz_cases: usize,
    corpus: Option<PathBuf>,
    report_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let cases = build_corpus(seed, fuzz_cases, corpus.as_ref())?;
    let report = verify_optimized(&cases);
    print_report(&report);

    if let Some(path) = report_path {
        report.write_json(&path)?;
        info!(path = %path.display(), "Parity report written");
    }

    if report.passed() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Parity check failed"))
    }
}

/// Print persisted rollout state and cost summaries rebuilt from the logs.
fn cmd_status(data_dir: PathBuf) -> anyhow::Result<()> {
    let store = RecordStore::open(&data_dir)?;

    match store.load_rollout_state()? {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => println!("No rollout state in {}", data_dir.display()),
    }

    let mut monitor = CostMonitor::new(CostMonitorConfig::default());
    let samples = store.gas_samples()?;
    for sample in &samples {
        monitor.record(sample);
    }
    let executions = store.execution_records()?;
    println!("{} gas samples, {} execution records", samples.len(), executions.len());

    for summary in monitor.summaries() {
        match summary.percentiles {
            Some(p) => println!(
                "  {} [{}] n={} p50={} p90={} p95={} p99={} success={}",
                summary.scenario_tag,
                summary.implementation_tag,
                summary.samples,
                p.p50,
                p.p90,
                p.p95,
                p.p99,
                summary
                    .success_rate
                    .map(|rate| rate.round_dp(3).to_string())
                    .unwrap_or_else(|| "-".to_string())
            ),
            None => println!(
                "  {} [{}] no samples",
                summary.scenario_tag, summary.implementation_tag
            ),
        }
    }
    Ok(())
}

fn install_prometheus() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    }
}

/// Run the parity gate, then serve plans until shutdown.
async fn cmd_serve(port_override: Option<u16>, clear_rollback: bool) -> anyhow::Result<()> {
    // Load configuration
    info!("Loading configuration...");
    let config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(anyhow::anyhow!("Configuration validation failed: {}", e));
    }

    // Initialize metrics
    let prometheus = install_prometheus();
    metrics::init_metrics();

    let ledger = Ledger::load(&config.world_state_path)?;
    info!(
        path = %config.world_state_path,
        accounts = ledger.balances().len(),
        venues = ledger.venues().len(),
        "World state loaded"
    );

    let store = RecordStore::open(&config.data_dir)?;
    let now = OffsetDateTime::now_utc();
    let mut controller = match store.load_rollout_state()? {
        Some(state) => {
            info!(
                traffic_percentage = state.traffic_percentage,
                status = %state.status,
                "Restoring rollout state"
            );
            RolloutController::restore(config.rollout_config(), state)?
        }
        None => RolloutController::new(config.rollout_config(), now)?,
    };
    if clear_rollback {
        match controller.clear_rollback(now) {
            Some(reason) => info!(reason = ?reason, "Persisted rollback cleared"),
            None => warn!("--clear-rollback given but there is no inactive rollback to clear"),
        }
    }

    // Parity gate
    let cases = build_corpus(
        config.parity_seed,
        config.parity_fuzz_cases,
        config.parity_corpus_path.as_ref().map(PathBuf::from).as_ref(),
    )?;
    let report = verify_optimized(&cases);
    report.write_json(store.dir().join("parity_report.json"))?;

    if report.passed() {
        if !controller.state().is_active() {
            if let Err(err) = controller.approve(&report, now) {
                warn!(error = %err, "Optimized engine receives no traffic");
            }
        }
    } else {
        warn!(
            divergences = report.divergences.len(),
            class_mismatches = report.class_mismatches.len(),
            "Parity gate failed, optimized engine receives no traffic"
        );
        controller.halt(
            RollbackReason::ParityGateFailed {
                divergences: report.divergences.len(),
                mismatches: report.class_mismatches.len(),
            },
            now,
        );
    }
    store.write_rollout_state(controller.state())?;

    // Control loop
    let (control, handle) = ControlLoop::new(
        CostMonitor::new(config.monitor_config()),
        controller,
        Some(store.clone()),
        config.event_queue_capacity,
    );
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let control_task = tokio::spawn(control.run(async {
        let _ = stop_rx.await;
    }));

    // Execution service
    let service = ExecutionService::new(
        config.engine_config(),
        ledger,
        Arc::new(config.loan_provider()),
        handle,
    )
    .with_shadow_verify(config.shadow_verify);

    let mut app_state = AppState::new(Arc::new(service));
    if let Some(handle) = prometheus {
        app_state = app_state.with_prometheus(handle);
    }
    app_state.set_ready(true);

    // Start HTTP server
    let port = port_override.unwrap_or(config.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, create_router(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush the control loop
    let _ = stop_tx.send(());
    let control = control_task.await?;
    store.write_rollout_state(control.rollout_state())?;
    info!(
        traffic_percentage = control.rollout_state().traffic_percentage,
        dropped_events = control.dropped(),
        "Shutdown complete"
    );
    Ok(())
}
