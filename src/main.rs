//! devprof: offline analysis of collected device profiling sessions.
//!
//! Usage:
//!   devprof --report ./report.db --workers 8 ./sessions/run_*
//!   devprof --metric freq --metric task ./sessions/run_01
//!
//! Without `--config`, settings come from the file named by `DEVPROF_CONFIG`,
//! or defaults when that is unset or unreadable.
//!
//! Exit code 0 when every processor succeeded on every session, 1 when any
//! processor reported a failure, 2 on configuration errors.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devprof_analysis::{
    default_registry, run_all, AnalysisConfig, IdentityRegistry, JsonSessionCatalog, ProcessorContext,
    ReportDatabase,
};

#[derive(Parser, Debug)]
#[command(name = "devprof")]
#[command(about = "Normalize collected device profiling sessions into one report database")]
struct Args {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Report database path (overrides config)
    #[arg(long)]
    report: Option<PathBuf>,

    /// Worker threads (overrides config)
    #[arg(long)]
    workers: Option<usize>,

    /// Processor to run; repeatable. Default: all
    #[arg(long = "metric")]
    metrics: Vec<String>,

    /// Session directories
    #[arg(required = true)]
    sessions: Vec<PathBuf>,
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(args: &Args) -> Result<AnalysisConfig> {
    let mut config = match &args.config {
        Some(path) => AnalysisConfig::load(path)?,
        None => AnalysisConfig::from_env(),
    };
    if let Some(report) = &args.report {
        config.report_path = report.clone();
    }
    if let Some(workers) = args.workers {
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        config.worker_count = workers;
    }
    if !args.metrics.is_empty() {
        config.metrics = args.metrics.clone();
    }
    Ok(config)
}

fn build_context(config: AnalysisConfig) -> Result<ProcessorContext> {
    let report = ReportDatabase::open(&config.report_path)
        .with_context(|| format!("Failed to open report {}", config.report_path.display()))?;
    Ok(ProcessorContext::new(
        Arc::new(IdentityRegistry::new()),
        Arc::new(report),
        Arc::new(JsonSessionCatalog::new()),
        Arc::new(config),
    ))
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&AnalysisConfig::default().log_filter);
            error!("Configuration error: {:#}", e);
            return ExitCode::from(2);
        }
    };
    init_tracing(&config.log_filter);

    let registry = default_registry();
    if let Some(unknown) = config.metrics.iter().find(|m| registry.get(m).is_none()) {
        error!(metric = %unknown, available = ?registry.names(), "Unknown metric");
        return ExitCode::from(2);
    }

    let metrics = config.metrics.clone();
    let ctx = match build_context(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    info!(
        sessions = args.sessions.len(),
        workers = ctx.config.effective_workers(),
        report = %ctx.config.report_path.display(),
        "Starting analysis"
    );
    let started = Instant::now();
    let verdicts = run_all(&registry, &metrics, &ctx, &args.sessions);

    let mut all_ok = true;
    for (name, ok) in &verdicts {
        if *ok {
            info!(processor = %name, "Processor succeeded");
        } else {
            error!(processor = %name, "Processor reported failures");
            all_ok = false;
        }
    }
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        report = %ctx.report.summary(),
        "Analysis finished"
    );

    if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
