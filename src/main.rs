//! duckport - Multi-Backend Tabular Export Engine
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use duckport::backend::BackendRegistry;
use duckport::config::{load_file, CliArgs, Command, ExportConfig, RunSettings};
use duckport::engine::SessionPool;
use duckport::error::{ConfigError, ExportError};
use duckport::export::{run_exports, ExportJob};
use duckport::progress::{
    print_capabilities, print_header, print_plan, print_summary, ProgressReporter,
};
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = CliArgs::parse();
    setup_logging(args.verbose)?;

    match args.command.clone() {
        Command::Run { .. } => {
            let settings = RunSettings::from_args(args)
                .map_err(ExportError::from)
                .context("Invalid arguments")?;
            run_command(settings)
        }
        Command::Check { config } => check_command(&config),
        Command::Backends => {
            let registry = BackendRegistry::probe();
            print_capabilities(registry.capabilities());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run every configured export and report the outcome
fn run_command(settings: RunSettings) -> Result<ExitCode> {
    let registry = Arc::new(BackendRegistry::probe());
    let pool = SessionPool::new();

    // Setup signal handler for graceful shutdown
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, stopping exports...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let progress = settings.show_progress.then(ProgressReporter::new);

    let mut jobs = Vec::with_capacity(settings.configs.len());
    for path in &settings.configs {
        let config = load_config(path)?
            .with_overrides(&settings.overrides)
            .map_err(ExportError::from)
            .with_context(|| format!("Invalid overrides for {}", path.display()))?;
        let session = pool
            .get(config.database.as_deref())
            .map_err(ExportError::from)
            .with_context(|| format!("Cannot open database for {}", path.display()))?;

        let mut job = ExportJob::new(config, session, Arc::clone(&registry), Arc::clone(&cancel));
        if let Some(ref p) = progress {
            job = job.with_progress(p.row_callback(path.display().to_string()));
        }
        jobs.push(job);
    }

    if settings.show_progress {
        let names: Vec<&str> = registry
            .capabilities()
            .iter()
            .filter(|c| c.available)
            .map(|c| c.name)
            .collect();
        print_header(jobs.len(), settings.parallelism, &names);
    }
    if let Some(ref p) = progress {
        p.set_status("Running exports...");
    }

    let started = Instant::now();
    let results = run_exports(jobs, settings.parallelism);

    if let Some(ref p) = progress {
        if cancel.load(Ordering::SeqCst) {
            p.finish("Exports interrupted");
        } else {
            p.finish_and_clear();
        }
    }

    let outcomes: Vec<(&Path, std::result::Result<_, _>)> = settings
        .configs
        .iter()
        .zip(&results)
        .map(|(path, result)| (path.as_path(), result.as_ref()))
        .collect();

    if settings.show_progress {
        print_summary(&outcomes, started.elapsed());
    }

    let mut code = None;
    for (path, outcome) in &outcomes {
        match outcome {
            Ok(stats) => info!(
                config = %path.display(),
                rows = stats.rows,
                backend = stats.backend,
                "Export written to {}",
                stats.output_path.display()
            ),
            Err(e) => {
                if !settings.show_progress {
                    eprintln!("Error: {}: {}", path.display(), e);
                }
                code.get_or_insert(e.exit_code());
            }
        }
    }

    Ok(code.map_or(ExitCode::SUCCESS, ExitCode::from))
}

/// Query, coerce and select without writing
fn check_command(path: &Path) -> Result<ExitCode> {
    let registry = Arc::new(BackendRegistry::probe());
    let config = load_config(path)?;
    let session = SessionPool::new()
        .get(config.database.as_deref())
        .map_err(ExportError::from)
        .context("Cannot open database")?;

    let job = ExportJob::new(config, session, registry, Arc::new(AtomicBool::new(false)));
    let plan = job
        .plan()
        .with_context(|| format!("Check failed for {}", path.display()))?;
    print_plan(path, &plan);
    Ok(ExitCode::SUCCESS)
}

fn load_config(path: &Path) -> Result<ExportConfig> {
    let loaded = load_file(path)
        .map_err(ExportError::from)
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    for key in &loaded.unknown_keys {
        warn!(config = %path.display(), "Ignoring unknown key '{}'", key);
    }
    Ok(loaded.config)
}

/// Exit code of the first export error in the chain
fn exit_code(e: &anyhow::Error) -> u8 {
    e.chain()
        .find_map(|cause| {
            cause
                .downcast_ref::<ExportError>()
                .map(ExportError::exit_code)
                .or_else(|| cause.downcast_ref::<ConfigError>().map(|_| 2))
        })
        .unwrap_or(1)
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("duckport=debug,warn")
    } else {
        EnvFilter::new("duckport=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
