//! workbroker CLI entry point

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use workbroker::config::cli::{Cli, ControlAction, ExecutionMode};
use workbroker::config::{toml::load_config, validator::validate_config, Config};
use workbroker::distributed::{session, Distributor, JobClient, StatusReply, GET_KEYS};
use workbroker::executor::{CommandExecutor, Executor};
use workbroker::worker::{run_local_workers, run_locally, WorkerSummary};

/// How long standalone mode waits for the server to exit after the workers finish
const SERVER_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli.validate()?;
    init_logging(cli.debug);

    // Session stdout carries only the handoff line
    if cli.mode != ExecutionMode::Session {
        println!("workbroker v{}", env!("CARGO_PKG_VERSION"));
        println!();
    }

    // Handle different execution modes
    match cli.mode {
        ExecutionMode::Standalone => run_standalone(cli),
        ExecutionMode::Coordinator => run_coordinator(cli),
        ExecutionMode::Worker => run_workers(cli),
        ExecutionMode::Control => run_control(cli),
        ExecutionMode::Session => run_session(),
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file, apply CLI overrides, validate
fn build_config(cli: &Cli) -> Result<Config> {
    let config = load_config(cli)?;
    validate_config(&config)
        .context("Configuration validation failed")?;
    Ok(config)
}

/// Pipeline definition, item count and output path for batch modes
fn batch_inputs(cli: &Cli) -> Result<(Vec<u8>, u64, PathBuf)> {
    let pipeline = cli.pipeline.as_ref()
        .context("--pipeline is required")?;
    let definition = std::fs::read(pipeline)
        .with_context(|| format!("Failed to read pipeline: {}", pipeline.display()))?;
    let items = cli.items.context("--items is required")?;
    let output = cli.output.clone().context("--output is required")?;
    Ok((definition, items, output))
}

/// Run in standalone mode (whole batch on this machine)
fn run_standalone(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;
    let (definition, items, output) = batch_inputs(&cli)?;
    print_configuration(&config, items, &output);

    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        let executor: Arc<dyn Executor> = Arc::new(CommandExecutor::new(config.worker.command.clone()));

        if !config.run_distributed() {
            let done = run_locally(&definition, items, executor.as_ref(), &output).await?;
            println!("Processed {} image sets into {}", done, output.display());
            return Ok(());
        }

        let mut distributor = Distributor::new(config.clone(), definition, items, &output);
        let url = distributor.start_serving(&config.server.address, config.server.port).await?;
        println!("Work server listening on {}", url);

        let workers = run_local_workers(&url, config.worker.local_workers, executor, &config.worker).await;

        if !distributor.wait_for_exit(SERVER_EXIT_TIMEOUT).await {
            tracing::warn!("Work server still running after workers finished");
        }
        if let Some(summary) = distributor.last_summary() {
            println!("Jobs finished: {}/{}", summary.jobs_finished, summary.total_jobs);
        }
        distributor.stop_serving(true).await;

        print_worker_summaries(&workers?);
        Ok(())
    })
}

/// Run in coordinator mode (serve a batch to remote workers)
fn run_coordinator(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;
    let (definition, items, output) = batch_inputs(&cli)?;
    print_configuration(&config, items, &output);

    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        let mut distributor = Distributor::new(config.clone(), definition, items, &output);
        let url = distributor.start_serving(&config.server.address, config.server.port).await?;

        println!("Serving {} jobs at {}", distributor.total_jobs(), url);
        println!("Start workers with: workbroker --mode worker --url {}", url);
        println!();

        let interrupted = tokio::select! {
            _ = distributor.wait_for_exit(Duration::MAX) => false,
            _ = tokio::signal::ctrl_c() => true,
        };

        if interrupted {
            println!("Interrupted, stopping work server");
        } else if let Some(summary) = distributor.last_summary() {
            println!("Jobs finished: {}/{}", summary.jobs_finished, summary.total_jobs);
        } else {
            println!("Work server exited");
        }
        distributor.stop_serving(true).await;
        Ok(())
    })
}

/// Run in worker mode (pull jobs from a coordinator)
fn run_workers(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;
    let url = cli.url.clone().context("--url is required")?;

    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        let executor: Arc<dyn Executor> = Arc::new(CommandExecutor::new(config.worker.command.clone()));
        println!("Starting {} workers against {}", config.worker.local_workers, url);

        let summaries = run_local_workers(&url, config.worker.local_workers, executor, &config.worker).await?;
        print_worker_summaries(&summaries);
        Ok(())
    })
}

/// Run in control mode (administrative command)
fn run_control(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;
    let url = cli.url.clone().context("--url is required")?;

    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        let mut client = JobClient::new(&url, &config.worker)?;

        match cli.action {
            ControlAction::Stop => match client.stop_server().await? {
                StatusReply::Stopping => println!("Work server stopping"),
                other => println!("Unexpected reply: {:?}", other),
            },
            ControlAction::Remove => {
                let id = cli.id.context("--id is required for --action remove")?;
                match client.remove_job(id).await? {
                    StatusReply::Success { .. } => println!("Removed job {}", id),
                    StatusReply::NotFound { id } => println!("Job {} not found", id),
                    other => println!("Unexpected reply: {:?}", other),
                }
            }
            ControlAction::Status => {
                let values = client.get(&GET_KEYS).await?;
                println!("Work server {}:", url);
                for (key, value) in values {
                    println!("  {}: {}", key, value);
                }
            }
        }
        Ok(())
    })
}

/// Run a work server session (spawned by a coordinator in subprocess mode)
fn run_session() -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        let summary = session::run_session().await?;
        tracing::info!(
            finished = summary.jobs_finished,
            total = summary.total_jobs,
            "Session finished"
        );
        Ok(())
    })
}

fn print_configuration(config: &Config, items: u64, output: &std::path::Path) {
    println!("Configuration:");
    println!("  Image sets: {}", items);
    println!("  Output: {}", output.display());
    if config.run_distributed() {
        println!("  Server: {} ({})", config.server.address, config.server.mode);
        if let Some(port) = config.server.port {
            println!("  Port: {}", port);
        }
        println!("  Local workers: {}", config.worker.local_workers);
    } else {
        println!("  Distribution: disabled");
    }
    if let Some(command) = &config.worker.command {
        println!("  Command: {}", command);
    }
    println!();
}

fn print_worker_summaries(summaries: &[WorkerSummary]) {
    let completed: u64 = summaries.iter().map(|s| s.jobs_completed).sum();
    let failed: u64 = summaries.iter().map(|s| s.jobs_failed).sum();
    let rejected: u64 = summaries.iter().map(|s| s.results_rejected).sum();

    println!();
    println!("Workers: {}", summaries.len());
    println!("  Jobs completed: {}", completed);
    if failed > 0 {
        println!("  Jobs failed: {}", failed);
    }
    if rejected > 0 {
        println!("  Results rejected: {}", rejected);
    }
}
