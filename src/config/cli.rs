//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Standalone mode (default) - run a whole batch on this machine
    Standalone,
    /// Coordinator mode - serve a batch to remote workers
    Coordinator,
    /// Worker mode - pull jobs from a coordinator
    Worker,
    /// Control mode - send an administrative command to a coordinator
    Control,
    /// Work server session spawned by a coordinator
    #[value(hide = true)]
    Session,
}

/// Administrative action for control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ControlAction {
    /// Stop the work server after it replies
    Stop,
    /// Drop one job without a result
    Remove,
    /// Print remaining jobs and the pipeline identity
    Status,
}

/// Work server placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServerModeArg {
    InProcess,
    Subprocess,
}

/// workbroker - distribute batch jobs to workers
#[derive(Parser, Debug)]
#[command(name = "workbroker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: standalone, coordinator, worker, or control
    #[arg(long, value_enum, default_value = "standalone")]
    pub mode: ExecutionMode,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Bind address for the work server (e.g., tcp://0.0.0.0)
    #[arg(long)]
    pub address: Option<String>,

    /// Fixed port for the work server (ephemeral when omitted)
    #[arg(long)]
    pub port: Option<u16>,

    /// Work server URL for worker and control modes (e.g., tcp://10.0.1.10:5555)
    #[arg(long)]
    pub url: Option<String>,

    /// Pipeline definition file
    #[arg(short = 'p', long)]
    pub pipeline: Option<PathBuf>,

    /// Number of image sets in the batch
    #[arg(short = 'n', long)]
    pub items: Option<u64>,

    /// Aggregate measurement store
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Number of local worker loops
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Command to run per image set instead of the pipeline script
    #[arg(long)]
    pub command: Option<String>,

    /// Where the work server runs
    #[arg(long, value_enum)]
    pub server_mode: Option<ServerModeArg>,

    /// Control mode action
    #[arg(long, value_enum, default_value = "status")]
    pub action: ControlAction,

    /// Job id for `--action remove`
    #[arg(long)]
    pub id: Option<u64>,

    /// Use a work server even when distribution is disabled
    #[arg(long)]
    pub force_distributed: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.mode {
            // Session input arrives on stdin
            ExecutionMode::Session => return Ok(()),
            ExecutionMode::Standalone | ExecutionMode::Coordinator => {
                if self.pipeline.is_none() {
                    anyhow::bail!("--pipeline is required in {:?} mode", self.mode);
                }
                if self.items.is_none() {
                    anyhow::bail!("--items is required in {:?} mode", self.mode);
                }
                if self.output.is_none() {
                    anyhow::bail!("--output is required in {:?} mode", self.mode);
                }
            }
            ExecutionMode::Worker => {
                if self.url.is_none() {
                    anyhow::bail!("--url is required in worker mode");
                }
            }
            ExecutionMode::Control => {
                if self.url.is_none() {
                    anyhow::bail!("--url is required in control mode");
                }
                if self.action == ControlAction::Remove && self.id.is_none() {
                    anyhow::bail!("--id is required for --action remove");
                }
            }
        }

        if self.workers == Some(0) {
            anyhow::bail!("workers must be at least 1");
        }

        Ok(())
    }
}
