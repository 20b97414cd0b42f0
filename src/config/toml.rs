//! TOML configuration file parsing

use super::*;
use crate::config::cli::{Cli, ServerModeArg};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Load the file named by `--config`, or defaults, then apply CLI overrides
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => Config::default(),
    };
    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    if let Some(address) = &cli.address {
        config.server.address = address.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = Some(port);
    }
    if let Some(mode) = cli.server_mode {
        config.server.mode = match mode {
            ServerModeArg::InProcess => ServerMode::InProcess,
            ServerModeArg::Subprocess => ServerMode::Subprocess,
        };
    }

    if let Some(workers) = cli.workers {
        config.worker.local_workers = workers;
    }
    if let Some(command) = &cli.command {
        config.worker.command = Some(command.clone());
    }

    if cli.force_distributed {
        config.distribution.force_distributed = true;
    }

    Ok(config)
}
