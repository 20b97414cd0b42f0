//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.

pub mod cli;
pub mod toml;
pub mod validator;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Complete broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
}

impl Config {
    /// Whether batches go through a work server instead of running in-process
    pub fn run_distributed(&self) -> bool {
        self.distribution.force_distributed || self.distribution.enabled
    }
}

/// Where the work server runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// Separate task inside the coordinator process (opt-in)
    InProcess,
    /// Separate OS process running `workbroker --mode session`
    Subprocess,
}

impl Default for ServerMode {
    fn default() -> Self {
        Self::Subprocess
    }
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess => write!(f, "in_process"),
            Self::Subprocess => write!(f, "subprocess"),
        }
    }
}

/// Work server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address, `tcp://<host>[:<port>]`
    #[serde(default = "default_address")]
    pub address: String,
    /// Fixed port (ephemeral when unset)
    pub port: Option<u16>,
    #[serde(default)]
    pub mode: ServerMode,
    /// How long to wait for the server to publish its address
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Binary to launch in subprocess mode (current executable when unset)
    pub server_program: Option<PathBuf>,
    /// Directory for scratch result files when the sink has no backing file
    pub scratch_dir: Option<PathBuf>,
}

fn default_address() -> String {
    "tcp://127.0.0.1".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: None,
            mode: ServerMode::default(),
            startup_timeout_secs: default_startup_timeout_secs(),
            server_program: None,
            scratch_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Worker loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline for writing one request
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Deadline for a reply (unbounded when unset)
    pub reply_timeout_ms: Option<u64>,
    /// Transport retries before a worker gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Execution failures in a row before a worker gives up
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Command to run per image set instead of the definition itself
    pub command: Option<String>,
    /// Workers started by standalone and worker modes
    #[serde(default = "default_local_workers")]
    pub local_workers: usize,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_local_workers() -> usize {
    num_cpus::get()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            reply_timeout_ms: None,
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            command: None,
            local_workers: default_local_workers(),
        }
    }
}

impl WorkerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.send_timeout_ms == 0 {
            return Err("send_timeout_ms must be greater than 0".to_string());
        }
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be greater than 0".to_string());
        }
        if self.reply_timeout_ms == Some(0) {
            return Err("reply_timeout_ms must be greater than 0 when set".to_string());
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(format!(
                "max_backoff_ms ({}) must not be less than initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err("max_consecutive_failures must be at least 1".to_string());
        }
        if self.local_workers == 0 {
            return Err("local_workers must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Distribution switches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributionConfig {
    /// Always use a work server, whatever `enabled` says
    #[serde(default)]
    pub force_distributed: bool,
    #[serde(default)]
    pub enabled: bool,
    /// Directory for packaged pipeline blobs (system temp dir when unset)
    pub blob_dir: Option<PathBuf>,
}
