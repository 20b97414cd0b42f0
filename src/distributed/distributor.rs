//! Distributor (coordinator side)
//!
//! Turns a batch (N image sets, a pipeline definition, an output store) into a
//! reachable work server and owns that server's lifecycle:
//!
//! 1. `prepare()` packages the definition and builds one job per image set
//! 2. `start_serving()` spawns the server and waits for its startup handoff
//! 3. `wait_for_exit()` / `stop_serving()` end it
//!
//! The server runs as a child process (`workbroker --mode session`) by default,
//! or as a separate tokio task when configured `in_process`. Either way it owns the queue and the aggregate
//! store outright; the distributor only holds a handle it can wait on or kill.

use crate::config::{Config, ServerMode};
use crate::distributed::session::{parse_handoff, Handoff, ServeSession};
use crate::distributed::transport::Endpoint;
use crate::distributed::work_server::{ServerStartup, ServerSummary, WorkServer};
use crate::error::BrokerError;
use crate::pipeline::{self, Packager, PipelineBlob, PipelineInfo, ZlibPackager};
use crate::queue::WorkQueue;
use crate::store::MeasurementStore;
use crate::Result;
use anyhow::Context;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A live work server
enum ServerHandle {
    Task(JoinHandle<Result<ServerSummary>>),
    Process(Child),
}

impl ServerHandle {
    fn is_running(&mut self) -> bool {
        match self {
            Self::Task(handle) => !handle.is_finished(),
            Self::Process(child) => matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Wait for the server to exit on its own
    async fn wait(&mut self) -> Option<ServerSummary> {
        match self {
            Self::Task(handle) => match handle.await {
                Ok(Ok(summary)) => Some(summary),
                Ok(Err(e)) => {
                    tracing::error!(error = %format!("{:#}", e), "Work server failed");
                    None
                }
                Err(e) => {
                    tracing::error!(error = %e, "Work server task ended abnormally");
                    None
                }
            },
            Self::Process(child) => {
                match child.wait().await {
                    Ok(status) if status.success() => {
                        tracing::debug!(%status, "Work server process exited");
                    }
                    Ok(status) => tracing::warn!(%status, "Work server process exited"),
                    Err(e) => tracing::error!(error = %e, "Failed to wait for work server process"),
                }
                None
            }
        }
    }

    /// Hard-stop the server
    async fn kill(&mut self) {
        match self {
            Self::Task(handle) => {
                handle.abort();
                // Cancelled or finished, either way it no longer runs
                let _ = handle.await;
            }
            Self::Process(child) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill work server process");
                }
            }
        }
    }
}

pub struct Distributor {
    config: Config,
    definition: Vec<u8>,
    num_items: u64,
    output_path: PathBuf,
    packager: Box<dyn Packager>,
    blob: Option<PipelineBlob>,
    queue: Option<WorkQueue>,
    total_jobs: u64,
    startup: Option<ServerStartup>,
    server: Option<ServerHandle>,
    last_summary: Option<ServerSummary>,
}

impl Distributor {
    pub fn new(config: Config, definition: Vec<u8>, num_items: u64, output_path: impl Into<PathBuf>) -> Self {
        let packager = ZlibPackager::new(config.distribution.blob_dir.clone());
        Self {
            config,
            definition,
            num_items,
            output_path: output_path.into(),
            packager: Box::new(packager),
            blob: None,
            queue: None,
            total_jobs: 0,
            startup: None,
            server: None,
            last_summary: None,
        }
    }

    /// Replace the default zlib packager
    pub fn with_packager(mut self, packager: Box<dyn Packager>) -> Self {
        self.packager = packager;
        self
    }

    /// Package the definition and build the job queue. No-op once prepared.
    pub fn prepare(&mut self) -> Result<()> {
        if self.blob.is_some() {
            return Ok(());
        }

        let blob = self.packager.package(&self.definition, &self.output_path)
            .context("Failed to package pipeline")?;
        let queue = WorkQueue::for_items(self.num_items, &blob.hash);

        tracing::info!(jobs = self.num_items, hash = %blob.hash, "Prepared batch");
        self.total_jobs = self.num_items;
        self.queue = Some(queue);
        self.blob = Some(blob);
        Ok(())
    }

    /// Start the work server and return its URL
    ///
    /// `port` overrides any port in `address`; with neither the server binds an
    /// ephemeral port. Waits for the startup handoff up to the configured timeout.
    pub async fn start_serving(&mut self, address: &str, port: Option<u16>) -> Result<String> {
        if let Some(server) = self.server.as_mut() {
            if server.is_running() {
                return Err(BrokerError::AlreadyServing.into());
            }
            self.server = None;
        }

        let mut endpoint = Endpoint::parse(address)?;
        if port.is_some() {
            endpoint = endpoint.with_port(port);
        }

        // A previous server consumed the queue and removed the blob file
        if self.queue.is_none() {
            self.forget_blob();
        }
        self.prepare()?;

        let queue = self.queue.take().ok_or(BrokerError::NotPrepared)?;
        let info = self.blob.as_ref().ok_or(BrokerError::NotPrepared)?.info();
        let timeout = self.config.server.startup_timeout();

        let (handle, startup) = match self.config.server.mode {
            ServerMode::InProcess => self.spawn_task(endpoint, queue, info, timeout).await?,
            ServerMode::Subprocess => self.spawn_process(endpoint, queue, info, timeout).await?,
        };

        tracing::info!(
            url = %startup.url,
            jobs = startup.total_jobs,
            mode = %self.config.server.mode,
            "Work server started"
        );
        let url = startup.url.clone();
        self.startup = Some(startup);
        self.server = Some(handle);
        self.last_summary = None;
        Ok(url)
    }

    async fn spawn_task(
        &self,
        endpoint: Endpoint,
        queue: WorkQueue,
        info: PipelineInfo,
        timeout: Duration,
    ) -> Result<(ServerHandle, ServerStartup)> {
        let sink = MeasurementStore::open(&self.output_path)?;
        let server = WorkServer::new(
            queue,
            self.total_jobs,
            info,
            Box::new(sink),
            self.config.server.scratch_dir.clone(),
        );

        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<ServerStartup, String>>();
        let handle = tokio::spawn(async move {
            let server = match server.bind(&endpoint).await {
                Ok(server) => server,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("{:#}", e)));
                    return Err(e);
                }
            };
            let _ = ready_tx.send(Ok(server.startup()));
            server.run().await
        });

        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(startup))) => Ok((ServerHandle::Task(handle), startup)),
            Ok(Ok(Err(message))) => Err(BrokerError::Startup(message).into()),
            Ok(Err(_)) => Err(BrokerError::Startup("server task exited before binding".to_string()).into()),
            Err(_) => {
                handle.abort();
                Err(BrokerError::Timeout { operation: "starting work server", timeout }.into())
            }
        }
    }

    async fn spawn_process(
        &self,
        endpoint: Endpoint,
        queue: WorkQueue,
        info: PipelineInfo,
        timeout: Duration,
    ) -> Result<(ServerHandle, ServerStartup)> {
        let program = match &self.config.server.server_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .context("Failed to get current executable path")?,
        };

        let session = ServeSession {
            address: endpoint.to_string(),
            jobs: queue.jobs(),
            total_jobs: self.total_jobs,
            pipeline: info,
            output_path: self.output_path.clone(),
            scratch_dir: self.config.server.scratch_dir.clone(),
        };
        let payload = serde_json::to_vec(&session)
            .context("Failed to serialize session")?;

        let mut child = Command::new(&program)
            .arg("--mode")
            .arg("session")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn work server process: {}", program.display()))?;

        tracing::debug!(pid = ?child.id(), program = %program.display(), "Spawned work server process");

        let mut stdin = child.stdin.take()
            .context("Work server process has no stdin")?;
        stdin.write_all(&payload).await
            .context("Failed to send session to work server process")?;
        stdin.shutdown().await
            .context("Failed to close work server stdin")?;
        drop(stdin);

        let stdout = child.stdout.take()
            .context("Work server process has no stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        let line = match tokio::time::timeout(timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                let status = child.wait().await.ok();
                return Err(BrokerError::Startup(format!(
                    "server process exited before handoff ({})",
                    status.map(|s| s.to_string()).unwrap_or_else(|| "unknown status".to_string())
                ))
                .into());
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(anyhow::Error::new(e).context("Failed to read handoff"));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(BrokerError::Timeout { operation: "starting work server", timeout }.into());
            }
        };

        match parse_handoff(&line) {
            Ok(Handoff::Ready(startup)) => Ok((ServerHandle::Process(child), startup)),
            Ok(Handoff::Failed { error }) => {
                let _ = child.wait().await;
                Err(BrokerError::Startup(error).into())
            }
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        }
    }

    /// Stop serving
    ///
    /// Returns false and does nothing if the server is alive and `force` is
    /// false. Otherwise kills the server, clears the queue and discards the blob.
    pub async fn stop_serving(&mut self, force: bool) -> bool {
        if let Some(server) = self.server.as_mut() {
            if server.is_running() {
                if !force {
                    return false;
                }
                tracing::info!("Killing work server");
                server.kill().await;
            }
        }

        self.server = None;
        self.queue = None;
        self.startup = None;
        self.forget_blob();
        true
    }

    /// Whether the work server is alive
    pub fn is_running(&mut self) -> bool {
        self.server.as_mut().map(ServerHandle::is_running).unwrap_or(false)
    }

    /// Wait up to `timeout` for the server to exit on its own
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let Some(server) = self.server.as_mut() else {
            return true;
        };

        match tokio::time::timeout(timeout, server.wait()).await {
            Ok(summary) => {
                self.last_summary = summary;
                self.server = None;
                true
            }
            Err(_) => false,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.startup.as_ref().map(|startup| startup.url.as_str())
    }

    pub fn total_jobs(&self) -> u64 {
        self.total_jobs
    }

    pub fn pipeline_hash(&self) -> Option<&str> {
        self.blob.as_ref().map(|blob| blob.hash.as_str())
    }

    pub fn pipeline_path(&self) -> Option<&str> {
        self.startup.as_ref().map(|startup| startup.pipeline_path.as_str())
    }

    /// Counters from an in-process server that exited on its own
    pub fn last_summary(&self) -> Option<&ServerSummary> {
        self.last_summary.as_ref()
    }

    fn forget_blob(&mut self) {
        if let Some(blob) = self.blob.take() {
            pipeline::discard(&blob.locator);
        }
    }
}

impl Drop for Distributor {
    fn drop(&mut self) {
        if let Some(ServerHandle::Task(handle)) = &self.server {
            handle.abort();
        }
        self.forget_blob();
    }
}
