//! Work server
//!
//! The work server owns the job queue and the aggregate result sink. It:
//! - Binds the requested endpoint (ephemeral port when none is given)
//! - Publishes a startup snapshot for the distributor
//! - Funnels requests from every connection into one loop, so queue and sink
//!   are only ever touched by one request at a time
//! - Saves merged results at most once per `SAVE_INTERVAL`, and once more on exit
//! - Stops when the queue drains or a `stop` command arrives, then removes the
//!   pipeline blob and clears the queue
//!
//! Connection tasks only move frames: they read a request, hand it to the loop
//! together with a reply slot, and write the reply back before reading the next
//! request.

use crate::distributed::protocol::*;
use crate::distributed::transport::Endpoint;
use crate::error::BrokerError;
use crate::pipeline::{self, PipelineInfo};
use crate::queue::WorkQueue;
use crate::store::{parent_dir, ResultSink};
use crate::Result;
use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Requests waiting for the server loop before connections are pushed back
const INBOX_CAPACITY: usize = 64;

/// How long pending replies get to flush after the loop exits
const SHUTDOWN_LINGER: Duration = Duration::from_secs(2);

/// Minimum time between aggregate saves while serving
const SAVE_INTERVAL: Duration = Duration::from_secs(5);

/// Live server bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerState {
    pub address: String,
    pub port: u16,
    pub running: bool,
    pub jobs_finished: u64,
    pub total_jobs: u64,
}

/// Snapshot handed to the distributor once the socket is bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStartup {
    pub url: String,
    pub total_jobs: u64,
    pub pipeline_hash: String,
    pub pipeline_path: String,
}

/// Final counters after the server stops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSummary {
    pub jobs_finished: u64,
    pub total_jobs: u64,
    pub num_remaining: usize,
}

/// A request plus the slot its reply goes into
struct Envelope {
    body: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

pub struct WorkServer {
    state: ServerState,
    queue: WorkQueue,
    sink: Box<dyn ResultSink>,
    pipeline: PipelineInfo,
    scratch_dir: PathBuf,
    listener: Option<TcpListener>,
    unsaved: u64,
    last_save: Instant,
}

impl WorkServer {
    /// Create an unbound server
    ///
    /// Reported results are written to scratch files next to the sink's backing
    /// file, or into `scratch_dir` when the sink has none.
    pub fn new(
        queue: WorkQueue,
        total_jobs: u64,
        pipeline: PipelineInfo,
        sink: Box<dyn ResultSink>,
        scratch_dir: Option<PathBuf>,
    ) -> Self {
        let scratch_dir = sink.location()
            .map(|path| parent_dir(path).to_path_buf())
            .or(scratch_dir)
            .unwrap_or_else(std::env::temp_dir);

        Self {
            state: ServerState {
                address: String::new(),
                port: 0,
                running: false,
                jobs_finished: 0,
                total_jobs,
            },
            queue,
            sink,
            pipeline,
            scratch_dir,
            listener: None,
            unsaved: 0,
            last_save: Instant::now(),
        }
    }

    /// Bind the listening socket
    pub async fn bind(mut self, endpoint: &Endpoint) -> Result<Self> {
        let listener = TcpListener::bind(endpoint.socket_addr()).await
            .with_context(|| format!("Failed to bind work server to {}", endpoint))?;
        let local = listener.local_addr()
            .context("Failed to read bound address")?;

        self.state.address = endpoint.host.clone();
        self.state.port = local.port();
        self.listener = Some(listener);

        tracing::info!(url = %self.url(), jobs = self.queue.count(), "Work server bound");
        Ok(self)
    }

    pub fn url(&self) -> String {
        Endpoint {
            host: self.state.address.clone(),
            port: Some(self.state.port),
        }
        .to_string()
    }

    pub fn startup(&self) -> ServerStartup {
        ServerStartup {
            url: self.url(),
            total_jobs: self.state.total_jobs,
            pipeline_hash: self.pipeline.hash.clone(),
            pipeline_path: self.pipeline.locator.to_string(),
        }
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Serve until the queue drains or a stop command arrives
    pub async fn run(mut self) -> Result<ServerSummary> {
        let listener = self.listener.take()
            .context("Work server must be bound before running")?;

        let shutdown = CancellationToken::new();
        // Aborting this future tears down the acceptor and idle connections too
        let _shutdown_guard = shutdown.clone().drop_guard();
        let connections = TaskTracker::new();
        let (inbox_tx, mut inbox) = mpsc::channel::<Envelope>(INBOX_CAPACITY);

        connections.spawn(accept_loop(
            listener,
            inbox_tx,
            shutdown.clone(),
            connections.clone(),
        ));

        self.state.running = true;
        tracing::info!(url = %self.url(), remaining = self.queue.count(), "Serving work");

        while self.state.running {
            let Some(envelope) = inbox.recv().await else {
                break;
            };

            let reply = self.handle_message(&envelope.body);
            let body = encode_reply(&reply)?;
            if envelope.reply.send(body).is_err() {
                tracing::debug!("Requester disconnected before the reply was sent");
            }

            if self.queue.is_empty() {
                self.state.running = false;
            }
        }

        shutdown.cancel();
        drop(inbox);
        connections.close();
        if tokio::time::timeout(SHUTDOWN_LINGER, connections.wait()).await.is_err() {
            tracing::warn!("Connections did not close within {:?}", SHUTDOWN_LINGER);
        }

        let summary = ServerSummary {
            jobs_finished: self.state.jobs_finished,
            total_jobs: self.state.total_jobs,
            num_remaining: self.queue.count(),
        };
        let saved = self.save_results();
        self.teardown();
        saved?;

        tracing::info!(
            finished = summary.jobs_finished,
            total = summary.total_jobs,
            remaining = summary.num_remaining,
            "Work server stopped"
        );
        Ok(summary)
    }

    /// Decode and dispatch one request. Undecodable input is a bad request.
    pub fn handle_message(&mut self, body: &[u8]) -> Reply {
        match decode_request(body) {
            Ok(request) => self.handle_request(request),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Bad request");
                StatusReply::BadRequest.into()
            }
        }
    }

    pub fn handle_request(&mut self, request: Request) -> Reply {
        match request {
            Request::Next => self.handle_next(),
            Request::Result(report) => self.handle_result(report).into(),
            Request::Command(Command::Stop) => self.handle_stop().into(),
            Request::Command(Command::Remove { id }) => self.handle_remove(id).into(),
            Request::Get { keys } => self.handle_get(&keys),
        }
    }

    fn handle_next(&mut self) -> Reply {
        match self.queue.get_next() {
            Some(job) => {
                tracing::debug!(id = job.id, "Serving job");
                Reply::Job(JobAssignment {
                    id: job.id,
                    pipeline_hash: job.pipeline_hash,
                    num_remaining: self.queue.count(),
                })
            }
            None => StatusReply::NoWork.into(),
        }
    }

    fn handle_result(&mut self, report: ResultReport) -> StatusReply {
        let Some(job) = self.queue.lookup(report.id) else {
            tracing::warn!(id = report.id, "Result for unknown work item");
            return failure(BrokerError::JobNotFound(report.id));
        };

        if job.pipeline_hash != report.pipeline_hash {
            tracing::warn!(
                id = report.id,
                expected = %job.pipeline_hash,
                reported = %report.pipeline_hash,
                "Ignoring result from a different pipeline"
            );
            return failure(BrokerError::HashMismatch);
        }

        match self.merge_result(&report.result) {
            Ok(written) => {
                tracing::debug!(id = report.id, measurements = written, "Merged result");
            }
            Err(e) => {
                tracing::warn!(id = report.id, error = %format!("{:#}", e), "Failed to merge result");
                return StatusReply::Failure {
                    code: format!("failed to merge result: {}", e),
                };
            }
        }

        if let Err(e) = self.queue.remove(report.id) {
            return failure(e);
        }
        self.state.jobs_finished += 1;
        self.unsaved += 1;
        self.save_if_due();

        let num_remaining = self.queue.count();
        tracing::info!(id = report.id, remaining = num_remaining, "Job finished");
        StatusReply::Success {
            num_remaining: Some(num_remaining),
            id: None,
        }
    }

    /// Decode the payload into a scratch file and merge it into the sink
    fn merge_result(&mut self, encoded: &str) -> Result<usize> {
        let bytes = BASE64.decode(encoded)
            .context("Result payload is not valid base64")?;

        let mut scratch = tempfile::Builder::new()
            .prefix(".workbroker-result-")
            .suffix(".json")
            .tempfile_in(&self.scratch_dir)
            .with_context(|| format!("Failed to create scratch file in {}", self.scratch_dir.display()))?;
        scratch.write_all(&bytes)
            .context("Failed to write scratch result")?;
        scratch.flush()?;

        self.sink.combine_file(scratch.path(), true)
    }

    fn save_if_due(&mut self) {
        if self.last_save.elapsed() < SAVE_INTERVAL {
            return;
        }
        if let Err(e) = self.save_results() {
            // Results stay merged in memory and go out with the next save
            tracing::warn!(error = %format!("{:#}", e), unsaved = self.unsaved, "Failed to save results");
        }
    }

    /// Write every result merged since the last save to the sink's backing file
    pub fn save_results(&mut self) -> Result<()> {
        if self.unsaved == 0 {
            return Ok(());
        }
        self.last_save = Instant::now();
        self.sink.flush()
            .context("Failed to save aggregate results")?;
        tracing::debug!(results = self.unsaved, "Saved aggregate results");
        self.unsaved = 0;
        Ok(())
    }

    fn handle_stop(&mut self) -> StatusReply {
        tracing::info!("Stop requested");
        self.state.running = false;
        StatusReply::Stopping
    }

    fn handle_remove(&mut self, id: u64) -> StatusReply {
        match self.queue.remove(id) {
            Ok(_) => {
                tracing::info!(id, remaining = self.queue.count(), "Removed work item");
                StatusReply::Success {
                    num_remaining: None,
                    id: Some(id),
                }
            }
            Err(_) => StatusReply::NotFound { id },
        }
    }

    fn handle_get(&self, keys: &[String]) -> Reply {
        let values: BTreeMap<String, Value> = keys
            .iter()
            .map(|key| {
                let value = match key.as_str() {
                    "num_remaining" => json!(self.queue.count()),
                    "pipeline_path" => json!(self.pipeline.locator.as_str()),
                    "pipeline_hash" => json!(self.pipeline.hash),
                    _ => json!(NOT_FOUND),
                };
                (key.clone(), value)
            })
            .collect();
        Reply::Values(values)
    }

    fn teardown(&mut self) {
        self.state.running = false;
        pipeline::discard(&self.pipeline.locator);
        self.queue.clear();
    }
}

fn failure(err: BrokerError) -> StatusReply {
    StatusReply::Failure {
        code: err.to_string(),
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbox: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
    connections: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Client connected");
                    stream.set_nodelay(true).ok();
                    connections.spawn(serve_connection(stream, peer, inbox.clone(), shutdown.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

/// Relay requests from one client in lockstep: read, wait for the reply, write
async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    inbox: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        let body = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut stream) => match frame {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(%peer, error = %format!("{:#}", e), "Dropping connection");
                    break;
                }
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if inbox.send(Envelope { body, reply: reply_tx }).await.is_err() {
            break;
        }
        let Ok(reply) = reply_rx.await else {
            break;
        };

        if let Err(e) = write_frame(&mut stream, &reply).await {
            tracing::debug!(%peer, error = %format!("{:#}", e), "Failed to send reply");
            break;
        }
    }
    tracing::debug!(%peer, "Client disconnected");
}
