//! Worker loop implementation
//!
//! A worker pulls jobs from a work server, runs them through an [`Executor`],
//! and reports the result bytes back until the server has nothing left.
//!
//! # Failure handling
//!
//! - **Transport errors** (connect, send or reply deadline, lost connection) are
//!   retried with exponential backoff up to `max_retries` in a row
//! - **Refused connections** after the server has served this worker mean the
//!   server finished the batch and exited; the worker stops cleanly
//! - **Execution errors** skip the job; it stays queued and is served again
//!   later. `max_consecutive_failures` in a row stops the worker
//! - **Rejected results** (`failure` replies) are logged and counted
//!
//! # Example
//!
//! ```no_run
//! use workbroker::config::WorkerConfig;
//! use workbroker::distributed::JobClient;
//! use workbroker::executor::CommandExecutor;
//! use workbroker::worker::run_worker;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = WorkerConfig::default();
//! let mut client = JobClient::new("tcp://10.0.1.10:5555", &config)?;
//! let summary = run_worker(&mut client, &CommandExecutor::default(), &config).await?;
//!
//! println!("Completed {} jobs", summary.jobs_completed);
//! # Ok(())
//! # }
//! ```

use crate::config::WorkerConfig;
use crate::distributed::{ClientJobView, JobClient, StatusReply};
use crate::error::{is_connection_refused, is_transport_error};
use crate::executor::Executor;
use crate::pipeline;
use crate::store::MeasurementStore;
use crate::Result;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Why a worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerExit {
    /// Server answered `nowork`
    #[default]
    NoWork,
    /// Server reported zero remaining jobs after our result
    Drained,
    /// Job was issued for a pipeline other than the one we fetched
    PipelineMismatch,
    /// Too many execution failures in a row
    TooManyFailures,
    /// Server stopped accepting connections after serving this worker
    ServerClosed,
}

/// Per-worker counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub results_rejected: u64,
    pub transport_retries: u64,
    pub exit: WorkerExit,
}

/// Exponential backoff for transport retries
struct Backoff {
    remaining: u32,
    max_retries: u32,
    initial: Duration,
    delay: Duration,
    max_delay: Duration,
}

impl Backoff {
    fn new(config: &WorkerConfig) -> Self {
        Self {
            remaining: config.max_retries,
            max_retries: config.max_retries,
            initial: config.initial_backoff(),
            delay: config.initial_backoff(),
            max_delay: config.max_backoff(),
        }
    }

    /// Next delay, or `None` once retries are exhausted
    fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.max_delay);
        Some(delay)
    }

    fn reset(&mut self) {
        self.remaining = self.max_retries;
        self.delay = self.initial;
    }
}

/// Decompressed definition, cached per pipeline hash
struct Definition {
    hash: String,
    bytes: Vec<u8>,
}

/// Run the worker loop until the server runs dry or the worker gives up
pub async fn run_worker(
    client: &mut JobClient,
    executor: &dyn Executor,
    config: &WorkerConfig,
) -> Result<WorkerSummary> {
    let mut summary = WorkerSummary::default();
    let mut backoff = Backoff::new(config);
    let mut definition: Option<Definition> = None;
    let mut consecutive_failures = 0u32;
    let mut served = false;

    loop {
        let view = match client.fetch_job().await {
            Ok(view) => view,
            Err(e) if served && is_connection_refused(&e) => {
                tracing::info!("Work server is gone, assuming the batch is finished");
                summary.exit = WorkerExit::ServerClosed;
                break;
            }
            Err(e) if is_transport_error(&e) => {
                retry_after(&mut backoff, &mut summary, e, "fetching job").await?;
                continue;
            }
            Err(e) => return Err(e),
        };
        backoff.reset();
        served = true;

        if !view.is_valid {
            summary.exit = if view.job_id.is_some() {
                WorkerExit::PipelineMismatch
            } else {
                WorkerExit::NoWork
            };
            break;
        }

        let Some(range) = view.image_range.clone() else {
            break;
        };

        if definition.as_ref().map(|d| d.hash.as_str()) != Some(view.pipeline_hash.as_str()) {
            definition = Some(Definition {
                hash: view.pipeline_hash.clone(),
                bytes: pipeline::decompress(&view.pipeline_blob)?,
            });
        }
        let Some(current) = definition.as_ref() else {
            break;
        };

        tracing::debug!(id = ?view.job_id, remaining = view.num_remaining, "Running job");
        let result = match executor.execute(&current.bytes, range).await {
            Ok(result) => {
                consecutive_failures = 0;
                result
            }
            Err(e) => {
                summary.jobs_failed += 1;
                consecutive_failures += 1;
                tracing::warn!(
                    id = ?view.job_id,
                    error = %format!("{:#}", e),
                    consecutive = consecutive_failures,
                    "Job failed"
                );
                if consecutive_failures >= config.max_consecutive_failures {
                    summary.exit = WorkerExit::TooManyFailures;
                    break;
                }
                continue;
            }
        };

        let Some(reply) = report_with_retry(client, &view, &result, &mut backoff, &mut summary).await? else {
            tracing::info!(id = ?view.job_id, "Work server is gone, dropping result");
            summary.exit = WorkerExit::ServerClosed;
            break;
        };
        match reply {
            StatusReply::Success { num_remaining, .. } => {
                summary.jobs_completed += 1;
                if num_remaining == Some(0) {
                    summary.exit = WorkerExit::Drained;
                    break;
                }
            }
            StatusReply::Failure { code } => {
                summary.results_rejected += 1;
                tracing::warn!(id = ?view.job_id, code = %code, "Result rejected");
            }
            other => {
                summary.results_rejected += 1;
                tracing::warn!(id = ?view.job_id, reply = ?other, "Unexpected reply to result");
            }
        }
    }

    tracing::info!(
        completed = summary.jobs_completed,
        failed = summary.jobs_failed,
        rejected = summary.results_rejected,
        exit = ?summary.exit,
        "Worker finished"
    );
    Ok(summary)
}

/// Report a result, retrying transport errors. `None` when the server is gone.
async fn report_with_retry(
    client: &mut JobClient,
    view: &ClientJobView,
    result: &[u8],
    backoff: &mut Backoff,
    summary: &mut WorkerSummary,
) -> Result<Option<StatusReply>> {
    loop {
        match client.report_result(view, result).await {
            Ok(reply) => {
                backoff.reset();
                return Ok(Some(reply));
            }
            Err(e) if is_connection_refused(&e) => return Ok(None),
            Err(e) if is_transport_error(&e) => {
                retry_after(backoff, summary, e, "reporting result").await?;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn retry_after(
    backoff: &mut Backoff,
    summary: &mut WorkerSummary,
    err: anyhow::Error,
    operation: &str,
) -> Result<()> {
    match backoff.next_delay() {
        Some(delay) => {
            summary.transport_retries += 1;
            tracing::warn!(
                error = %format!("{:#}", err),
                retry_in = ?delay,
                "Transport error while {}",
                operation
            );
            tokio::time::sleep(delay).await;
            Ok(())
        }
        None => Err(err.context(format!("Giving up after {} retries while {}", backoff.max_retries, operation))),
    }
}

/// Run `count` independent workers against one server
///
/// Each worker has its own connection. Fails only if every worker failed.
pub async fn run_local_workers(
    url: &str,
    count: usize,
    executor: Arc<dyn Executor>,
    config: &WorkerConfig,
) -> Result<Vec<WorkerSummary>> {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::info!(host = %host, workers = count, server = url, "Starting workers");

    let mut workers = JoinSet::new();
    for worker_id in 0..count {
        let mut client = JobClient::new(url, config)?;
        let executor = executor.clone();
        let config = config.clone();
        workers.spawn(async move {
            let result = run_worker(&mut client, executor.as_ref(), &config).await;
            (worker_id, result)
        });
    }

    let mut summaries = Vec::with_capacity(count);
    let mut last_error = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((_, Ok(summary))) => summaries.push(summary),
            Ok((worker_id, Err(e))) => {
                tracing::error!(worker_id, error = %format!("{:#}", e), "Worker failed");
                last_error = Some(e);
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker task panicked");
                last_error = Some(anyhow::Error::new(e));
            }
        }
    }

    match last_error {
        Some(e) if summaries.is_empty() => Err(e.context("All workers failed")),
        _ => Ok(summaries),
    }
}

/// Run every image set in order without a work server
///
/// Results merge straight into the store at `output`. Returns the number of
/// image sets executed.
pub async fn run_locally(
    definition: &[u8],
    num_items: u64,
    executor: &dyn Executor,
    output: &Path,
) -> Result<u64> {
    let mut store = MeasurementStore::open(output)?;

    for image_set in 1..=num_items {
        let bytes = executor.execute(definition, image_set..=image_set).await
            .with_context(|| format!("Image set {} failed", image_set))?;
        let result = MeasurementStore::from_bytes(&bytes)?;
        store.combine(&result, true)?;
        tracing::debug!(image_set, "Image set finished");
    }

    store.save()?;
    tracing::info!(image_sets = num_items, output = %output.display(), "Batch finished locally");
    Ok(num_items)
}
