//! Work server client
//!
//! One `JobClient` keeps one connection to the server and issues requests in
//! lockstep. A transport failure drops the connection; the next request
//! reconnects.

use crate::config::WorkerConfig;
use crate::distributed::protocol::*;
use crate::distributed::transport::{self, Endpoint};
use crate::error::{is_transport_error, BrokerError};
use crate::pipeline;
use crate::Result;
use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use url::Url;

/// One fetched job, as seen by a worker
#[derive(Debug, Clone)]
pub struct ClientJobView {
    /// Image sets to process, `None` when there is nothing to do
    pub image_range: Option<RangeInclusive<u64>>,

    /// Local copy of the compressed pipeline blob
    pub pipeline_blob: Arc<[u8]>,

    /// Hash the server declared for this job
    pub pipeline_hash: String,

    pub job_id: Option<u64>,

    /// False for "no work" and for jobs whose declared hash does not match the blob
    pub is_valid: bool,

    pub num_remaining: usize,
}

impl ClientJobView {
    fn no_work(pipeline_blob: Arc<[u8]>) -> Self {
        Self {
            image_range: None,
            pipeline_blob,
            pipeline_hash: String::new(),
            job_id: None,
            is_valid: false,
            num_remaining: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedBlob {
    bytes: Arc<[u8]>,
    hash: String,
}

pub struct JobClient {
    endpoint: Endpoint,
    connect_timeout: Duration,
    send_timeout: Duration,
    reply_timeout: Option<Duration>,
    stream: Option<TcpStream>,
    blob: Option<CachedBlob>,
}

impl JobClient {
    pub fn new(url: &str, config: &WorkerConfig) -> Result<Self> {
        let endpoint = Endpoint::parse(url)?;
        if endpoint.port.is_none() {
            anyhow::bail!("Server address needs a port: {}", url);
        }

        Ok(Self {
            endpoint,
            connect_timeout: config.connect_timeout(),
            send_timeout: config.send_timeout(),
            reply_timeout: config.reply_timeout(),
            stream: None,
            blob: None,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one request and wait for its reply
    pub async fn request(&mut self, request: &Request) -> Result<Reply> {
        let body = encode_request(request)?;
        match self.exchange(&body).await {
            Ok(reply) => decode_reply(&reply),
            Err(e) => {
                if is_transport_error(&e) {
                    // The connection may hold half a frame; start over next time
                    self.stream = None;
                }
                Err(e)
            }
        }
    }

    async fn exchange(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        if self.stream.is_none() {
            let stream = transport::connect_with_timeout(&self.endpoint, self.connect_timeout).await?;
            tracing::debug!(server = %self.endpoint, "Connected");
            self.stream = Some(stream);
        }
        let stream = self.stream.as_mut()
            .context("Connection missing after connect")?;

        transport::send_with_timeout(stream, body, self.send_timeout).await?;
        transport::recv_with_timeout(stream, self.reply_timeout).await
    }

    /// Read server values for `keys`
    pub async fn get(&mut self, keys: &[&str]) -> Result<BTreeMap<String, Value>> {
        let request = Request::Get {
            keys: keys.iter().map(|key| key.to_string()).collect(),
        };
        match self.request(&request).await? {
            Reply::Values(values) => Ok(values),
            other => Err(unexpected("get", &other)),
        }
    }

    /// Retrieve the pipeline blob once and cache it
    pub async fn fetch_pipeline_blob(&mut self) -> Result<Arc<[u8]>> {
        if let Some(blob) = &self.blob {
            return Ok(blob.bytes.clone());
        }

        let values = self.get(&["pipeline_path", "pipeline_hash"]).await?;
        let locator = match values.get("pipeline_path").and_then(Value::as_str) {
            Some(path) if path != NOT_FOUND => Url::parse(path)
                .with_context(|| format!("Invalid pipeline locator: {}", path))?,
            _ => return Err(BrokerError::Protocol("server did not report a pipeline path".to_string()).into()),
        };

        let bytes: Arc<[u8]> = pipeline::fetch_blob(&locator).await?.into();
        let hash = pipeline::content_hash(&bytes);
        if let Some(declared) = values.get("pipeline_hash").and_then(Value::as_str) {
            if declared != hash {
                tracing::warn!(declared, fetched = %hash, "Fetched pipeline does not match the server's hash");
            }
        }

        tracing::info!(locator = %locator, hash = %hash, size = bytes.len(), "Fetched pipeline");
        self.blob = Some(CachedBlob {
            bytes: bytes.clone(),
            hash,
        });
        Ok(bytes)
    }

    /// Ask for the next job
    pub async fn fetch_job(&mut self) -> Result<ClientJobView> {
        let blob = self.fetch_pipeline_blob().await?;
        let local_hash = self.blob.as_ref()
            .map(|cached| cached.hash.clone())
            .unwrap_or_else(|| pipeline::content_hash(&blob));

        match self.request(&Request::Next).await? {
            Reply::Status(StatusReply::NoWork) => Ok(ClientJobView::no_work(blob)),
            Reply::Job(job) => {
                let is_valid = job.pipeline_hash == local_hash;
                if !is_valid {
                    tracing::warn!(
                        id = job.id,
                        declared = %job.pipeline_hash,
                        local = %local_hash,
                        "Job was issued for a different pipeline"
                    );
                }
                Ok(ClientJobView {
                    image_range: Some(job.id..=job.id),
                    pipeline_blob: blob,
                    pipeline_hash: job.pipeline_hash,
                    job_id: Some(job.id),
                    is_valid,
                    num_remaining: job.num_remaining,
                })
            }
            other => Err(unexpected("next", &other)),
        }
    }

    /// Report the result bytes for a fetched job
    pub async fn report_result(&mut self, view: &ClientJobView, result: &[u8]) -> Result<StatusReply> {
        let id = view.job_id
            .ok_or_else(|| BrokerError::Protocol("cannot report a result without a job".to_string()))?;

        let request = Request::Result(ResultReport {
            id,
            pipeline_hash: view.pipeline_hash.clone(),
            result: BASE64.encode(result),
        });
        self.status_request("result", &request).await
    }

    pub async fn stop_server(&mut self) -> Result<StatusReply> {
        self.status_request("stop", &Request::Command(Command::Stop)).await
    }

    pub async fn remove_job(&mut self, id: u64) -> Result<StatusReply> {
        self.status_request("remove", &Request::Command(Command::Remove { id })).await
    }

    async fn status_request(&mut self, operation: &str, request: &Request) -> Result<StatusReply> {
        match self.request(request).await? {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected(operation, &other)),
        }
    }
}

fn unexpected(operation: &str, reply: &Reply) -> anyhow::Error {
    BrokerError::Protocol(format!("unexpected reply to {}: {:?}", operation, reply)).into()
}
