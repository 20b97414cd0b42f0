//! Broker wire protocol
//!
//! Workers and operators talk to the work server with request/reply pairs.
//! Every request gets exactly one reply, and a connection never has more than one
//! request outstanding.
//!
//! # Message Flow
//!
//! ```text
//! Worker                          Work Server
//!     |                              |
//!     |-- get [pipeline_path, ...] ->|
//!     |<------ {pipeline_path: ..} --|
//!     |                              |
//!     |-------- next --------------->|
//!     |<-- {id, pipeline_hash, n} ---|
//!     |                              |
//!     |-- result(id, hash, b64) ---->|
//!     |<-- {status: success, n} -----|
//!     |                              |
//!     |-------- next --------------->|
//!     |<-- {status: nowork} ---------|
//! ```
//!
//! # Message Framing
//!
//! Each message is one UTF-8 JSON object prefixed with a 4-byte length field
//! (little-endian u32):
//!
//! ```text
//! [4 bytes: message length][N bytes: JSON object]
//! ```

use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted in either direction
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Keys a `get` request may ask for
pub const GET_KEYS: [&str; 3] = ["num_remaining", "pipeline_path", "pipeline_hash"];

/// Value returned for keys outside [`GET_KEYS`]
pub const NOT_FOUND: &str = "notfound";

/// Client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    /// Ask for the next job
    Next,

    /// Report the result of a job
    Result(ResultReport),

    /// Administrative command
    Command(Command),

    /// Read server values
    Get { keys: Vec<String> },
}

/// Result report for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReport {
    pub id: u64,
    pub pipeline_hash: String,

    /// Base64 of the worker's result store file
    pub result: String,
}

/// Administrative command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    /// Stop serving after replying
    Stop,

    /// Drop a job without a result
    Remove { id: u64 },
}

/// A job handed to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub id: u64,
    pub pipeline_hash: String,
    pub num_remaining: usize,
}

/// Replies that carry a `status` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum StatusReply {
    #[serde(rename = "nowork")]
    NoWork,

    #[serde(rename = "success")]
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        num_remaining: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    #[serde(rename = "failure")]
    Failure { code: String },

    #[serde(rename = "stopping")]
    Stopping,

    #[serde(rename = "notfound")]
    NotFound { id: u64 },

    #[serde(rename = "bad request")]
    BadRequest,
}

/// Any server reply
///
/// Variants are tried in order when decoding: a job assignment has no `status`,
/// status replies always do, and `get` replies are plain key/value maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Job(JobAssignment),
    Status(StatusReply),
    Values(BTreeMap<String, Value>),
}

impl From<StatusReply> for Reply {
    fn from(status: StatusReply) -> Self {
        Reply::Status(status)
    }
}

/// Decode a request body. Any parse failure is a bad request.
pub fn decode_request(body: &[u8]) -> Result<Request> {
    serde_json::from_slice(body).context("Malformed request")
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    serde_json::to_vec(request).context("Failed to serialize request")
}

pub fn decode_reply(body: &[u8]) -> Result<Reply> {
    serde_json::from_slice(body).context("Malformed reply")
}

pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>> {
    serde_json::to_vec(reply).context("Failed to serialize reply")
}

/// Read one frame. Returns `None` when the peer closed the connection cleanly
/// between frames.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read message length"),
    }

    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_SIZE {
        anyhow::bail!("Message too large: {} bytes (max {})", msg_len, MAX_MESSAGE_SIZE);
    }

    // Grow with the bytes that actually arrive, not the declared length
    let mut msg_buf = Vec::new();
    let received = (&mut *stream).take(msg_len as u64).read_to_end(&mut msg_buf).await
        .context("Failed to read message body")?;
    if received < msg_len {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
            .with_context(|| format!("Message body truncated at {} of {} bytes", received, msg_len));
    }

    Ok(Some(msg_buf))
}

/// Write one length-prefixed frame and flush it
pub async fn write_frame<W>(stream: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_MESSAGE_SIZE {
        anyhow::bail!("Message too large: {} bytes (max {})", body.len(), MAX_MESSAGE_SIZE);
    }

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(body);

    stream.write_all(&framed).await
        .context("Failed to write message")?;
    stream.flush().await
        .context("Failed to flush stream")?;

    Ok(())
}
