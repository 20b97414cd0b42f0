//! Endpoint addressing and deadline-bounded socket operations
//!
//! Addresses look like `tcp://<host>:<port>`. A missing or zero port asks the
//! operating system for an ephemeral port when binding.

use crate::distributed::protocol::{read_frame, write_frame};
use crate::error::BrokerError;
use crate::Result;
use anyhow::Context;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use url::Url;

/// Network endpoint of a work server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: Option<u16>,
}

impl Endpoint {
    /// Parse `tcp://host[:port]`
    pub fn parse(address: &str) -> Result<Self> {
        let url = Url::parse(address)
            .with_context(|| format!("Invalid address: {}", address))?;
        if url.scheme() != "tcp" {
            return Err(BrokerError::UnsupportedScheme(url.scheme().to_string()).into());
        }
        let host = url.host_str()
            .with_context(|| format!("Address has no host: {}", address))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        Ok(Self {
            host,
            port: url.port().filter(|port| *port != 0),
        })
    }

    /// Same host with a specific port
    pub fn with_port(&self, port: Option<u16>) -> Self {
        Self {
            host: self.host.clone(),
            port: port.filter(|port| *port != 0),
        }
    }

    /// `host:port` for binding; port 0 when unset
    pub fn socket_addr(&self) -> String {
        let port = self.port.unwrap_or(0);
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.socket_addr())
    }
}

/// Connect with a deadline
pub async fn connect_with_timeout(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream> {
    if endpoint.port.is_none() {
        anyhow::bail!("Cannot connect to {} without a port", endpoint);
    }

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(endpoint.socket_addr())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(BrokerError::Transport { operation: "connecting", source })
                .with_context(|| format!("Failed to connect to {}", endpoint));
        }
        Err(_) => {
            return Err(BrokerError::Timeout { operation: "connecting", timeout })
                .with_context(|| format!("Failed to connect to {}", endpoint));
        }
    };

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Send one frame, giving up after `timeout` instead of blocking on an absent peer
pub async fn send_with_timeout(stream: &mut TcpStream, body: &[u8], timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, write_frame(stream, body)).await {
        Ok(result) => result.map_err(|e| transport_error("sending request", e)),
        Err(_) => Err(BrokerError::Timeout { operation: "sending request", timeout }.into()),
    }
}

/// Receive one frame, optionally bounded by `timeout`
pub async fn recv_with_timeout(stream: &mut TcpStream, timeout: Option<Duration>) -> Result<Vec<u8>> {
    let received = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, read_frame(stream)).await {
            Ok(result) => result,
            Err(_) => {
                return Err(BrokerError::Timeout { operation: "waiting for reply", timeout }.into());
            }
        },
        None => read_frame(stream).await,
    };

    match received {
        Ok(Some(body)) => Ok(body),
        Ok(None) => Err(BrokerError::Transport {
            operation: "waiting for reply",
            source: std::io::ErrorKind::ConnectionAborted.into(),
        }
        .into()),
        Err(e) => Err(transport_error("waiting for reply", e)),
    }
}

/// Map a framing failure to a transport error when the cause was I/O
fn transport_error(operation: &'static str, err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<std::io::Error>() {
        Ok(source) => BrokerError::Transport { operation, source }.into(),
        Err(err) => err,
    }
}
