//! Work server session for subprocess mode
//!
//! The coordinator launches `workbroker --mode session`, writes a
//! [`ServeSession`] as JSON to the child's stdin and closes it. The child binds
//! the server, answers with exactly one [`Handoff`] line on stdout, then serves
//! until the queue drains or it is told to stop. Logs go to stderr so stdout
//! carries nothing but the handoff.

use crate::distributed::transport::Endpoint;
use crate::distributed::work_server::{ServerStartup, ServerSummary, WorkServer};
use crate::pipeline::PipelineInfo;
use crate::queue::{Job, WorkQueue};
use crate::store::MeasurementStore;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Everything the child needs to build its server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeSession {
    pub address: String,
    pub jobs: Vec<Job>,
    pub total_jobs: u64,
    pub pipeline: PipelineInfo,
    pub output_path: PathBuf,
    pub scratch_dir: Option<PathBuf>,
}

/// The single line a session writes back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handoff {
    Ready(ServerStartup),
    Failed { error: String },
}

impl ServeSession {
    /// Build and bind the server this session describes
    pub async fn into_server(self) -> Result<WorkServer> {
        let endpoint = Endpoint::parse(&self.address)?;
        let queue = WorkQueue::from_jobs(self.jobs)?;
        let sink = MeasurementStore::open(&self.output_path)?;

        WorkServer::new(
            queue,
            self.total_jobs,
            self.pipeline,
            Box::new(sink),
            self.scratch_dir,
        )
        .bind(&endpoint)
        .await
    }
}

/// Read a session from `input`, report the handoff on `output`, and serve
pub async fn serve_session<R, W>(mut input: R, mut output: W) -> Result<ServerSummary>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = String::new();
    input.read_to_string(&mut raw).await
        .context("Failed to read session description")?;

    let bound = match serde_json::from_str::<ServeSession>(&raw) {
        Ok(session) => session.into_server().await,
        Err(e) => Err(anyhow::Error::new(e).context("Invalid session description")),
    };

    let server = match bound {
        Ok(server) => server,
        Err(e) => {
            let handoff = Handoff::Failed {
                error: format!("{:#}", e),
            };
            write_handoff(&mut output, &handoff).await?;
            return Err(e);
        }
    };

    write_handoff(&mut output, &Handoff::Ready(server.startup())).await?;
    drop(output);

    server.run().await
}

/// Session entry for `--mode session`
pub async fn run_session() -> Result<ServerSummary> {
    serve_session(tokio::io::stdin(), tokio::io::stdout()).await
}

async fn write_handoff<W>(output: &mut W, handoff: &Handoff) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(handoff)
        .context("Failed to serialize handoff")?;
    line.push(b'\n');
    output.write_all(&line).await
        .context("Failed to write handoff")?;
    output.flush().await
        .context("Failed to flush handoff")?;
    Ok(())
}

pub fn parse_handoff(line: &str) -> Result<Handoff> {
    serde_json::from_str(line.trim())
        .with_context(|| format!("Malformed handoff line: {}", line.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::protocol::{read_frame, write_frame};
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use url::Url;

    #[test]
    fn test_handoff_wire_shape() {
        let ready = Handoff::Ready(ServerStartup {
            url: "tcp://127.0.0.1:4000".to_string(),
            total_jobs: 2,
            pipeline_hash: "H".to_string(),
            pipeline_path: "file:///tmp/p.zlib".to_string(),
        });
        let line = serde_json::to_string(&ready).unwrap();
        assert!(line.starts_with(r#"{"ready":{"#));
        assert_eq!(parse_handoff(&line).unwrap(), ready);

        let failed = parse_handoff(r#"{"failed":{"error":"bind refused"}}"#).unwrap();
        assert_eq!(failed, Handoff::Failed { error: "bind refused".to_string() });
    }

    #[tokio::test]
    async fn test_invalid_session_reports_failure() {
        let (mut parent_in, child_in) = tokio::io::duplex(1024);
        let (child_out, parent_out) = tokio::io::duplex(1024);

        parent_in.write_all(b"{\"not\": \"a session\"}").await.unwrap();
        drop(parent_in);

        assert!(serve_session(child_in, child_out).await.is_err());

        let mut lines = BufReader::new(parent_out).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(matches!(parse_handoff(&line).unwrap(), Handoff::Failed { .. }));
    }

    #[tokio::test]
    async fn test_session_serves_until_stopped() {
        let temp_dir = TempDir::new().unwrap();
        let blob_path = temp_dir.path().join("pipeline.zlib");
        std::fs::write(&blob_path, b"blob").unwrap();

        let session = ServeSession {
            address: "tcp://127.0.0.1".to_string(),
            jobs: vec![Job::new(1, "H"), Job::new(2, "H")],
            total_jobs: 2,
            pipeline: PipelineInfo {
                hash: "H".to_string(),
                locator: Url::from_file_path(&blob_path).unwrap(),
            },
            output_path: temp_dir.path().join("out.json"),
            scratch_dir: None,
        };

        let (mut parent_in, child_in) = tokio::io::duplex(4096);
        let (child_out, parent_out) = tokio::io::duplex(4096);
        parent_in.write_all(&serde_json::to_vec(&session).unwrap()).await.unwrap();
        drop(parent_in);

        let serving = tokio::spawn(serve_session(child_in, child_out));

        let mut lines = BufReader::new(parent_out).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let startup = match parse_handoff(&line).unwrap() {
            Handoff::Ready(startup) => startup,
            other => panic!("Unexpected handoff: {:?}", other),
        };
        assert_eq!(startup.total_jobs, 2);

        let endpoint = Endpoint::parse(&startup.url).unwrap();
        let mut stream = tokio::net::TcpStream::connect(endpoint.socket_addr()).await.unwrap();
        write_frame(&mut stream, br#"{"type":"command","command":"stop"}"#).await.unwrap();
        let reply = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(reply, br#"{"status":"stopping"}"#);

        let summary = serving.await.unwrap().unwrap();
        assert_eq!(summary.num_remaining, 2);
        assert!(!blob_path.exists());
    }
}
