//! Job execution
//!
//! An executor turns the computation definition plus an inclusive range of
//! image set numbers into the bytes of a result store file. The worker loop
//! ships those bytes to the server unchanged.

use crate::store::MeasurementStore;
use crate::Result;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Environment variable holding the image set number being processed
pub const IMAGE_SET_ENV: &str = "WORKBROKER_IMAGE_SET";

/// Environment variable pointing at the decompressed definition file
pub const PIPELINE_ENV: &str = "WORKBROKER_PIPELINE";

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run the definition over `range` and return result store bytes
    async fn execute(&self, definition: &[u8], range: RangeInclusive<u64>) -> Result<Vec<u8>>;
}

/// Runs the definition through `sh`, once per image set.
///
/// Without a configured command the definition itself is the script. With one,
/// the command runs under `sh -c` and finds the definition through
/// `WORKBROKER_PIPELINE`. Every `name=value` line on stdout becomes a
/// measurement for the current image set.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    command: Option<String>,
}

impl CommandExecutor {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }

    async fn run_one(&self, script: &Path, image_set: u64) -> Result<String> {
        let mut cmd = match &self.command {
            Some(command) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg(script);
                cmd
            }
        };

        let output = cmd
            .env(PIPELINE_ENV, script)
            .env(IMAGE_SET_ENV, image_set.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to launch sh")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Image set {} failed with {}: {}",
                image_set,
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, definition: &[u8], range: RangeInclusive<u64>) -> Result<Vec<u8>> {
        let mut script = tempfile::Builder::new()
            .prefix("workbroker-definition-")
            .suffix(".sh")
            .tempfile()
            .context("Failed to create definition file")?;
        script.write_all(definition)
            .context("Failed to write definition file")?;
        script.flush()?;

        let mut store = MeasurementStore::new();
        for image_set in range {
            tracing::debug!(image_set, "Executing image set");
            let stdout = self.run_one(script.path(), image_set).await?;
            for (name, value) in parse_measurements(&stdout) {
                store.record(image_set, name, value);
            }
        }

        store.to_bytes()
    }
}

/// Collect `name=value` lines. Numbers stay numbers, anything else is a string.
pub fn parse_measurements(stdout: &str) -> Vec<(String, Value)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), parse_value(value.trim())))
        })
        .collect()
}

fn parse_value(raw: &str) -> Value {
    if let Ok(int) = raw.parse::<i64>() {
        return Value::from(int);
    }
    match raw.parse::<f64>() {
        Ok(float) if float.is_finite() => Value::from(float),
        _ => Value::from(raw),
    }
}
