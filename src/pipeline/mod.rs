//! Pipeline blob packaging and retrieval
//!
//! The computation definition is shipped to workers as a zlib-compressed blob.
//! The coordinator writes it somewhere retrievable and hands out a locator URL;
//! workers fetch the bytes once and compare their sha1 with the hash the server
//! declares for each job.

use crate::Result;
use anyhow::Context;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use url::Url;

/// Immutable packaged computation definition
#[derive(Debug, Clone)]
pub struct PipelineBlob {
    /// Compressed definition
    pub bytes: Vec<u8>,

    /// sha1 hex digest of `bytes`
    pub hash: String,

    /// Where workers retrieve `bytes` from
    pub locator: Url,
}

impl PipelineBlob {
    pub fn new(bytes: Vec<u8>, locator: Url) -> Self {
        let hash = content_hash(&bytes);
        Self {
            bytes,
            hash,
            locator,
        }
    }

    /// Hash and locator, the part of the blob the server needs
    pub fn info(&self) -> PipelineInfo {
        PipelineInfo {
            hash: self.hash.clone(),
            locator: self.locator.clone(),
        }
    }
}

/// Pipeline identity as published by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub hash: String,
    pub locator: Url,
}

/// Turns a computation definition into a retrievable blob
pub trait Packager: Send + Sync {
    fn package(&self, definition: &[u8], output_path: &Path) -> Result<PipelineBlob>;
}

/// Compresses the definition with zlib and stores it in a kept temp file
#[derive(Debug, Clone, Default)]
pub struct ZlibPackager {
    /// Directory for blob files (system temp dir when unset)
    blob_dir: Option<PathBuf>,
}

impl ZlibPackager {
    pub fn new(blob_dir: Option<PathBuf>) -> Self {
        Self { blob_dir }
    }
}

impl Packager for ZlibPackager {
    fn package(&self, definition: &[u8], output_path: &Path) -> Result<PipelineBlob> {
        let bytes = compress(definition)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("workbroker-pipeline-").suffix(".zlib");
        let mut file = match &self.blob_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .context("Failed to create pipeline blob file")?;

        file.write_all(&bytes)
            .context("Failed to write pipeline blob")?;
        file.flush()?;

        let (_, path) = file.keep()
            .context("Failed to keep pipeline blob file")?;
        let path = path.canonicalize().unwrap_or(path);
        let locator = Url::from_file_path(&path)
            .map_err(|_| anyhow::anyhow!("Blob path is not absolute: {}", path.display()))?;

        let blob = PipelineBlob::new(bytes, locator);
        tracing::info!(
            hash = %blob.hash,
            locator = %blob.locator,
            size = blob.bytes.len(),
            output = %output_path.display(),
            "Packaged pipeline"
        );
        Ok(blob)
    }
}

/// sha1 hex digest used as the pipeline version
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

pub fn compress(definition: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(definition)
        .context("Failed to compress pipeline")?;
    encoder.finish()
        .context("Failed to finish pipeline compression")
}

pub fn decompress(blob: &[u8]) -> Result<Vec<u8>> {
    let mut definition = Vec::new();
    ZlibDecoder::new(blob)
        .read_to_end(&mut definition)
        .context("Failed to decompress pipeline blob")?;
    Ok(definition)
}

/// Read blob bytes from a `file://` or `http(s)://` locator
pub async fn fetch_blob(locator: &Url) -> Result<Vec<u8>> {
    match locator.scheme() {
        "file" => {
            let path = locator.to_file_path()
                .map_err(|_| anyhow::anyhow!("Invalid file locator: {}", locator))?;
            tokio::fs::read(&path).await
                .with_context(|| format!("Failed to read pipeline blob: {}", path.display()))
        }
        "http" | "https" => {
            let response = reqwest::get(locator.clone()).await
                .with_context(|| format!("Failed to fetch pipeline blob: {}", locator))?
                .error_for_status()
                .with_context(|| format!("Pipeline blob request rejected: {}", locator))?;
            let bytes = response.bytes().await
                .context("Failed to read pipeline blob body")?;
            Ok(bytes.to_vec())
        }
        other => anyhow::bail!("Unsupported pipeline locator scheme: {}", other),
    }
}

/// Best-effort deletion of a blob's backing file. Non-file locators are left alone.
pub fn discard(locator: &Url) {
    if locator.scheme() != "file" {
        return;
    }
    let Ok(path) = locator.to_file_path() else {
        return;
    };
    match std::fs::remove_file(&path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed pipeline blob"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove pipeline blob"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_content_hash_is_sha1_hex() {
        assert_eq!(content_hash(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_package_writes_blob() {
        let temp_dir = TempDir::new().unwrap();
        let packager = ZlibPackager::new(Some(temp_dir.path().to_path_buf()));

        let blob = packager.package(b"echo Count=1", &temp_dir.path().join("out.json")).unwrap();

        assert_eq!(blob.locator.scheme(), "file");
        assert_eq!(blob.hash, content_hash(&blob.bytes));

        let path = blob.locator.to_file_path().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), blob.bytes);
        assert_eq!(decompress(&blob.bytes).unwrap(), b"echo Count=1");
    }

    #[test]
    fn test_same_definition_same_hash() {
        let temp_dir = TempDir::new().unwrap();
        let packager = ZlibPackager::new(Some(temp_dir.path().to_path_buf()));
        let output = temp_dir.path().join("out.json");

        let first = packager.package(b"pipeline v1", &output).unwrap();
        let second = packager.package(b"pipeline v1", &output).unwrap();
        let changed = packager.package(b"pipeline v2", &output).unwrap();

        assert_eq!(first.hash, second.hash);
        assert_ne!(first.locator, second.locator);
        assert_ne!(first.hash, changed.hash);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress(b"definitely not zlib").is_err());
    }

    #[tokio::test]
    async fn test_fetch_blob_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blob.zlib");
        std::fs::write(&path, b"blob bytes").unwrap();

        let locator = Url::from_file_path(&path).unwrap();
        assert_eq!(fetch_blob(&locator).await.unwrap(), b"blob bytes");
    }

    #[tokio::test]
    async fn test_fetch_blob_rejects_unknown_scheme() {
        let locator = Url::parse("ftp://example.com/blob").unwrap();
        assert!(fetch_blob(&locator).await.is_err());
    }

    #[test]
    fn test_discard_tolerates_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blob.zlib");
        std::fs::write(&path, b"x").unwrap();
        let locator = Url::from_file_path(&path).unwrap();

        discard(&locator);
        assert!(!path.exists());
        discard(&locator);

        discard(&Url::parse("http://example.com/blob").unwrap());
    }
}
