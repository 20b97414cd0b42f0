//! Configuration validation

use super::*;
use crate::distributed::transport::Endpoint;
use anyhow::{Context, Result};

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_server(&config.server)?;
    validate_worker(&config.worker)?;
    validate_distribution(&config.distribution)?;

    Ok(())
}

/// Validate work server configuration
pub fn validate_server(server: &ServerConfig) -> Result<()> {
    Endpoint::parse(&server.address)
        .with_context(|| format!("Invalid server address: {}", server.address))?;

    if server.startup_timeout_secs == 0 {
        anyhow::bail!("startup_timeout_secs must be greater than 0");
    }

    if let Some(program) = &server.server_program {
        if !program.exists() {
            anyhow::bail!("server_program does not exist: {}", program.display());
        }
    }

    if let Some(dir) = &server.scratch_dir {
        if !dir.is_dir() {
            anyhow::bail!("scratch_dir is not a directory: {}", dir.display());
        }
    }

    Ok(())
}

/// Validate worker configuration
pub fn validate_worker(worker: &WorkerConfig) -> Result<()> {
    worker.validate()
        .map_err(|e| anyhow::anyhow!("Worker configuration invalid: {}", e))
}

/// Validate distribution configuration
pub fn validate_distribution(distribution: &DistributionConfig) -> Result<()> {
    if let Some(dir) = &distribution.blob_dir {
        if !dir.is_dir() {
            anyhow::bail!("blob_dir is not a directory: {}", dir.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_server_address() {
        let mut server = ServerConfig::default();
        server.address = "tcp://0.0.0.0:5555".to_string();
        assert!(validate_server(&server).is_ok());

        server.address = "ipc:///tmp/broker".to_string();
        assert!(validate_server(&server).is_err());

        server.address = "localhost".to_string();
        assert!(validate_server(&server).is_err());
    }

    #[test]
    fn test_validate_server_timeouts_and_paths() {
        let mut server = ServerConfig::default();
        server.startup_timeout_secs = 0;
        assert!(validate_server(&server).is_err());

        let mut server = ServerConfig::default();
        server.server_program = Some(PathBuf::from("/nonexistent/workbroker"));
        assert!(validate_server(&server).is_err());
    }

    #[test]
    fn test_validate_worker() {
        let mut worker = WorkerConfig::default();
        assert!(validate_worker(&worker).is_ok());

        worker.send_timeout_ms = 0;
        assert!(validate_worker(&worker).is_err());
    }

    #[test]
    fn test_validate_blob_dir() {
        let temp_dir = TempDir::new().unwrap();
        let mut distribution = DistributionConfig {
            blob_dir: Some(temp_dir.path().to_path_buf()),
            ..DistributionConfig::default()
        };
        assert!(validate_distribution(&distribution).is_ok());

        distribution.blob_dir = Some(temp_dir.path().join("missing"));
        assert!(validate_distribution(&distribution).is_err());
    }
}
