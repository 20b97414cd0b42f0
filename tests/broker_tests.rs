//! End-to-end tests: distributor, work server, client and worker loop over TCP

use async_trait::async_trait;
use serde_json::json;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use url::Url;
use workbroker::config::{Config, ServerMode, WorkerConfig};
use workbroker::distributed::{Distributor, JobClient, StatusReply};
use workbroker::error::{is_connection_refused, is_transport_error};
use workbroker::executor::{CommandExecutor, Executor};
use workbroker::pipeline::{self, Packager, PipelineBlob};
use workbroker::store::MeasurementStore;
use workbroker::worker::{run_local_workers, run_locally, run_worker, WorkerExit};

/// Records `Square = n * n` for every image set, failing on one of them
struct SquareExecutor {
    fail_on: Option<u64>,
}

#[async_trait]
impl Executor for SquareExecutor {
    async fn execute(&self, _definition: &[u8], range: RangeInclusive<u64>) -> workbroker::Result<Vec<u8>> {
        let mut store = MeasurementStore::new();
        for image_set in range {
            if Some(image_set) == self.fail_on {
                anyhow::bail!("image set {} is cursed", image_set);
            }
            store.record(image_set, "Square", (image_set * image_set) as i64);
        }
        store.to_bytes()
    }
}

/// Takes a while per job, so several workers end up holding the same one
struct SlowSquareExecutor {
    delay: Duration,
}

#[async_trait]
impl Executor for SlowSquareExecutor {
    async fn execute(&self, definition: &[u8], range: RangeInclusive<u64>) -> workbroker::Result<Vec<u8>> {
        tokio::time::sleep(self.delay).await;
        SquareExecutor { fail_on: None }.execute(definition, range).await
    }
}

/// Writes the blob but declares a hash that does not match it
struct StalePackager {
    dir: std::path::PathBuf,
}

impl Packager for StalePackager {
    fn package(&self, definition: &[u8], _output_path: &Path) -> workbroker::Result<PipelineBlob> {
        let bytes = pipeline::compress(definition)?;
        let path = self.dir.join("stale.zlib");
        std::fs::write(&path, &bytes)?;
        Ok(PipelineBlob {
            bytes,
            hash: "0000000000000000000000000000000000000000".to_string(),
            locator: Url::from_file_path(&path).unwrap(),
        })
    }
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.server.mode = ServerMode::InProcess;
    config.distribution.blob_dir = Some(dir.path().to_path_buf());
    config.distribution.enabled = true;
    config.server.startup_timeout_secs = 10;
    config.worker = worker_config();
    config
}

fn subprocess_config(dir: &TempDir) -> Config {
    let mut config = test_config(dir);
    config.server.mode = ServerMode::Subprocess;
    config.server.server_program = Some(env!("CARGO_BIN_EXE_workbroker").into());
    config
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        reply_timeout_ms: Some(10_000),
        max_retries: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
        max_consecutive_failures: 2,
        local_workers: 2,
        ..WorkerConfig::default()
    }
}

fn assert_squares(output: &Path, num_items: u64) {
    let store = MeasurementStore::load(output).unwrap();
    assert_eq!(store.image_set_count() as u64, num_items);
    for image_set in 1..=num_items {
        assert_eq!(
            store.get(image_set, "Square"),
            Some(&json!((image_set * image_set) as i64)),
            "image set {}",
            image_set
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_completes_in_process() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("aggregate.json");
    let config = test_config(&temp_dir);

    let mut distributor = Distributor::new(config.clone(), b"square".to_vec(), 6, &output);
    let url = distributor.start_serving("tcp://127.0.0.1", None).await.unwrap();
    let pipeline_path = distributor.pipeline_path().unwrap().to_string();

    let executor: Arc<dyn Executor> = Arc::new(SquareExecutor { fail_on: None });
    let summaries = run_local_workers(&url, 2, executor, &config.worker).await.unwrap();
    assert!(!summaries.is_empty());

    assert!(distributor.wait_for_exit(Duration::from_secs(5)).await);
    assert!(!distributor.is_running());

    let summary = distributor.last_summary().unwrap();
    assert_eq!(summary.jobs_finished, 6);
    assert_eq!(summary.num_remaining, 0);

    assert_squares(&output, 6);

    // The server removes the blob when it stops
    let blob_path = Url::parse(&pipeline_path).unwrap().to_file_path().unwrap();
    assert!(!blob_path.exists());
    assert!(distributor.stop_serving(false).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_job_stays_queued_until_removed() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("aggregate.json");
    let config = test_config(&temp_dir);

    let mut distributor = Distributor::new(config.clone(), b"square".to_vec(), 3, &output);
    let url = distributor.start_serving("tcp://127.0.0.1", None).await.unwrap();

    let executor = SquareExecutor { fail_on: Some(2) };
    let mut client = JobClient::new(&url, &config.worker).unwrap();
    let summary = run_worker(&mut client, &executor, &config.worker).await.unwrap();

    assert_eq!(summary.exit, WorkerExit::TooManyFailures);
    assert_eq!(summary.jobs_completed, 2);
    assert!(summary.jobs_failed >= 2);
    assert!(distributor.is_running());

    let mut operator = JobClient::new(&url, &config.worker).unwrap();
    let status = operator.get(&["num_remaining"]).await.unwrap();
    assert_eq!(status["num_remaining"], json!(1));

    assert_eq!(
        operator.remove_job(2).await.unwrap(),
        StatusReply::Success { num_remaining: None, id: Some(2) }
    );

    // Queue drained by the removal
    assert!(distributor.wait_for_exit(Duration::from_secs(5)).await);
    assert!(!distributor.is_running());

    let store = MeasurementStore::load(&output).unwrap();
    assert_eq!(store.get(1, "Square"), Some(&json!(1)));
    assert_eq!(store.get(2, "Square"), None);
    assert_eq!(store.get(3, "Square"), Some(&json!(9)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_more_workers_than_items_all_finish_cleanly() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("aggregate.json");
    let mut config = test_config(&temp_dir);
    // Default retry budget: running it down takes several seconds
    config.worker = WorkerConfig {
        reply_timeout_ms: Some(10_000),
        ..WorkerConfig::default()
    };

    let mut distributor = Distributor::new(config.clone(), b"square".to_vec(), 2, &output);
    let url = distributor.start_serving("tcp://127.0.0.1", None).await.unwrap();

    let executor: Arc<dyn Executor> = Arc::new(SlowSquareExecutor { delay: Duration::from_millis(200) });
    let started = Instant::now();
    let summaries = run_local_workers(&url, 4, executor, &config.worker).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(summaries.len(), 4);
    assert!(elapsed < Duration::from_secs(3), "workers took {:?}", elapsed);
    assert_eq!(summaries.iter().map(|s| s.jobs_completed).sum::<u64>(), 2);
    assert!(summaries.iter().any(|s| s.exit == WorkerExit::ServerClosed));

    assert!(distributor.wait_for_exit(Duration::from_secs(5)).await);
    assert_eq!(distributor.last_summary().unwrap().jobs_finished, 2);
    assert_squares(&output, 2);
}

#[tokio::test]
async fn test_stop_command_ends_server() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("aggregate.json");
    let config = test_config(&temp_dir);

    let mut distributor = Distributor::new(config.clone(), b"square".to_vec(), 4, &output);
    let url = distributor.start_serving("tcp://127.0.0.1", None).await.unwrap();
    assert!(distributor.is_running());

    let mut operator = JobClient::new(&url, &config.worker).unwrap();
    assert_eq!(operator.stop_server().await.unwrap(), StatusReply::Stopping);

    assert!(distributor.wait_for_exit(Duration::from_secs(5)).await);
    assert!(!distributor.is_running());
    assert_eq!(distributor.last_summary().unwrap().num_remaining, 4);
    assert!(distributor.stop_serving(false).await);
}

#[tokio::test]
async fn test_worker_refuses_stale_pipeline() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("aggregate.json");
    let config = test_config(&temp_dir);

    let packager = StalePackager { dir: temp_dir.path().to_path_buf() };
    let mut distributor = Distributor::new(config.clone(), b"square".to_vec(), 2, &output)
        .with_packager(Box::new(packager));
    let url = distributor.start_serving("tcp://127.0.0.1", None).await.unwrap();

    let executor = SquareExecutor { fail_on: None };
    let mut client = JobClient::new(&url, &config.worker).unwrap();
    let summary = run_worker(&mut client, &executor, &config.worker).await.unwrap();

    assert_eq!(summary.exit, WorkerExit::PipelineMismatch);
    assert_eq!(summary.jobs_completed, 0);
    assert!(!output.exists());

    assert!(distributor.stop_serving(true).await);
    assert!(!distributor.is_running());
}

#[tokio::test]
async fn test_worker_gives_up_on_dead_server() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = worker_config();
    let mut client = JobClient::new(&format!("tcp://127.0.0.1:{}", port), &config).unwrap();
    let executor = SquareExecutor { fail_on: None };

    let err = run_worker(&mut client, &executor, &config).await.unwrap_err();
    assert!(is_transport_error(&err));
}

#[tokio::test]
async fn test_run_locally_merges_every_image_set() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("local.json");

    let executor = SquareExecutor { fail_on: None };
    let done = run_locally(b"square", 5, &executor, &output).await.unwrap();

    assert_eq!(done, 5);
    assert_squares(&output, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_completes_with_subprocess_server() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("aggregate.json");
    let config = subprocess_config(&temp_dir);

    let definition = b"echo \"Square=$((WORKBROKER_IMAGE_SET * WORKBROKER_IMAGE_SET))\"\n".to_vec();
    let mut distributor = Distributor::new(config.clone(), definition, 4, &output);
    let url = distributor.start_serving("tcp://127.0.0.1", None).await.unwrap();
    assert!(distributor.is_running());
    assert_eq!(distributor.total_jobs(), 4);

    let executor: Arc<dyn Executor> = Arc::new(CommandExecutor::default());
    run_local_workers(&url, 2, executor, &config.worker).await.unwrap();

    assert!(distributor.wait_for_exit(Duration::from_secs(10)).await);
    assert!(!distributor.is_running());
    assert_squares(&output, 4);
    assert!(distributor.stop_serving(false).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_force_stop_kills_subprocess_server() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("aggregate.json");
    let config = subprocess_config(&temp_dir);

    let mut distributor = Distributor::new(config, b"square".to_vec(), 3, &output);
    let url = distributor.start_serving("tcp://127.0.0.1", None).await.unwrap();
    let blob_path = Url::parse(distributor.pipeline_path().unwrap()).unwrap().to_file_path().unwrap();
    assert!(blob_path.exists());
    assert!(distributor.is_running());

    assert!(!distributor.stop_serving(false).await);
    assert!(distributor.is_running());

    assert!(distributor.stop_serving(true).await);
    assert!(!distributor.is_running());
    assert!(!blob_path.exists());
    assert!(distributor.url().is_none());

    let mut client = JobClient::new(&url, &worker_config()).unwrap();
    let err = client.get(&["num_remaining"]).await.unwrap_err();
    assert!(is_connection_refused(&err));
}
