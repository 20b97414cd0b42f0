//! workbroker - Work-distribution job broker
//!
//! workbroker splits a batch of N image sets into individually addressable jobs,
//! serves them to any number of worker processes over TCP, checks that every
//! worker runs the exact pipeline the coordinator packaged, and merges the
//! reported results into one aggregate measurement store.
//!
//! # Architecture
//!
//! - **Queue**: round-robin ledger of outstanding jobs
//! - **Pipeline**: zlib-packaged definition identified by its sha1
//! - **Distributed**: work server, distributor, client and wire protocol
//! - **Store**: measurement store the server merges results into
//! - **Worker**: pull/execute/report loop with transport retries
//! - **Executor**: runs the definition for a range of image sets

pub mod config;
pub mod distributed;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use distributed::{Distributor, JobClient, WorkServer};
pub use error::BrokerError;

/// Result type used throughout workbroker
pub type Result<T> = anyhow::Result<T>;
