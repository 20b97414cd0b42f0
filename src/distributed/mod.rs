//! Distributed mode implementation
//!
//! # Architecture
//!
//! workbroker distributes a batch through one work server:
//!
//! - **Distributor**: builds the job queue, spawns the work server, watches it
//! - **Work server**: serves jobs, validates and merges results, one request at a time
//! - **Clients**: worker loops and operators talking to the server
//!
//! # Modules
//!
//! - `protocol`: Message definitions and framing
//! - `transport`: Addresses and deadline-bounded socket operations
//! - `work_server`: The request/reply loop
//! - `session`: Subprocess entry for the work server
//! - `distributor`: Coordinator-side lifecycle
//! - `client`: Worker and operator client

pub mod client;
pub mod distributor;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod work_server;

// Re-export key types
pub use client::{ClientJobView, JobClient};
pub use distributor::Distributor;
pub use protocol::{
    Command,
    JobAssignment,
    Reply,
    Request,
    ResultReport,
    StatusReply,
    GET_KEYS,
};
pub use transport::Endpoint;
pub use work_server::{ServerStartup, ServerState, ServerSummary, WorkServer};
