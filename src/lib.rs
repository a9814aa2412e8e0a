//! Tally - runtime and host metrics with an authenticated ingest server.
//!
//! The agent samples allocator and host statistics on a poll interval and
//! reports them on a report interval. The server accepts reports over HTTP
//! and RPC and keeps them in memory or in SQLite.
//!
//! # Features
//!
//! - **Two surfaces**: JSON over HTTP and protobuf over GRPC, same semantics
//! - **Integrity**: HMAC-SHA256 request and response signatures
//! - **Confidentiality**: optional RSA-OAEP encrypted request bodies
//! - **Durability**: periodic or write-through JSON snapshots
//! - **Resilience**: bounded retries with exponential backoff
//!
//! # Architecture
//!
//! - `core`: metric model, configuration, errors, retries and shutdown
//! - `security`: signatures, encryption and the subnet filter
//! - `storage`: metric stores and snapshots
//! - `metrics`: metric semantics over a store
//! - `receiver`: HTTP and RPC ingest
//! - `agent`: collection and reporting
//! - `cli`: command-line front-ends
//!
//! # Example
//!
//! ```no_run
//! use tally_lib::core::{ServerConfig, ShutdownSignal};
//! use tally_lib::receiver::IngestServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = IngestServer::new(ServerConfig::default()).await?;
//!     let (_trigger, shutdown) = ShutdownSignal::new();
//!     server.run(shutdown).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod agent;
pub mod cli;
pub mod core;
pub mod metrics;
pub mod receiver;
pub mod security;
pub mod storage;

// Re-export core types for convenience
pub use crate::core::{Result, TallyError};
