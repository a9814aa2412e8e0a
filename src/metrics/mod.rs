//! Metric update engine.
//!
//! Typed ingest of single and batched updates with counter accumulation,
//! shared by the HTTP and RPC entry points and the snapshot service.

pub mod service;

pub use service::{MetricService, WriteHook};
