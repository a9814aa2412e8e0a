//! Core domain model, configuration, and shared plumbing.
//!
//! Everything here is used by both the agent and the server.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod retry;
pub mod shutdown;
pub mod types;

// Re-export commonly used types
pub use config::{AgentConfig, ServerConfig};
pub use error::{Result, TallyError};
pub use retry::{retry_with_config, RetryConfig};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use types::{Metric, MetricDto, MetricKind, MetricValue};
