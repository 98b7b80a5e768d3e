#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for FFR crates.
//!
//! Architecture role:
//! - defines engine/runtime configuration passed across layers
//! - provides common [`FfrError`] / [`Result`] contracts
//! - hosts the metrics registry shared by caches, kernels, and the transport
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Engine configuration and recognized option-map keys.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::EngineConfig;
pub use error::{FfrError, ResourceKind, Result, TransportErrorKind, TransportStage};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
