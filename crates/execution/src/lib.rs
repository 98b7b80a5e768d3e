//! Dataflow execution core: kernels linked by bounded caches, scheduled on
//! a fixed-size worker pool, with distributed operators exchanging
//! partitions over the transport.
//!
//! Architecture role:
//! - [`cache`]: bounded FIFO caches with backpressure, fusing, sub-queues,
//!   and transparent spill slots
//! - [`kernel`] / [`kernels`]: the operator variants and their harness
//! - [`graph`]: DAG wiring, topological scheduling, error slot, progress
//! - [`builder`]: textual plan to graph construction
//! - [`memory`]: the memory monitor (spill and throttle commands)
//! - [`exchange`]: per-query message routing over the transport
//! - [`context`]: per-query shared state
//! - [`spill`]: versioned spill file format
//! - [`rows`] / [`eval`]: typed row comparison and scalar evaluation

pub mod builder;
pub mod cache;
pub mod context;
pub mod eval;
pub mod exchange;
pub mod graph;
pub mod kernel;
pub mod kernels;
pub mod memory;
pub mod rows;
pub mod spill;

pub use builder::build_graph;
pub use cache::{BatchCache, CacheKind, CacheSettings, batch_bytes};
pub use context::{NodeInfo, QueryContext};
pub use exchange::{Exchange, MessageRouter};
pub use graph::{Edge, Graph, GraphProgress, KernelProgress, ProgressCallback};
pub use kernel::{Kernel, KernelCore, KernelState, KernelVariant};
pub use spill::{SpilledSlot, read_spill, write_spill};
