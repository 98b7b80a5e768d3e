//! Batch providers feeding table-scan kernels.
//!
//! Architecture role:
//! - file parsing and storage access stay behind [`BatchProvider`];
//! - providers expose data as numbered handles (files or partitions) read on
//!   demand, so a limit-satisfied scan can stop opening further handles.

pub mod mem_provider;
pub mod parquet_provider;

pub use mem_provider::MemBatchProvider;
pub use parquet_provider::ParquetBatchProvider;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use ffr_common::Result;

/// A source of table batches, organized as independently readable handles.
///
/// A handle corresponds to one file or storage partition. Scan kernels read
/// handles in order and may stop early; providers must not do per-handle work
/// before `read_handle` is called for that handle.
pub trait BatchProvider: Send + Sync {
    /// Schema shared by every batch of every handle.
    fn schema(&self) -> SchemaRef;

    /// Number of readable handles.
    fn num_handles(&self) -> usize;

    /// Read all batches of one handle.
    fn read_handle(&self, handle: usize) -> Result<Vec<RecordBatch>>;

    /// Total row estimate across handles, when cheaply known.
    fn estimated_rows(&self) -> Option<u64> {
        None
    }
}
