use std::sync::atomic::{AtomicUsize, Ordering};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use ffr_common::{FfrError, Result};

use crate::BatchProvider;

/// In-memory provider where each handle is a pre-built list of batches.
///
/// Tracks how many handles have been opened, which lets scan short-circuit
/// behavior be observed directly.
pub struct MemBatchProvider {
    schema: SchemaRef,
    handles: Vec<Vec<RecordBatch>>,
    opened: AtomicUsize,
}

impl MemBatchProvider {
    /// Create a provider from per-handle batch lists sharing one schema.
    pub fn new(schema: SchemaRef, handles: Vec<Vec<RecordBatch>>) -> Self {
        Self {
            schema,
            handles,
            opened: AtomicUsize::new(0),
        }
    }

    /// Single-handle convenience constructor.
    pub fn single(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self::new(schema, vec![batches])
    }

    /// Number of handles read so far.
    pub fn handles_opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }
}

impl BatchProvider for MemBatchProvider {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn num_handles(&self) -> usize {
        self.handles.len()
    }

    fn read_handle(&self, handle: usize) -> Result<Vec<RecordBatch>> {
        let batches = self.handles.get(handle).ok_or_else(|| FfrError::Kernel {
            kernel_id: ffr_common::KernelId::HEAD,
            reason: format!("handle {handle} out of range"),
        })?;
        self.opened.fetch_add(1, Ordering::AcqRel);
        Ok(batches.clone())
    }

    fn estimated_rows(&self) -> Option<u64> {
        Some(
            self.handles
                .iter()
                .flatten()
                .map(|b| b.num_rows() as u64)
                .sum(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn counts_opened_handles() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1_i64, 2]))],
        )
        .expect("batch");
        let provider = MemBatchProvider::new(schema, vec![vec![batch.clone()], vec![batch]]);

        assert_eq!(provider.num_handles(), 2);
        assert_eq!(provider.handles_opened(), 0);
        let got = provider.read_handle(0).expect("read");
        assert_eq!(got.len(), 1);
        assert_eq!(provider.handles_opened(), 1);
        assert_eq!(provider.estimated_rows(), Some(4));
    }
}
