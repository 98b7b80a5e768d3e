//! Table scan kernels over batch providers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ffr_planner::ScalarExpr;
use ffr_storage::BatchProvider;
use ffr_common::Result;
use tracing::debug;

use crate::eval::evaluate_predicate;
use crate::kernel::{KernelCore, PORT_DEFAULT};
use crate::rows::project_columns;

/// Full-table scan reading provider handles in order.
pub struct TableScanKernel {
    provider: Arc<dyn BatchProvider>,
    stop_after_rows: AtomicU64,
}

impl TableScanKernel {
    /// Create a scan over one provider.
    pub fn new(provider: Arc<dyn BatchProvider>) -> Self {
        Self {
            provider,
            stop_after_rows: AtomicU64::new(u64::MAX),
        }
    }

    /// Allow the scan to stop after emitting `rows` (simple scan+limit plans).
    pub fn set_stop_after_rows(&self, rows: u64) {
        self.stop_after_rows.store(rows, Ordering::Release);
    }

    pub(crate) fn detail(&self) -> String {
        format!("handles={}", self.provider.num_handles())
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let stop_after = self.stop_after_rows.load(Ordering::Acquire);
        let mut emitted = 0u64;

        for handle in 0..self.provider.num_handles() {
            core.check_cancelled()?;
            if emitted >= stop_after {
                debug!(
                    query_id = core.ctx().token().0,
                    kernel = core.id().0,
                    handles_skipped = self.provider.num_handles() - handle,
                    "scan satisfied limit early"
                );
                break;
            }
            for batch in self.provider.read_handle(handle)? {
                core.check_cancelled()?;
                emitted += batch.num_rows() as u64;
                core.emit(PORT_DEFAULT, batch)?;
                core.note_batch();
                if emitted >= stop_after {
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Scan with pushed-down projection and filter.
pub struct BindableScanKernel {
    provider: Arc<dyn BatchProvider>,
    projection: Vec<usize>,
    filter: Option<ScalarExpr>,
    stop_after_rows: AtomicU64,
}

impl BindableScanKernel {
    /// Create a bindable scan; an empty projection keeps every column.
    pub fn new(
        provider: Arc<dyn BatchProvider>,
        projection: Vec<usize>,
        filter: Option<ScalarExpr>,
    ) -> Self {
        Self {
            provider,
            projection,
            filter,
            stop_after_rows: AtomicU64::new(u64::MAX),
        }
    }

    /// Allow the scan to stop after emitting `rows`.
    pub fn set_stop_after_rows(&self, rows: u64) {
        self.stop_after_rows.store(rows, Ordering::Release);
    }

    pub(crate) fn detail(&self) -> String {
        format!(
            "handles={} projection={:?}",
            self.provider.num_handles(),
            self.projection
        )
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let stop_after = self.stop_after_rows.load(Ordering::Acquire);
        let mut emitted = 0u64;

        'handles: for handle in 0..self.provider.num_handles() {
            core.check_cancelled()?;
            if emitted >= stop_after {
                break;
            }
            for batch in self.provider.read_handle(handle)? {
                core.check_cancelled()?;
                // Filters reference pre-projection column indexes.
                let batch = match &self.filter {
                    Some(predicate) => {
                        let mask = evaluate_predicate(predicate, &batch)?;
                        arrow::compute::filter_record_batch(&batch, &mask)
                            .map_err(|e| core.err(format!("filter failed: {e}")))?
                    }
                    None => batch,
                };
                let batch = if self.projection.is_empty() {
                    batch
                } else {
                    project_columns(&batch, &self.projection)?
                };
                if batch.num_rows() == 0 {
                    core.note_batch();
                    continue;
                }
                emitted += batch.num_rows() as u64;
                core.emit(PORT_DEFAULT, batch)?;
                core.note_batch();
                if emitted >= stop_after {
                    break 'handles;
                }
            }
        }
        Ok(())
    }
}
