//! Terminal kernel accumulating the query's result batches.

use std::sync::Mutex;

use arrow::record_batch::RecordBatch;
use ffr_common::{FfrError, Result};

use crate::kernel::{KernelCore, PORT_DEFAULT};

/// Accumulates final batches in arrival order; `release` yields them once.
pub struct OutputKernel {
    results: Mutex<Option<Vec<RecordBatch>>>,
}

impl OutputKernel {
    /// Create an empty output sink.
    pub fn new() -> Self {
        Self {
            results: Mutex::new(Some(Vec::new())),
        }
    }

    pub(crate) fn detail(&self) -> String {
        String::new()
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let input = core.input(PORT_DEFAULT)?;
        while let Some(batch) = input.pull()? {
            core.check_cancelled()?;
            core.note_batch();
            let mut results = self.results.lock().expect("output results poisoned");
            match results.as_mut() {
                Some(acc) => acc.push(batch),
                None => return Err(FfrError::AlreadyReleased),
            }
        }
        Ok(())
    }

    /// Take the accumulated result set; fails on a second call.
    pub fn release(&self) -> Result<Vec<RecordBatch>> {
        self.results
            .lock()
            .expect("output results poisoned")
            .take()
            .ok_or(FfrError::AlreadyReleased)
    }
}

impl Default for OutputKernel {
    fn default() -> Self {
        Self::new()
    }
}
