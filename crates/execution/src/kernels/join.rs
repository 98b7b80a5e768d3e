//! Hash equi-join: build side is consumed fully, probe side streams.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema};
use ffr_common::Result;

use crate::kernel::{KernelCore, PORT_BUILD, PORT_DEFAULT, PORT_PROBE};
use crate::rows::{ScalarVal, concat_all, gather_indices, select_columns, take_batch};

/// Inner hash equi-join kernel.
pub struct JoinKernel {
    build_keys: Vec<usize>,
    probe_keys: Vec<usize>,
}

impl JoinKernel {
    /// Create a join on positional key pairs (build side = left plan child).
    pub fn new(build_keys: Vec<usize>, probe_keys: Vec<usize>) -> Self {
        Self {
            build_keys,
            probe_keys,
        }
    }

    pub(crate) fn detail(&self) -> String {
        format!("keys={}", self.build_keys.len())
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let build_input = core.input(PORT_BUILD)?;
        let mut build_batches = Vec::new();
        while let Some(batch) = build_input.pull()? {
            core.check_cancelled()?;
            core.note_batch();
            build_batches.push(batch);
        }

        let Some(build) = concat_all(&build_batches)? else {
            // Empty build side: inner join emits nothing; drain the probe.
            let probe_input = core.input(PORT_PROBE)?;
            while probe_input.pull()?.is_some() {
                core.check_cancelled()?;
                core.note_batch();
            }
            return Ok(());
        };

        let build_key_columns = select_columns(&build, &self.build_keys);
        let mut table: HashMap<Vec<ScalarVal>, Vec<u32>> = HashMap::new();
        for row in 0..build.num_rows() {
            let key = ScalarVal::row_key(&build_key_columns, row)?;
            // NULL keys never match in an equi-join.
            if key.iter().any(|v| matches!(v, ScalarVal::Null)) {
                continue;
            }
            table.entry(key).or_default().push(row as u32);
        }

        let probe_input = core.input(PORT_PROBE)?;
        while let Some(probe) = probe_input.pull()? {
            core.check_cancelled()?;
            core.note_batch();

            let probe_key_columns = select_columns(&probe, &self.probe_keys);
            let mut build_rows = Vec::new();
            let mut probe_rows = Vec::new();
            for row in 0..probe.num_rows() {
                let key = ScalarVal::row_key(&probe_key_columns, row)?;
                if key.iter().any(|v| matches!(v, ScalarVal::Null)) {
                    continue;
                }
                if let Some(matches) = table.get(&key) {
                    for build_row in matches {
                        build_rows.push(*build_row);
                        probe_rows.push(row as u32);
                    }
                }
            }
            if build_rows.is_empty() {
                continue;
            }

            let left = take_batch(&build, &gather_indices(build_rows))?;
            let right = take_batch(&probe, &gather_indices(probe_rows))?;
            core.emit(PORT_DEFAULT, combine(core, &left, &right)?)?;
        }
        Ok(())
    }
}

/// Concatenate the columns of two equal-length batches.
fn combine(core: &KernelCore, left: &RecordBatch, right: &RecordBatch) -> Result<RecordBatch> {
    let mut fields: Vec<Field> = Vec::with_capacity(left.num_columns() + right.num_columns());
    let mut columns = Vec::with_capacity(left.num_columns() + right.num_columns());
    for (field, column) in left.schema().fields().iter().zip(left.columns()) {
        fields.push(field.as_ref().clone());
        columns.push(Arc::clone(column));
    }
    for (field, column) in right.schema().fields().iter().zip(right.columns()) {
        fields.push(field.as_ref().clone());
        columns.push(Arc::clone(column));
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(|e| core.err(format!("joined batch build failed: {e}")))
}
