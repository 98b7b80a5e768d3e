//! Window functions over partition/order keys.
//!
//! The kernel stages its whole input, sorts by the combined
//! partition-then-order key set, and computes each call over full partition
//! frames. An `OVER (ORDER BY …)` clause without `PARTITION BY` runs as a
//! single whole-input partition; in a cluster the upstream hash
//! distribution has already given this node partition-complete (or, with no
//! partition keys, whole-input) data.

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Builder};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use ffr_common::Result;
use ffr_planner::{AggFunction, WindowFunction, WindowProjection, WindowVars};

use crate::kernel::{KernelCore, PORT_DEFAULT};
use crate::kernels::aggregate::{AccState, accumulate, build_scalar_column, output_type};
use crate::rows::{KeyColumns, ScalarVal, SortKey, concat_all, sort_batch, sort_keys};

/// Window compute kernel.
pub struct WindowKernel {
    vars: WindowVars,
    projection: WindowProjection,
}

impl WindowKernel {
    /// Create the kernel from parsed over-clause variables and calls.
    pub fn new(vars: WindowVars, projection: WindowProjection) -> Self {
        Self { vars, projection }
    }

    pub(crate) fn detail(&self) -> String {
        format!(
            "partition={:?} order={:?}",
            self.vars.partition_columns, self.vars.order_columns
        )
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let input = core.input(PORT_DEFAULT)?;
        let mut staged = Vec::new();
        while let Some(batch) = input.pull()? {
            core.check_cancelled()?;
            core.note_batch();
            staged.push(batch);
        }
        let Some(all) = concat_all(&staged)? else {
            return Ok(());
        };

        let (key_columns, key_directions) = self.vars.combined_sort_keys();
        let sorted = sort_batch(&all, &sort_keys(&key_columns, &key_directions))?;

        let partition_keys = KeyColumns::from_batch(
            &sorted,
            &self
                .vars
                .partition_columns
                .iter()
                .map(|c| SortKey {
                    column: *c,
                    descending: false,
                })
                .collect::<Vec<_>>(),
        )?;

        let output = self.compute(core, &sorted, &partition_keys)?;
        core.emit(PORT_DEFAULT, output)?;
        Ok(())
    }

    fn compute(
        &self,
        core: &KernelCore,
        sorted: &RecordBatch,
        partition_keys: &KeyColumns,
    ) -> Result<RecordBatch> {
        let rows = sorted.num_rows();
        let schema = sorted.schema();

        let mut fields = Vec::new();
        let mut columns: Vec<ArrayRef> = Vec::new();
        for passthrough in &self.projection.passthrough {
            let field = schema.field(passthrough.input);
            fields.push(Field::new(
                &passthrough.output_name,
                field.data_type().clone(),
                field.is_nullable(),
            ));
            columns.push(Arc::clone(sorted.column(passthrough.input)));
        }

        // Partition ranges: consecutive rows equal on every partition key.
        // No partition keys means one whole-input partition.
        let mut ranges = Vec::new();
        if rows > 0 {
            let mut start = 0usize;
            for row in 1..rows {
                let boundary = !partition_keys.is_empty()
                    && !partition_keys.rows_equal(row - 1, partition_keys, row)?;
                if boundary {
                    ranges.push((start, row));
                    start = row;
                }
            }
            ranges.push((start, rows));
        }

        for call in &self.projection.calls {
            let column: ArrayRef = match call.function {
                WindowFunction::RowNumber => {
                    let mut builder = Int64Builder::with_capacity(rows);
                    for (start, end) in &ranges {
                        for offset in 0..(end - start) {
                            builder.append_value(offset as i64 + 1);
                        }
                    }
                    Arc::new(builder.finish())
                }
                WindowFunction::Min
                | WindowFunction::Max
                | WindowFunction::Sum
                | WindowFunction::Count
                | WindowFunction::Avg => {
                    let function = aggregate_function(call.function);
                    let input_type = match call.input {
                        Some(i) => schema.field(i).data_type().clone(),
                        None => DataType::Int64,
                    };
                    let input_column = call.input.map(|i| Arc::clone(sorted.column(i)));
                    let out_type = output_type(function, &input_type);

                    // One accumulator per partition, replicated across its rows.
                    let mut per_row: Vec<ScalarVal> = Vec::with_capacity(rows);
                    for (start, end) in &ranges {
                        let mut state = match function {
                            AggFunction::Min | AggFunction::Max => AccState::MinMax(None),
                            _ => AccState::Numeric {
                                int: 0,
                                float: 0.0,
                                count: 0,
                            },
                        };
                        for row in *start..*end {
                            let value = match &input_column {
                                Some(column) => Some(ScalarVal::from_array(column, row)?),
                                None => None,
                            };
                            accumulate(&mut state, function, value, core)?;
                        }
                        let result = finish_state(&state, function, &out_type);
                        per_row.extend(std::iter::repeat_n(result, end - start));
                    }

                    let refs: Vec<&ScalarVal> = per_row.iter().collect();
                    build_scalar_column(core, &out_type, &refs)?
                }
            };
            fields.push(Field::new(&call.output_name, column.data_type().clone(), true));
            columns.push(column);
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(|e| core.err(format!("window output build failed: {e}")))
    }
}

fn aggregate_function(function: WindowFunction) -> AggFunction {
    match function {
        WindowFunction::Min => AggFunction::Min,
        WindowFunction::Max => AggFunction::Max,
        WindowFunction::Sum => AggFunction::Sum,
        WindowFunction::Count => AggFunction::Count,
        WindowFunction::Avg => AggFunction::Avg,
        WindowFunction::RowNumber => unreachable!("row_number has no aggregate counterpart"),
    }
}

fn finish_state(state: &AccState, function: AggFunction, out_type: &DataType) -> ScalarVal {
    match (state, function) {
        (AccState::Numeric { count, .. }, AggFunction::Count) => ScalarVal::Int(*count as i64),
        (AccState::Numeric { count, .. }, _) if *count == 0 => ScalarVal::Null,
        (AccState::Numeric { int, float, .. }, AggFunction::Sum) => {
            if out_type == &DataType::Int64 {
                ScalarVal::Int(*int)
            } else {
                ScalarVal::Float(float.to_bits())
            }
        }
        (AccState::Numeric { float, count, .. }, AggFunction::Avg) => {
            ScalarVal::Float((float / *count as f64).to_bits())
        }
        (AccState::MinMax(Some(value)), _) => value.clone(),
        _ => ScalarVal::Null,
    }
}
