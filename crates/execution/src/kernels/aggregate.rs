//! Grouped and global hash aggregation.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use ffr_common::Result;
use ffr_planner::{AggFunction, AggregateVars};

use crate::kernel::{KernelCore, PORT_DEFAULT};
use crate::rows::{ScalarVal, select_columns};

/// Numeric accumulator state for one `(group, call)` pair.
#[derive(Debug, Clone)]
pub(crate) enum AccState {
    Numeric {
        int: i64,
        float: f64,
        count: u64,
    },
    MinMax(Option<ScalarVal>),
}

/// Hash aggregation over group keys.
pub struct AggregateKernel {
    vars: AggregateVars,
}

impl AggregateKernel {
    /// Create an aggregation from parsed plan variables.
    pub fn new(vars: AggregateVars) -> Self {
        Self { vars }
    }

    pub(crate) fn detail(&self) -> String {
        format!(
            "groups={:?} calls={}",
            self.vars.group_columns,
            self.vars.calls.len()
        )
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let input = core.input(PORT_DEFAULT)?;

        let mut group_order: Vec<Vec<ScalarVal>> = Vec::new();
        let mut group_index: HashMap<Vec<ScalarVal>, usize> = HashMap::new();
        let mut states: Vec<Vec<AccState>> = Vec::new();
        let mut group_schema: Option<Vec<(String, DataType)>> = None;
        let mut input_types: Vec<DataType> = Vec::new();

        while let Some(batch) = input.pull()? {
            core.check_cancelled()?;
            core.note_batch();

            if group_schema.is_none() {
                let schema = batch.schema();
                group_schema = Some(
                    self.vars
                        .group_columns
                        .iter()
                        .map(|i| {
                            let field = schema.field(*i);
                            (field.name().clone(), field.data_type().clone())
                        })
                        .collect(),
                );
                input_types = self
                    .vars
                    .calls
                    .iter()
                    .map(|call| match call.input {
                        Some(i) => schema.field(i).data_type().clone(),
                        None => DataType::Int64,
                    })
                    .collect();
            }

            let key_columns = select_columns(&batch, &self.vars.group_columns);
            let value_columns: Vec<Option<ArrayRef>> = self
                .vars
                .calls
                .iter()
                .map(|call| call.input.map(|i| Arc::clone(batch.column(i))))
                .collect();

            for row in 0..batch.num_rows() {
                let key = ScalarVal::row_key(&key_columns, row)?;
                let slot = match group_index.get(&key) {
                    Some(slot) => *slot,
                    None => {
                        let slot = group_order.len();
                        group_index.insert(key.clone(), slot);
                        group_order.push(key);
                        states.push(
                            self.vars
                                .calls
                                .iter()
                                .map(|call| match call.function {
                                    AggFunction::Min | AggFunction::Max => AccState::MinMax(None),
                                    _ => AccState::Numeric {
                                        int: 0,
                                        float: 0.0,
                                        count: 0,
                                    },
                                })
                                .collect(),
                        );
                        slot
                    }
                };

                for (call_idx, call) in self.vars.calls.iter().enumerate() {
                    let value = match &value_columns[call_idx] {
                        Some(column) => Some(ScalarVal::from_array(column, row)?),
                        None => None,
                    };
                    accumulate(
                        &mut states[slot][call_idx],
                        call.function,
                        value,
                        core,
                    )?;
                }
            }
        }

        // No input at all: nothing to describe, nothing to emit.
        let Some(group_schema) = group_schema else {
            return Ok(());
        };

        let output = self.build_output(core, &group_schema, &input_types, &group_order, &states)?;
        core.emit(PORT_DEFAULT, output)?;
        Ok(())
    }

    fn build_output(
        &self,
        core: &KernelCore,
        group_schema: &[(String, DataType)],
        input_types: &[DataType],
        group_order: &[Vec<ScalarVal>],
        states: &[Vec<AccState>],
    ) -> Result<RecordBatch> {
        let num_groups = group_order.len();
        let mut fields = Vec::new();
        let mut columns: Vec<ArrayRef> = Vec::new();

        for (key_idx, (name, data_type)) in group_schema.iter().enumerate() {
            let values: Vec<&ScalarVal> = group_order.iter().map(|key| &key[key_idx]).collect();
            let column = build_scalar_column(core, data_type, &values)?;
            fields.push(Field::new(name, data_type.clone(), true));
            columns.push(column);
        }

        for (call_idx, call) in self.vars.calls.iter().enumerate() {
            let out_type = output_type(call.function, &input_types[call_idx]);
            let mut int_builder = Int64Builder::with_capacity(num_groups);
            let mut float_builder = Float64Builder::with_capacity(num_groups);
            let mut min_max: Vec<&AccState> = Vec::with_capacity(num_groups);

            for state in states {
                min_max.push(&state[call_idx]);
            }

            let column: ArrayRef = match (call.function, &out_type) {
                (AggFunction::Count, _) => {
                    for state in &min_max {
                        let AccState::Numeric { count, .. } = state else {
                            return Err(core.err("count state mismatch"));
                        };
                        int_builder.append_value(*count as i64);
                    }
                    Arc::new(int_builder.finish())
                }
                (AggFunction::Sum, DataType::Int64) => {
                    for state in &min_max {
                        let AccState::Numeric { int, count, .. } = state else {
                            return Err(core.err("sum state mismatch"));
                        };
                        if *count == 0 {
                            int_builder.append_null();
                        } else {
                            int_builder.append_value(*int);
                        }
                    }
                    Arc::new(int_builder.finish())
                }
                (AggFunction::Sum, _) => {
                    for state in &min_max {
                        let AccState::Numeric { float, count, .. } = state else {
                            return Err(core.err("sum state mismatch"));
                        };
                        if *count == 0 {
                            float_builder.append_null();
                        } else {
                            float_builder.append_value(*float);
                        }
                    }
                    Arc::new(float_builder.finish())
                }
                (AggFunction::Avg, _) => {
                    for state in &min_max {
                        let AccState::Numeric { float, count, .. } = state else {
                            return Err(core.err("avg state mismatch"));
                        };
                        if *count == 0 {
                            float_builder.append_null();
                        } else {
                            float_builder.append_value(*float / *count as f64);
                        }
                    }
                    Arc::new(float_builder.finish())
                }
                (AggFunction::Min | AggFunction::Max, data_type) => {
                    const NULL: ScalarVal = ScalarVal::Null;
                    let values: Vec<&ScalarVal> = min_max
                        .iter()
                        .map(|state| match state {
                            AccState::MinMax(Some(v)) => v,
                            _ => &NULL,
                        })
                        .collect();
                    build_scalar_column(core, data_type, &values)?
                }
            };
            fields.push(Field::new(&call.output_name, out_type, true));
            columns.push(column);
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
            .map_err(|e| core.err(format!("aggregate output build failed: {e}")))
    }
}

pub(crate) fn output_type(function: AggFunction, input: &DataType) -> DataType {
    match function {
        AggFunction::Count => DataType::Int64,
        AggFunction::Avg => DataType::Float64,
        AggFunction::Sum => match input {
            DataType::Float64 => DataType::Float64,
            _ => DataType::Int64,
        },
        AggFunction::Min | AggFunction::Max => input.clone(),
    }
}

pub(crate) fn accumulate(
    state: &mut AccState,
    function: AggFunction,
    value: Option<ScalarVal>,
    core: &KernelCore,
) -> Result<()> {
    match function {
        AggFunction::Count => {
            // COUNT() counts rows; COUNT($i) counts non-null values.
            let counts = match &value {
                None => true,
                Some(ScalarVal::Null) => false,
                Some(_) => true,
            };
            if counts {
                let AccState::Numeric { count, .. } = state else {
                    return Err(core.err("count state mismatch"));
                };
                *count += 1;
            }
        }
        AggFunction::Sum | AggFunction::Avg => {
            let AccState::Numeric { int, float, count } = state else {
                return Err(core.err("numeric state mismatch"));
            };
            match value {
                Some(ScalarVal::Int(v)) => {
                    *int += v;
                    *float += v as f64;
                    *count += 1;
                }
                Some(ScalarVal::Float(bits)) => {
                    *float += f64::from_bits(bits);
                    *count += 1;
                }
                Some(ScalarVal::Null) | None => {}
                Some(other) => {
                    return Err(core.err(format!("cannot sum value {other:?}")));
                }
            }
        }
        AggFunction::Min | AggFunction::Max => {
            let AccState::MinMax(current) = state else {
                return Err(core.err("min/max state mismatch"));
            };
            let Some(value) = value else {
                return Err(core.err("min/max requires an input column"));
            };
            if matches!(value, ScalarVal::Null) {
                return Ok(());
            }
            let replace = match current {
                None => true,
                Some(existing) => {
                    let ordering = scalar_cmp(existing, &value, core)?;
                    if function == AggFunction::Min {
                        ordering == std::cmp::Ordering::Greater
                    } else {
                        ordering == std::cmp::Ordering::Less
                    }
                }
            };
            if replace {
                *current = Some(value);
            }
        }
    }
    Ok(())
}

fn scalar_cmp(a: &ScalarVal, b: &ScalarVal, core: &KernelCore) -> Result<std::cmp::Ordering> {
    use std::cmp::Ordering;
    Ok(match (a, b) {
        (ScalarVal::Int(x), ScalarVal::Int(y)) => x.cmp(y),
        (ScalarVal::Float(x), ScalarVal::Float(y)) => {
            f64::from_bits(*x).total_cmp(&f64::from_bits(*y))
        }
        (ScalarVal::Utf8(x), ScalarVal::Utf8(y)) => x.cmp(y),
        (ScalarVal::Bool(x), ScalarVal::Bool(y)) => x.cmp(y),
        (ScalarVal::Null, ScalarVal::Null) => Ordering::Equal,
        _ => return Err(core.err("mismatched scalar comparison")),
    })
}

pub(crate) fn build_scalar_column(
    core: &KernelCore,
    data_type: &DataType,
    values: &[&ScalarVal],
) -> Result<ArrayRef> {
    Ok(match data_type {
        DataType::Int64 | DataType::Int32 | DataType::Date32 => {
            let mut builder = Int64Builder::with_capacity(values.len());
            for value in values {
                match value {
                    ScalarVal::Int(v) => builder.append_value(*v),
                    ScalarVal::Null => builder.append_null(),
                    other => return Err(core.err(format!("expected int, got {other:?}"))),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::with_capacity(values.len());
            for value in values {
                match value {
                    ScalarVal::Float(bits) => builder.append_value(f64::from_bits(*bits)),
                    ScalarVal::Int(v) => builder.append_value(*v as f64),
                    ScalarVal::Null => builder.append_null(),
                    other => return Err(core.err(format!("expected float, got {other:?}"))),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Utf8 => {
            let mut builder = StringBuilder::new();
            for value in values {
                match value {
                    ScalarVal::Utf8(v) => builder.append_value(v),
                    ScalarVal::Null => builder.append_null(),
                    other => return Err(core.err(format!("expected string, got {other:?}"))),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::new();
            for value in values {
                match value {
                    ScalarVal::Bool(v) => builder.append_value(*v),
                    ScalarVal::Null => builder.append_null(),
                    other => return Err(core.err(format!("expected bool, got {other:?}"))),
                }
            }
            Arc::new(builder.finish())
        }
        other => return Err(core.err(format!("unsupported aggregate output type {other}"))),
    })
}
