//! Typed row comparison, sorting, and range-split helpers.
//!
//! Null policy is fixed: nulls compare AFTER non-nulls, for ascending and
//! descending keys alike. Supported key types are Int32, Int64, Float64,
//! Utf8, Boolean, and Date32.

use std::cmp::Ordering;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int32Array, Int64Array, StringArray,
    UInt32Array,
};
use arrow::compute::{SortColumn, SortOptions, lexsort_to_indices, take};
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use ffr_common::{FfrError, KernelId, Result};
use ffr_planner::SortDirection;

/// One sort key: column index plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    /// Column index into the batch.
    pub column: usize,
    /// Whether the key sorts descending.
    pub descending: bool,
}

/// Pair plan sort variables into [`SortKey`]s.
pub fn sort_keys(columns: &[usize], directions: &[SortDirection]) -> Vec<SortKey> {
    columns
        .iter()
        .zip(directions)
        .map(|(column, direction)| SortKey {
            column: *column,
            descending: direction.is_descending(),
        })
        .collect()
}

fn kernel_err(reason: String) -> FfrError {
    FfrError::Kernel {
        kernel_id: KernelId::HEAD,
        reason,
    }
}

/// Sort one batch by its keys (nulls last).
pub fn sort_batch(batch: &RecordBatch, keys: &[SortKey]) -> Result<RecordBatch> {
    if keys.is_empty() || batch.num_rows() == 0 {
        return Ok(batch.clone());
    }
    let columns: Vec<SortColumn> = keys
        .iter()
        .map(|key| SortColumn {
            values: batch.column(key.column).clone(),
            options: Some(SortOptions {
                descending: key.descending,
                nulls_first: false,
            }),
        })
        .collect();
    let indices = lexsort_to_indices(&columns, None)
        .map_err(|e| kernel_err(format!("sort failed: {e}")))?;
    take_batch(batch, &indices)
}

/// Gather rows of a batch by index.
pub fn take_batch(batch: &RecordBatch, indices: &UInt32Array) -> Result<RecordBatch> {
    let columns = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| kernel_err(format!("gather failed: {e}")))?;
    RecordBatch::try_new(batch.schema(), columns)
        .map_err(|e| kernel_err(format!("gathered batch build failed: {e}")))
}

/// Key columns of one batch, extracted for repeated row comparisons.
#[derive(Clone)]
pub struct KeyColumns {
    columns: Vec<ArrayRef>,
    descending: Vec<bool>,
}

impl KeyColumns {
    /// Extract the key columns of a batch.
    pub fn from_batch(batch: &RecordBatch, keys: &[SortKey]) -> Result<Self> {
        let mut columns = Vec::with_capacity(keys.len());
        for key in keys {
            if key.column >= batch.num_columns() {
                return Err(kernel_err(format!(
                    "sort key column {} out of range ({} columns)",
                    key.column,
                    batch.num_columns()
                )));
            }
            columns.push(batch.column(key.column).clone());
        }
        Ok(Self {
            columns,
            descending: keys.iter().map(|k| k.descending).collect(),
        })
    }

    /// A pivot table's columns are the keys themselves, in key order.
    pub fn from_pivot_table(pivots: &RecordBatch, keys: &[SortKey]) -> Self {
        Self {
            columns: pivots.columns().to_vec(),
            descending: keys.iter().map(|k| k.descending).collect(),
        }
    }

    /// Row count underneath the keys.
    pub fn len(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Returns whether there are no key columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Compare row `i` of `self` against row `j` of `other`.
    pub fn compare_rows(&self, i: usize, other: &KeyColumns, j: usize) -> Result<Ordering> {
        for (k, (left, right)) in self.columns.iter().zip(&other.columns).enumerate() {
            let ordering = compare_values(left, i, right, j, self.descending[k])?;
            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }
        Ok(Ordering::Equal)
    }

    /// Returns whether two rows are equal on every key (partition boundary test).
    pub fn rows_equal(&self, i: usize, other: &KeyColumns, j: usize) -> Result<bool> {
        Ok(self.compare_rows(i, other, j)? == Ordering::Equal)
    }
}

fn compare_values(
    left: &ArrayRef,
    i: usize,
    right: &ArrayRef,
    j: usize,
    descending: bool,
) -> Result<Ordering> {
    // Nulls sort after non-nulls regardless of direction.
    match (left.is_null(i), right.is_null(j)) {
        (true, true) => return Ok(Ordering::Equal),
        (true, false) => return Ok(Ordering::Greater),
        (false, true) => return Ok(Ordering::Less),
        (false, false) => {}
    }

    let natural = match (left.data_type(), right.data_type()) {
        (DataType::Int64, DataType::Int64) => {
            typed::<Int64Array>(left)?.value(i).cmp(&typed::<Int64Array>(right)?.value(j))
        }
        (DataType::Int32, DataType::Int32) => {
            typed::<Int32Array>(left)?.value(i).cmp(&typed::<Int32Array>(right)?.value(j))
        }
        (DataType::Date32, DataType::Date32) => {
            typed::<Date32Array>(left)?.value(i).cmp(&typed::<Date32Array>(right)?.value(j))
        }
        (DataType::Float64, DataType::Float64) => typed::<Float64Array>(left)?
            .value(i)
            .total_cmp(&typed::<Float64Array>(right)?.value(j)),
        (DataType::Utf8, DataType::Utf8) => {
            typed::<StringArray>(left)?.value(i).cmp(typed::<StringArray>(right)?.value(j))
        }
        (DataType::Boolean, DataType::Boolean) => {
            typed::<BooleanArray>(left)?.value(i).cmp(&typed::<BooleanArray>(right)?.value(j))
        }
        (l, r) => {
            return Err(kernel_err(format!(
                "unsupported sort key comparison between {l} and {r}"
            )))
        }
    };

    Ok(if descending { natural.reverse() } else { natural })
}

fn typed<T: 'static>(array: &ArrayRef) -> Result<&T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| kernel_err("sort key downcast failed".to_string()))
}

/// First index in sorted keys whose row compares greater than `pivot[row]`.
pub fn upper_bound(sorted: &KeyColumns, pivots: &KeyColumns, pivot_row: usize) -> Result<usize> {
    let mut low = 0usize;
    let mut high = sorted.len();
    while low < high {
        let mid = (low + high) / 2;
        if sorted.compare_rows(mid, pivots, pivot_row)? == Ordering::Greater {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    Ok(low)
}

/// Split a key-sorted batch into `pivots.len() + 1` contiguous sub-batches.
pub fn split_by_pivots(
    batch: &RecordBatch,
    keys: &[SortKey],
    pivots: &RecordBatch,
) -> Result<Vec<RecordBatch>> {
    let num_partitions = pivots.num_rows() + 1;
    if batch.num_rows() == 0 {
        let mut out = vec![batch.clone()];
        out.extend((1..num_partitions).map(|_| batch.clone()));
        return Ok(out);
    }

    let sorted_keys = KeyColumns::from_batch(batch, keys)?;
    let pivot_keys = KeyColumns::from_pivot_table(pivots, keys);

    let mut out = Vec::with_capacity(num_partitions);
    let mut start = 0usize;
    for pivot_row in 0..pivots.num_rows() {
        let end = upper_bound(&sorted_keys, &pivot_keys, pivot_row)?.max(start);
        out.push(batch.slice(start, end - start));
        start = end;
    }
    out.push(batch.slice(start, batch.num_rows() - start));
    Ok(out)
}

/// Hashable scalar view of one cell, used for group and join keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarVal {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value (Int32/Int64/Date32 widen here).
    Int(i64),
    /// Float value stored as ordered bits.
    Float(u64),
    /// String value.
    Utf8(String),
}

impl ScalarVal {
    /// Read one cell of a column.
    pub fn from_array(array: &ArrayRef, row: usize) -> Result<ScalarVal> {
        if array.is_null(row) {
            return Ok(ScalarVal::Null);
        }
        Ok(match array.data_type() {
            DataType::Boolean => ScalarVal::Bool(typed::<BooleanArray>(array)?.value(row)),
            DataType::Int32 => ScalarVal::Int(typed::<Int32Array>(array)?.value(row) as i64),
            DataType::Date32 => ScalarVal::Int(typed::<Date32Array>(array)?.value(row) as i64),
            DataType::Int64 => ScalarVal::Int(typed::<Int64Array>(array)?.value(row)),
            DataType::Float64 => {
                ScalarVal::Float(typed::<Float64Array>(array)?.value(row).to_bits())
            }
            DataType::Utf8 => ScalarVal::Utf8(typed::<StringArray>(array)?.value(row).to_string()),
            other => {
                return Err(kernel_err(format!("unsupported key type {other}")));
            }
        })
    }

    /// Read one row of several columns.
    pub fn row_key(columns: &[ArrayRef], row: usize) -> Result<Vec<ScalarVal>> {
        columns
            .iter()
            .map(|c| ScalarVal::from_array(c, row))
            .collect()
    }
}

/// Concatenate batches sharing a schema; `None` when the input is empty.
pub fn concat_all(batches: &[RecordBatch]) -> Result<Option<RecordBatch>> {
    let Some(first) = batches.first() else {
        return Ok(None);
    };
    if batches.len() == 1 {
        return Ok(Some(first.clone()));
    }
    arrow::compute::concat_batches(&first.schema(), batches)
        .map(Some)
        .map_err(|e| kernel_err(format!("concat failed: {e}")))
}

/// Project a batch to the given column indexes.
pub fn project_columns(batch: &RecordBatch, indexes: &[usize]) -> Result<RecordBatch> {
    batch
        .project(indexes)
        .map_err(|e| kernel_err(format!("projection failed: {e}")))
}

/// Build a `UInt32Array` of gather indices.
pub fn gather_indices(indexes: impl IntoIterator<Item = u32>) -> UInt32Array {
    UInt32Array::from(indexes.into_iter().collect::<Vec<_>>())
}

/// Columns of a batch selected by index, cloned as refs.
pub fn select_columns(batch: &RecordBatch, indexes: &[usize]) -> Vec<ArrayRef> {
    indexes
        .iter()
        .map(|i| Arc::clone(batch.column(*i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use arrow_schema::{Field, Schema};

    use super::*;

    fn batch(values: Vec<Option<i64>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).expect("batch")
    }

    fn values(batch: &RecordBatch) -> Vec<Option<i64>> {
        batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("ints")
            .iter()
            .collect()
    }

    #[test]
    fn sorts_with_nulls_last_in_both_directions() {
        let input = batch(vec![Some(3), None, Some(1), Some(2)]);
        let keys = vec![SortKey {
            column: 0,
            descending: false,
        }];
        let ascending = sort_batch(&input, &keys).expect("sort");
        assert_eq!(values(&ascending), vec![Some(1), Some(2), Some(3), None]);

        let keys = vec![SortKey {
            column: 0,
            descending: true,
        }];
        let descending = sort_batch(&input, &keys).expect("sort");
        assert_eq!(values(&descending), vec![Some(3), Some(2), Some(1), None]);
    }

    #[test]
    fn split_by_pivots_produces_contiguous_ranges() {
        let sorted = batch(vec![Some(1), Some(3), Some(5), Some(7), Some(9)]);
        let pivots = batch(vec![Some(4), Some(7)]);
        let keys = vec![SortKey {
            column: 0,
            descending: false,
        }];

        let parts = split_by_pivots(&sorted, &keys, &pivots).expect("split");
        assert_eq!(parts.len(), 3);
        assert_eq!(values(&parts[0]), vec![Some(1), Some(3)]);
        assert_eq!(values(&parts[1]), vec![Some(5), Some(7)]);
        assert_eq!(values(&parts[2]), vec![Some(9)]);
    }

    #[test]
    fn upper_bound_counts_rows_at_or_below_pivot() {
        let sorted = batch(vec![Some(1), Some(2), Some(2), Some(5)]);
        let pivots = batch(vec![Some(2)]);
        let keys = vec![SortKey {
            column: 0,
            descending: false,
        }];
        let sorted_keys = KeyColumns::from_batch(&sorted, &keys).expect("keys");
        let pivot_keys = KeyColumns::from_pivot_table(&pivots, &keys);
        assert_eq!(upper_bound(&sorted_keys, &pivot_keys, 0).expect("bound"), 3);
    }
}
