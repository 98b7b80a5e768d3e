//! Scalar expression evaluation over record batches.
//!
//! Evaluates the plan's prefix-call expressions using the arrow compute
//! kernels: comparisons and arithmetic broadcast through `Datum`, boolean
//! combinators work on materialized masks. Mixed Int64/Float64 operands are
//! coerced to Float64 before the kernel runs.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Datum, Float64Array, Int64Array, StringArray};
use arrow::compute::kernels::cmp;
use arrow::compute::kernels::numeric;
use arrow::compute::{and, cast, not, or};
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use ffr_common::{FfrError, KernelId, Result};
use ffr_planner::{ScalarExpr, ScalarOp};

fn eval_err(reason: String) -> FfrError {
    FfrError::Kernel {
        kernel_id: KernelId::HEAD,
        reason,
    }
}

/// An evaluated expression: a full column or a broadcastable scalar.
enum Value {
    Array(ArrayRef),
    Scalar(ArrayRef),
}

impl Value {
    fn datum(&self) -> DatumView<'_> {
        match self {
            Value::Array(a) => DatumView {
                array: a,
                scalar: false,
            },
            Value::Scalar(a) => DatumView {
                array: a,
                scalar: true,
            },
        }
    }

    fn data_type(&self) -> &DataType {
        match self {
            Value::Array(a) | Value::Scalar(a) => a.data_type(),
        }
    }

    fn into_array(self, rows: usize) -> Result<ArrayRef> {
        match self {
            Value::Array(a) => Ok(a),
            Value::Scalar(a) => {
                let indices = arrow::array::UInt32Array::from(vec![0u32; rows]);
                arrow::compute::take(a.as_ref(), &indices, None)
                    .map_err(|e| eval_err(format!("scalar broadcast failed: {e}")))
            }
        }
    }
}

/// Array-or-scalar view presented to the broadcasting compute kernels.
struct DatumView<'a> {
    array: &'a ArrayRef,
    scalar: bool,
}

impl Datum for DatumView<'_> {
    fn get(&self) -> (&dyn Array, bool) {
        (self.array.as_ref(), self.scalar)
    }
}

/// Evaluate an expression to a column of `batch.num_rows()` values.
pub fn evaluate(expr: &ScalarExpr, batch: &RecordBatch) -> Result<ArrayRef> {
    eval_value(expr, batch)?.into_array(batch.num_rows())
}

/// Evaluate a predicate to a boolean mask over the batch.
pub fn evaluate_predicate(expr: &ScalarExpr, batch: &RecordBatch) -> Result<BooleanArray> {
    let mask = evaluate(expr, batch)?;
    mask.as_any()
        .downcast_ref::<BooleanArray>()
        .cloned()
        .ok_or_else(|| eval_err("predicate did not evaluate to booleans".to_string()))
}

fn eval_value(expr: &ScalarExpr, batch: &RecordBatch) -> Result<Value> {
    match expr {
        ScalarExpr::ColumnRef(i) => {
            if *i >= batch.num_columns() {
                return Err(eval_err(format!(
                    "column reference ${i} out of range ({} columns)",
                    batch.num_columns()
                )));
            }
            Ok(Value::Array(batch.column(*i).clone()))
        }
        ScalarExpr::LiteralInt(v) => Ok(Value::Scalar(Arc::new(Int64Array::from(vec![*v])))),
        ScalarExpr::LiteralFloat(v) => Ok(Value::Scalar(Arc::new(Float64Array::from(vec![*v])))),
        ScalarExpr::LiteralUtf8(v) => {
            Ok(Value::Scalar(Arc::new(StringArray::from(vec![v.clone()]))))
        }
        ScalarExpr::LiteralBool(v) => Ok(Value::Scalar(Arc::new(BooleanArray::from(vec![*v])))),
        ScalarExpr::Call { op, args } => eval_call(*op, args, batch),
    }
}

fn eval_call(op: ScalarOp, args: &[ScalarExpr], batch: &RecordBatch) -> Result<Value> {
    match op {
        ScalarOp::And | ScalarOp::Or => {
            let mut mask: Option<BooleanArray> = None;
            for arg in args {
                let next = evaluate_predicate(arg, batch)?;
                mask = Some(match mask {
                    None => next,
                    Some(prev) => {
                        let combined = if op == ScalarOp::And {
                            and(&prev, &next)
                        } else {
                            or(&prev, &next)
                        };
                        combined.map_err(|e| eval_err(format!("boolean combine failed: {e}")))?
                    }
                });
            }
            let mask = mask.ok_or_else(|| eval_err("empty boolean call".to_string()))?;
            Ok(Value::Array(Arc::new(mask)))
        }
        ScalarOp::Not => {
            if args.len() != 1 {
                return Err(eval_err("NOT takes exactly one argument".to_string()));
            }
            let mask = evaluate_predicate(&args[0], batch)?;
            Ok(Value::Array(Arc::new(not(&mask).map_err(|e| {
                eval_err(format!("negation failed: {e}"))
            })?)))
        }
        ScalarOp::Eq
        | ScalarOp::NotEq
        | ScalarOp::Lt
        | ScalarOp::LtEq
        | ScalarOp::Gt
        | ScalarOp::GtEq => {
            let (left, right) = binary_operands(op, args, batch)?;
            let (lhs, rhs) = (left.datum(), right.datum());
            let mask = match op {
                ScalarOp::Eq => cmp::eq(&lhs, &rhs),
                ScalarOp::NotEq => cmp::neq(&lhs, &rhs),
                ScalarOp::Lt => cmp::lt(&lhs, &rhs),
                ScalarOp::LtEq => cmp::lt_eq(&lhs, &rhs),
                ScalarOp::Gt => cmp::gt(&lhs, &rhs),
                ScalarOp::GtEq => cmp::gt_eq(&lhs, &rhs),
                _ => unreachable!("comparison arm"),
            }
            .map_err(|e| eval_err(format!("comparison failed: {e}")))?;
            // Two scalar operands produce a scalar mask.
            if lhs.scalar && rhs.scalar {
                Ok(Value::Scalar(Arc::new(mask)))
            } else {
                Ok(Value::Array(Arc::new(mask)))
            }
        }
        ScalarOp::Plus | ScalarOp::Minus | ScalarOp::Multiply | ScalarOp::Divide => {
            let (left, right) = binary_operands(op, args, batch)?;
            let (lhs, rhs) = (left.datum(), right.datum());
            let out = match op {
                ScalarOp::Plus => numeric::add(&lhs, &rhs),
                ScalarOp::Minus => numeric::sub(&lhs, &rhs),
                ScalarOp::Multiply => numeric::mul(&lhs, &rhs),
                ScalarOp::Divide => numeric::div(&lhs, &rhs),
                _ => unreachable!("arithmetic arm"),
            }
            .map_err(|e| eval_err(format!("arithmetic failed: {e}")))?;
            if lhs.scalar && rhs.scalar {
                Ok(Value::Scalar(out))
            } else {
                Ok(Value::Array(out))
            }
        }
    }
}

fn binary_operands(
    op: ScalarOp,
    args: &[ScalarExpr],
    batch: &RecordBatch,
) -> Result<(Value, Value)> {
    if args.len() != 2 {
        return Err(eval_err(format!("{op:?} takes exactly two arguments")));
    }
    let left = eval_value(&args[0], batch)?;
    let right = eval_value(&args[1], batch)?;
    coerce_numeric(left, right)
}

/// Mixed Int64/Float64 operands both become Float64.
fn coerce_numeric(left: Value, right: Value) -> Result<(Value, Value)> {
    let mixed = matches!(
        (left.data_type(), right.data_type()),
        (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64)
    );
    if !mixed {
        return Ok((left, right));
    }
    Ok((cast_value(left)?, cast_value(right)?))
}

fn cast_value(value: Value) -> Result<Value> {
    let to_float = |array: &ArrayRef| {
        cast(array.as_ref(), &DataType::Float64)
            .map_err(|e| eval_err(format!("numeric coercion failed: {e}")))
    };
    Ok(match value {
        Value::Array(a) if a.data_type() == &DataType::Int64 => Value::Array(to_float(&a)?),
        Value::Scalar(a) if a.data_type() == &DataType::Int64 => Value::Scalar(to_float(&a)?),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use arrow_schema::{Field, Schema};
    use ffr_planner::parse_scalar;

    use super::*;

    fn test_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Float64, false),
            Field::new("s", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1_i64, 5, 10])),
                Arc::new(Float64Array::from(vec![0.5_f64, 5.0, 2.0])),
                Arc::new(StringArray::from(vec!["x", "y", "x"])),
            ],
        )
        .expect("batch")
    }

    fn mask_of(expr: &str) -> Vec<bool> {
        let parsed = parse_scalar(expr).expect("parse");
        evaluate_predicate(&parsed, &test_batch())
            .expect("eval")
            .iter()
            .map(|v| v.expect("non-null"))
            .collect()
    }

    #[test]
    fn comparison_and_boolean_combinators() {
        assert_eq!(mask_of(">($0, 4)"), vec![false, true, true]);
        assert_eq!(mask_of("AND(>($0, 4), <($1, 3.0))"), vec![false, false, true]);
        assert_eq!(mask_of("=($2, 'x')"), vec![true, false, true]);
        assert_eq!(mask_of("NOT(=($2, 'x'))"), vec![false, true, false]);
    }

    #[test]
    fn mixed_numeric_operands_coerce_to_float() {
        let parsed = parse_scalar("+($0, $1)").expect("parse");
        let out = evaluate(&parsed, &test_batch()).expect("eval");
        let floats = out
            .as_any()
            .downcast_ref::<Float64Array>()
            .expect("floats");
        assert_eq!(floats.values().to_vec(), vec![1.5, 10.0, 12.0]);
    }

    #[test]
    fn scalar_only_expression_broadcasts() {
        let parsed = parse_scalar("*(2, 3)").expect("parse");
        let out = evaluate(&parsed, &test_batch()).expect("eval");
        assert_eq!(out.len(), 3);
        let ints = out.as_any().downcast_ref::<Int64Array>().expect("ints");
        assert_eq!(ints.values().to_vec(), vec![6, 6, 6]);
    }
}
