//! Aggregate-line extraction.
//!
//! `LogicalAggregate(group=[{0}], s=[SUM($1)], c=[COUNT()])` carries a group
//! set in brace form plus one named parameter per aggregate call.

use ffr_common::{FfrError, Result};
use serde::{Deserialize, Serialize};

use crate::expr::query_part;

/// Supported aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunction {
    /// Sum of the input column.
    Sum,
    /// Row count (with or without an input column).
    Count,
    /// Minimum of the input column.
    Min,
    /// Maximum of the input column.
    Max,
    /// Arithmetic mean of the input column.
    Avg,
}

impl AggFunction {
    fn from_name(name: &str) -> Option<AggFunction> {
        Some(match name {
            "SUM" | "SUM0" => AggFunction::Sum,
            "COUNT" => AggFunction::Count,
            "MIN" => AggFunction::Min,
            "MAX" => AggFunction::Max,
            "AVG" => AggFunction::Avg,
            _ => return None,
        })
    }
}

/// One aggregate call of an aggregate line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCall {
    /// The aggregate function.
    pub function: AggFunction,
    /// Input column index; `None` for `COUNT()`.
    pub input: Option<usize>,
    /// Output column name from the plan line.
    pub output_name: String,
}

/// Group columns plus aggregate calls of one aggregate line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateVars {
    /// Group-by column indexes, in output order.
    pub group_columns: Vec<usize>,
    /// Aggregate calls, in output order after the group columns.
    pub calls: Vec<AggregateCall>,
}

/// Split the parameter list of a line at top-level commas.
pub(crate) fn split_params(part: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in part.char_indices() {
        match c {
            '[' | '{' | '(' => depth += 1,
            ']' | '}' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(part[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = part[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Extract group columns and aggregate calls from an aggregate line.
pub fn aggregate_vars(expr: &str) -> Result<AggregateVars> {
    let mut group_columns = Vec::new();
    let mut calls = Vec::new();

    for param in split_params(query_part(expr)) {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        let value = value
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim();

        if name.trim() == "group" {
            let inner = value.trim_start_matches('{').trim_end_matches('}');
            for piece in inner.split(',') {
                let piece = piece.trim();
                if piece.is_empty() {
                    continue;
                }
                group_columns.push(piece.parse::<usize>().map_err(|_| FfrError::PlanParse {
                    line: 0,
                    reason: format!("invalid group column `{piece}`"),
                })?);
            }
            continue;
        }

        let open = value.find('(').ok_or_else(|| FfrError::PlanParse {
            line: 0,
            reason: format!("aggregate call `{value}` is not a function call"),
        })?;
        let close = value.rfind(')').ok_or_else(|| FfrError::PlanParse {
            line: 0,
            reason: format!("aggregate call `{value}` has unbalanced parentheses"),
        })?;
        let function =
            AggFunction::from_name(&value[..open]).ok_or_else(|| FfrError::PlanParse {
                line: 0,
                reason: format!("unsupported aggregate function in `{value}`"),
            })?;
        let arg = value[open + 1..close].trim();
        let input = if arg.is_empty() {
            None
        } else {
            Some(crate::expr::column_ref(arg)?)
        };

        calls.push(AggregateCall {
            function,
            input,
            output_name: name.trim().to_string(),
        });
    }

    Ok(AggregateVars {
        group_columns,
        calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_group_set_and_calls_in_order() {
        let vars = aggregate_vars(
            "LogicalAggregate(group=[{0, 2}], s=[SUM($1)], c=[COUNT()], m=[MIN($3)])",
        )
        .expect("vars");
        assert_eq!(vars.group_columns, vec![0, 2]);
        assert_eq!(vars.calls.len(), 3);
        assert_eq!(vars.calls[0].function, AggFunction::Sum);
        assert_eq!(vars.calls[0].input, Some(1));
        assert_eq!(vars.calls[1].function, AggFunction::Count);
        assert_eq!(vars.calls[1].input, None);
        assert_eq!(vars.calls[2].output_name, "m");
    }

    #[test]
    fn global_aggregate_has_empty_group() {
        let vars = aggregate_vars("LogicalAggregate(group=[{}], total=[SUM($0)])").expect("vars");
        assert!(vars.group_columns.is_empty());
        assert_eq!(vars.calls.len(), 1);
    }
}
