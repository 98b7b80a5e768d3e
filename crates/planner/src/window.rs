//! Window-call extraction from project lines carrying `OVER` clauses.

use ffr_common::{FfrError, Result};
use serde::{Deserialize, Serialize};

use crate::agg::split_params;
use crate::expr::query_part;

/// Supported window functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowFunction {
    /// 1-based row number within the partition.
    RowNumber,
    /// Partition minimum of the input column.
    Min,
    /// Partition maximum of the input column.
    Max,
    /// Partition sum of the input column.
    Sum,
    /// Partition row count.
    Count,
    /// Partition mean of the input column.
    Avg,
}

impl WindowFunction {
    fn from_name(name: &str) -> Option<WindowFunction> {
        Some(match name {
            "ROW_NUMBER" => WindowFunction::RowNumber,
            "MIN" => WindowFunction::Min,
            "MAX" => WindowFunction::Max,
            "SUM" | "SUM0" => WindowFunction::Sum,
            "COUNT" => WindowFunction::Count,
            "AVG" => WindowFunction::Avg,
            _ => return None,
        })
    }
}

/// One windowed call of a project line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCall {
    /// The window function.
    pub function: WindowFunction,
    /// Input column index; `None` for `ROW_NUMBER()`/`COUNT()`.
    pub input: Option<usize>,
    /// Output column name from the plan line.
    pub output_name: String,
}

/// Passthrough (non-windowed) output column of a window line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassthroughColumn {
    /// Input column index.
    pub input: usize,
    /// Output column name.
    pub output_name: String,
}

/// All window calls plus passthrough columns of one line, in output order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowProjection {
    /// Plain `$i` passthrough columns.
    pub passthrough: Vec<PassthroughColumn>,
    /// Windowed calls.
    pub calls: Vec<WindowCall>,
}

/// Extract the window calls and passthrough columns of a window line.
pub fn window_calls(expr: &str) -> Result<WindowProjection> {
    let mut projection = WindowProjection::default();

    for param in split_params(query_part(expr)) {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        let value = value
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim();

        if let Some(over_at) = value.find(" OVER ") {
            let call = &value[..over_at];
            let open = call.find('(').ok_or_else(|| FfrError::PlanParse {
                line: 0,
                reason: format!("window call `{call}` is not a function call"),
            })?;
            let close = call.rfind(')').ok_or_else(|| FfrError::PlanParse {
                line: 0,
                reason: format!("window call `{call}` has unbalanced parentheses"),
            })?;
            let function =
                WindowFunction::from_name(&call[..open]).ok_or_else(|| FfrError::PlanParse {
                    line: 0,
                    reason: format!("unsupported window function in `{call}`"),
                })?;
            let arg = call[open + 1..close].trim();
            let input = if arg.is_empty() {
                None
            } else {
                Some(crate::expr::column_ref(arg)?)
            };
            projection.calls.push(WindowCall {
                function,
                input,
                output_name: name.trim().to_string(),
            });
        } else if value.starts_with('$') {
            projection.passthrough.push(PassthroughColumn {
                input: crate::expr::column_ref(value)?,
                output_name: name.trim().to_string(),
            });
        } else {
            return Err(FfrError::PlanParse {
                line: 0,
                reason: format!("window line column `{value}` is neither a call nor a reference"),
            });
        }
    }

    Ok(projection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_calls_and_passthrough_columns() {
        let expr = "LogicalProject(n=[$0], rn=[ROW_NUMBER() OVER (PARTITION BY $1 ORDER BY $2)], mx=[MAX($3) OVER (PARTITION BY $1)])";
        let projection = window_calls(expr).expect("projection");
        assert_eq!(projection.passthrough.len(), 1);
        assert_eq!(projection.passthrough[0].input, 0);
        assert_eq!(projection.calls.len(), 2);
        assert_eq!(projection.calls[0].function, WindowFunction::RowNumber);
        assert_eq!(projection.calls[0].input, None);
        assert_eq!(projection.calls[1].function, WindowFunction::Max);
        assert_eq!(projection.calls[1].input, Some(3));
    }
}
