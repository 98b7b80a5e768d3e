//! Textual relational plan parsing for the FFR runtime.
//!
//! Architecture role:
//! - tokenizes a newline-separated plan into an operator tree
//! - classifies operators and extracts their named parameters
//! - parses scalar expressions, sort keys, window clauses, and aggregates
//!
//! Key modules:
//! - [`parse`]
//! - [`expr`]
//! - [`scalar`]
//! - [`agg`]
//! - [`window`]

pub mod agg;
pub mod expr;
pub mod parse;
pub mod scalar;
pub mod window;

pub use agg::{AggFunction, AggregateCall, AggregateVars, aggregate_vars};
pub use expr::{
    SortDirection, SortVars, WindowVars, extract_projects, extract_table_name, has_limit_only,
    is_window_expression, limit_rows, named_expression, query_part, sort_vars, window_vars,
};
pub use parse::{OperatorKind, PlanNode, classify, parse_plan};
pub use scalar::{
    ScalarExpr, ScalarOp, equi_join_keys, filter_condition, parse_scalar, project_exprs,
};
pub use window::{PassthroughColumn, WindowCall, WindowFunction, WindowProjection, window_calls};

use ffr_common::Result;

/// One table scan found in a plan, in plan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStep {
    /// The full scan line.
    pub expr: String,
    /// Referenced table name with any `main.` prefix stripped.
    pub table_name: String,
    /// Projected column indexes for bindable scans; empty for plain scans.
    pub projected_columns: Vec<usize>,
}

/// Extract every scan step of a plan, in source order.
///
/// Callers use the result to bind data providers positionally before
/// building the execution graph.
pub fn scan_info(plan_text: &str) -> Result<Vec<ScanStep>> {
    let mut out = Vec::new();
    for line in plan_text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match classify(line) {
            Some(OperatorKind::TableScan) => out.push(ScanStep {
                expr: line.to_string(),
                table_name: extract_table_name(line)?,
                projected_columns: Vec::new(),
            }),
            Some(OperatorKind::BindableTableScan) => out.push(ScanStep {
                expr: line.to_string(),
                table_name: extract_table_name(line)?,
                projected_columns: extract_projects(line)?.unwrap_or_default(),
            }),
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_info_lists_scans_in_plan_order() {
        let text = "LogicalJoin(condition=[=($0, $2)], joinType=[inner])\n  LogicalTableScan(table=[[main, orders]])\n  BindableTableScan(table=[[main, lineitem]], projects=[[0, 3]])\n";
        let scans = scan_info(text).expect("scan info");
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].table_name, "orders");
        assert!(scans[0].projected_columns.is_empty());
        assert_eq!(scans[1].table_name, "lineitem");
        assert_eq!(scans[1].projected_columns, vec![0, 3]);
    }
}
