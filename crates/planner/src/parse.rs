//! Plan-text tokenization into an operator tree.
//!
//! Contract:
//! - one relational operator per line, indented by two spaces per depth level;
//! - parameters appear between the outermost parentheses as `name=[value]`
//!   pairs (bracket-nesting aware) with comma separation;
//! - the first line is the plan root; a child is exactly one level deeper
//!   than its parent.

use ffr_common::{FfrError, Result};
use serde::{Deserialize, Serialize};

/// Classified operator kind for one plan line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorKind {
    /// `LogicalTableScan`: full-table scan.
    TableScan,
    /// `BindableTableScan`: scan with pushed-down projection/filters.
    BindableTableScan,
    /// `LogicalFilter`: row predicate.
    Filter,
    /// `LogicalProject`: column projection/computation.
    Project,
    /// `LogicalSort` carrying sort keys (may also carry `fetch`).
    Sort,
    /// `LogicalLimit`, or a `LogicalSort` carrying only `fetch`.
    Limit,
    /// `LogicalAggregate`: grouped or global aggregation.
    Aggregate,
    /// `LogicalJoin`: equi-join.
    Join,
    /// `LogicalUnion`: bag union of two or more inputs.
    Union,
    /// `LogicalProject`/`LogicalComputeWindow` containing an `OVER` clause.
    Window,
}

/// One parsed plan line plus its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    /// 1-based source line number, for error attribution.
    pub line: usize,
    /// The trimmed operator expression, e.g. `LogicalSort(sort0=[$0], dir0=[ASC])`.
    pub expr: String,
    /// Classified operator kind.
    pub kind: OperatorKind,
    /// Child operators, in source order.
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    /// Number of operators in this subtree, including self.
    pub fn num_operators(&self) -> usize {
        1 + self.children.iter().map(PlanNode::num_operators).sum::<usize>()
    }

    /// Depth-first postorder walk (children before parents).
    pub fn visit_postorder<'a>(&'a self, out: &mut Vec<&'a PlanNode>) {
        for child in &self.children {
            child.visit_postorder(out);
        }
        out.push(self);
    }
}

/// Parse a newline-separated plan into an operator tree.
pub fn parse_plan(text: &str) -> Result<PlanNode> {
    let mut lines = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let indent = raw.len() - raw.trim_start_matches(' ').len();
        if indent % 2 != 0 {
            return Err(FfrError::PlanParse {
                line: idx + 1,
                reason: format!("indentation of {indent} spaces is not a multiple of two"),
            });
        }
        lines.push((idx + 1, indent / 2, raw.trim().to_string()));
    }

    if lines.is_empty() {
        return Err(FfrError::PlanParse {
            line: 0,
            reason: "plan text is empty".to_string(),
        });
    }
    if lines[0].1 != 0 {
        return Err(FfrError::PlanParse {
            line: lines[0].0,
            reason: "plan root must not be indented".to_string(),
        });
    }

    let mut iter = lines.into_iter().peekable();
    let root = parse_subtree(&mut iter, 0)?;
    if let Some((line, _, expr)) = iter.next() {
        return Err(FfrError::PlanParse {
            line,
            reason: format!("unexpected second root operator: {expr}"),
        });
    }
    Ok(root)
}

fn parse_subtree(
    iter: &mut std::iter::Peekable<std::vec::IntoIter<(usize, usize, String)>>,
    depth: usize,
) -> Result<PlanNode> {
    let (line, node_depth, expr) = iter.next().ok_or(FfrError::PlanParse {
        line: 0,
        reason: "unexpected end of plan".to_string(),
    })?;
    if node_depth != depth {
        return Err(FfrError::PlanParse {
            line,
            reason: format!("expected depth {depth}, found {node_depth}"),
        });
    }

    let kind = classify(&expr).ok_or_else(|| FfrError::PlanParse {
        line,
        reason: format!("unrecognized operator: {expr}"),
    })?;

    let mut children = Vec::new();
    while let Some((child_line, child_depth, _)) = iter.peek() {
        if *child_depth <= depth {
            break;
        }
        if *child_depth != depth + 1 {
            return Err(FfrError::PlanParse {
                line: *child_line,
                reason: format!(
                    "child depth {child_depth} skips levels under depth {depth}"
                ),
            });
        }
        children.push(parse_subtree(iter, depth + 1)?);
    }

    Ok(PlanNode {
        line,
        expr,
        kind,
        children,
    })
}

/// Classify one plan line, preferring the most specific operator.
///
/// `BindableTableScan` wins over the `TableScan` prefix match; a
/// `LogicalSort` whose parameters carry only `fetch` is a `Limit`; a project
/// containing an `OVER` clause is a `Window`.
pub fn classify(expr: &str) -> Option<OperatorKind> {
    let name = expr.split('(').next().unwrap_or("").trim();
    match name {
        "BindableTableScan" => Some(OperatorKind::BindableTableScan),
        "LogicalTableScan" | "TableScan" => Some(OperatorKind::TableScan),
        "LogicalFilter" => Some(OperatorKind::Filter),
        "LogicalProject" | "LogicalComputeWindow" => {
            if crate::expr::is_window_expression(expr) {
                Some(OperatorKind::Window)
            } else {
                Some(OperatorKind::Project)
            }
        }
        "LogicalSort" => {
            if crate::expr::has_limit_only(expr) {
                Some(OperatorKind::Limit)
            } else {
                Some(OperatorKind::Sort)
            }
        }
        "LogicalLimit" => Some(OperatorKind::Limit),
        "LogicalAggregate" => Some(OperatorKind::Aggregate),
        "LogicalJoin" => Some(OperatorKind::Join),
        "LogicalUnion" => Some(OperatorKind::Union),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_indented_tree_in_source_order() {
        let text = "LogicalSort(sort0=[$0], dir0=[ASC])\n  LogicalProject(x=[$0])\n    LogicalTableScan(table=[[main, t]])\n";
        let plan = parse_plan(text).expect("plan");
        assert_eq!(plan.kind, OperatorKind::Sort);
        assert_eq!(plan.num_operators(), 3);
        assert_eq!(plan.children[0].kind, OperatorKind::Project);
        assert_eq!(plan.children[0].children[0].kind, OperatorKind::TableScan);
    }

    #[test]
    fn sort_with_only_fetch_is_limit() {
        assert_eq!(
            classify("LogicalSort(fetch=[50])"),
            Some(OperatorKind::Limit)
        );
        assert_eq!(
            classify("LogicalSort(sort0=[$0], dir0=[ASC], fetch=[50])"),
            Some(OperatorKind::Sort)
        );
    }

    #[test]
    fn bindable_scan_is_preferred_over_scan() {
        assert_eq!(
            classify("BindableTableScan(table=[[main, t]], projects=[[0, 2]])"),
            Some(OperatorKind::BindableTableScan)
        );
    }

    #[test]
    fn rejects_bad_indentation_with_line_number() {
        let err = parse_plan("LogicalProject(x=[$0])\n   LogicalTableScan(table=[[main, t]])\n")
            .unwrap_err();
        match err {
            ffr_common::FfrError::PlanParse { line, .. } => assert_eq!(line, 2),
            other => panic!("expected PlanParse, got {other}"),
        }
    }

    #[test]
    fn rejects_unknown_operator() {
        assert!(parse_plan("LogicalTeleport(to=[$0])\n").is_err());
    }
}
