//! Named-parameter and expression extraction from plan lines.
//!
//! A plan line such as
//! `LogicalSort(sort0=[$0], dir0=[ASC], fetch=[100])` carries its parameters
//! between the outermost parentheses as bracket-delimited named values.
//! Window expressions embed an `OVER` clause, e.g.
//! `min_keys=[MIN($0) OVER (PARTITION BY $1, $2 ORDER BY $3 DESC)]`.

use ffr_common::{FfrError, Result};
use serde::{Deserialize, Serialize};

/// Sort direction for one sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    /// Ascending key order.
    Ascending,
    /// Descending key order.
    Descending,
}

impl SortDirection {
    /// Returns whether the direction is descending.
    pub fn is_descending(self) -> bool {
        matches!(self, SortDirection::Descending)
    }
}

/// Sort keys, directions, and optional row limit extracted from a sort line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortVars {
    /// Column indexes to sort by, most significant first.
    pub columns: Vec<usize>,
    /// Direction per sort column.
    pub directions: Vec<SortDirection>,
    /// `fetch=[N]` limit, if present.
    pub fetch: Option<u64>,
}

/// Partition/order keys extracted from a window `OVER` clause.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowVars {
    /// `PARTITION BY` column indexes.
    pub partition_columns: Vec<usize>,
    /// `ORDER BY` column indexes.
    pub order_columns: Vec<usize>,
    /// Direction per order column.
    pub order_directions: Vec<SortDirection>,
}

impl WindowVars {
    /// Combined partition-then-order key set used for pre-sorting input.
    pub fn combined_sort_keys(&self) -> (Vec<usize>, Vec<SortDirection>) {
        let mut columns = self.partition_columns.clone();
        let mut directions = vec![SortDirection::Ascending; self.partition_columns.len()];
        columns.extend_from_slice(&self.order_columns);
        directions.extend_from_slice(&self.order_directions);
        (columns, directions)
    }
}

/// Substring between the outermost parentheses of a plan line.
pub fn query_part(expr: &str) -> &str {
    match (expr.find('('), expr.rfind(')')) {
        (Some(start), Some(end)) if end > start => &expr[start + 1..end],
        _ => "",
    }
}

/// Value of a `name=[value]` parameter, bracket-nesting aware.
///
/// Also accepts the bare `name=value` form (terminated by `,` or end) used by
/// simplified plans such as `LogicalLimit(fetch=50)`.
pub fn named_expression(expr: &str, name: &str) -> Option<String> {
    let part = query_part(expr);
    let needle = format!("{name}=");
    let mut search_from = 0;
    loop {
        let rel = part[search_from..].find(&needle)?;
        let at = search_from + rel;
        // Reject matches that continue a longer identifier (e.g. `sort0` vs `sort`).
        let is_word_start = at == 0
            || !part[..at]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
        if !is_word_start {
            search_from = at + needle.len();
            continue;
        }
        let value_start = at + needle.len();
        let rest = &part[value_start..];
        if let Some(inner) = rest.strip_prefix('[') {
            let mut depth = 1usize;
            for (i, c) in inner.char_indices() {
                match c {
                    '[' => depth += 1,
                    ']' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(inner[..i].to_string());
                        }
                    }
                    _ => {}
                }
            }
            return None;
        }
        let end = rest.find(',').unwrap_or(rest.len());
        return Some(rest[..end].trim().to_string());
    }
}

/// Parse a `$<int>` scalar column reference.
pub fn column_ref(token: &str) -> Result<usize> {
    token
        .trim()
        .strip_prefix('$')
        .and_then(|rest| rest.parse::<usize>().ok())
        .ok_or_else(|| FfrError::PlanParse {
            line: 0,
            reason: format!("expected $<int> column reference, found `{token}`"),
        })
}

/// Count occurrences of a token among the parameter names of a line.
fn count_param_prefix(expr: &str, prefix: &str) -> usize {
    let part = query_part(expr);
    part.split(',')
        .filter(|p| {
            let p = p.trim();
            p.starts_with(prefix)
                && p[prefix.len()..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit())
        })
        .count()
}

/// Extract `sort<i>`/`dir<i>` pairs and the optional `fetch` limit.
pub fn sort_vars(expr: &str) -> Result<SortVars> {
    let num_keys = count_param_prefix(expr, "sort");
    let mut columns = Vec::with_capacity(num_keys);
    let mut directions = Vec::with_capacity(num_keys);
    for i in 0..num_keys {
        let key = named_expression(expr, &format!("sort{i}")).ok_or_else(|| {
            FfrError::PlanParse {
                line: 0,
                reason: format!("missing sort{i} in `{expr}`"),
            }
        })?;
        columns.push(column_ref(&key)?);
        let dir = named_expression(expr, &format!("dir{i}")).unwrap_or_else(|| "ASC".to_string());
        directions.push(match dir.as_str() {
            "ASC" | "ASC-nulls-last" => SortDirection::Ascending,
            "DESC" | "DESC-nulls-last" => SortDirection::Descending,
            other => {
                return Err(FfrError::PlanParse {
                    line: 0,
                    reason: format!("unknown sort direction `{other}`"),
                })
            }
        });
    }

    let fetch = match named_expression(expr, "fetch") {
        Some(raw) => Some(raw.parse::<u64>().map_err(|_| FfrError::PlanParse {
            line: 0,
            reason: format!("invalid fetch value `{raw}`"),
        })?),
        None => None,
    };

    Ok(SortVars {
        columns,
        directions,
        fetch,
    })
}

/// Returns whether a sort line carries only a row limit (no sort keys).
pub fn has_limit_only(expr: &str) -> bool {
    sort_vars(expr)
        .map(|v| v.columns.is_empty() && v.fetch.is_some())
        .unwrap_or(false)
}

/// Row limit of a simple scan+limit plan line, if present.
pub fn limit_rows(expr: &str) -> Option<u64> {
    sort_vars(expr).ok().and_then(|v| v.fetch)
}

/// Returns whether a plan line embeds a window `OVER` clause.
pub fn is_window_expression(expr: &str) -> bool {
    expr.contains(" OVER ")
}

/// First `OVER (...)` clause body on the line, if any.
fn first_over_expression(expr: &str) -> Option<&str> {
    let at = expr.find(" OVER ")?;
    let rest = &expr[at + " OVER ".len()..];
    let open = rest.find('(')?;
    let mut depth = 0usize;
    for (i, c) in rest[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&rest[open + 1..open + i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_ref_list(values: &str, with_directions: bool) -> Result<(Vec<usize>, Vec<SortDirection>)> {
    let mut columns = Vec::new();
    let mut directions = Vec::new();
    for piece in values.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let mut parts = piece.split_whitespace();
        let head = parts.next().unwrap_or("");
        columns.push(column_ref(head)?);
        if with_directions {
            directions.push(match parts.next() {
                Some("DESC") => SortDirection::Descending,
                _ => SortDirection::Ascending,
            });
        } else {
            directions.push(SortDirection::Ascending);
        }
    }
    Ok((columns, directions))
}

/// Extract partition/order variables from the first `OVER` clause of a line.
///
/// `OVER (ORDER BY ...)` without `PARTITION BY` yields an empty partition key
/// set; callers execute that shape as a single whole-input partition.
pub fn window_vars(expr: &str) -> Result<WindowVars> {
    let Some(over) = first_over_expression(expr) else {
        return Ok(WindowVars::default());
    };

    let mut vars = WindowVars::default();

    let order_at = over.find("ORDER BY ");
    if let Some(partition_at) = over.find("PARTITION BY ") {
        let start = partition_at + "PARTITION BY ".len();
        let end = order_at.unwrap_or(over.len());
        let (columns, _) = parse_ref_list(&over[start..end], false)?;
        vars.partition_columns = columns;
    }
    if let Some(order_at) = order_at {
        let start = order_at + "ORDER BY ".len();
        let end = over[start..]
            .find("ROWS")
            .map(|i| start + i)
            .unwrap_or(over.len());
        let (columns, directions) = parse_ref_list(&over[start..end], true)?;
        vars.order_columns = columns;
        vars.order_directions = directions;
    }
    Ok(vars)
}

/// Table name referenced by a scan line, with any `main.` prefix stripped.
pub fn extract_table_name(expr: &str) -> Result<String> {
    let raw = named_expression(expr, "table").ok_or_else(|| FfrError::PlanParse {
        line: 0,
        reason: format!("scan line has no table parameter: `{expr}`"),
    })?;
    // `table=[[main, t]]` arrives here as `[main, t]`.
    let name = raw
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(".");
    Ok(name.strip_prefix("main.").unwrap_or(&name).to_string())
}

/// Projected column indexes of a bindable scan (`projects=[[0, 2]]`).
pub fn extract_projects(expr: &str) -> Result<Option<Vec<usize>>> {
    let Some(raw) = named_expression(expr, "projects") else {
        return Ok(None);
    };
    let inner = raw.trim_start_matches('[').trim_end_matches(']');
    let mut out = Vec::new();
    for piece in inner.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        out.push(piece.parse::<usize>().map_err(|_| FfrError::PlanParse {
            line: 0,
            reason: format!("invalid projection index `{piece}`"),
        })?);
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bracketed_named_expressions() {
        let expr = "LogicalSort(sort0=[$0], sort1=[$2], dir0=[ASC], dir1=[DESC], fetch=[100])";
        assert_eq!(named_expression(expr, "sort0").as_deref(), Some("$0"));
        assert_eq!(named_expression(expr, "dir1").as_deref(), Some("DESC"));
        assert_eq!(named_expression(expr, "fetch").as_deref(), Some("100"));
        assert_eq!(named_expression(expr, "sort"), None);
    }

    #[test]
    fn accepts_bare_named_values() {
        assert_eq!(
            named_expression("LogicalLimit(fetch=50)", "fetch").as_deref(),
            Some("50")
        );
    }

    #[test]
    fn sort_vars_pairs_keys_with_directions() {
        let vars =
            sort_vars("LogicalSort(sort0=[$3], sort1=[$1], dir0=[DESC], dir1=[ASC])").expect("vars");
        assert_eq!(vars.columns, vec![3, 1]);
        assert_eq!(
            vars.directions,
            vec![SortDirection::Descending, SortDirection::Ascending]
        );
        assert_eq!(vars.fetch, None);
    }

    #[test]
    fn limit_only_detection() {
        assert!(has_limit_only("LogicalSort(fetch=[10])"));
        assert!(!has_limit_only("LogicalSort(sort0=[$0], dir0=[ASC], fetch=[10])"));
        assert_eq!(limit_rows("LogicalSort(fetch=[10])"), Some(10));
    }

    #[test]
    fn window_vars_partition_and_order() {
        let expr = "LogicalProject(min_keys=[MIN($0) OVER (PARTITION BY $1, $2 ORDER BY $3 DESC)], n=[$0])";
        let vars = window_vars(expr).expect("vars");
        assert_eq!(vars.partition_columns, vec![1, 2]);
        assert_eq!(vars.order_columns, vec![3]);
        assert_eq!(vars.order_directions, vec![SortDirection::Descending]);

        let (columns, directions) = vars.combined_sort_keys();
        assert_eq!(columns, vec![1, 2, 3]);
        assert_eq!(directions.len(), 3);
    }

    #[test]
    fn window_vars_order_only_has_empty_partition() {
        let expr = "LogicalProject(rn=[ROW_NUMBER() OVER (ORDER BY $2)])";
        let vars = window_vars(expr).expect("vars");
        assert!(vars.partition_columns.is_empty());
        assert_eq!(vars.order_columns, vec![2]);
    }

    #[test]
    fn table_name_strips_main_prefix() {
        assert_eq!(
            extract_table_name("LogicalTableScan(table=[[main, lineitem]])").expect("name"),
            "lineitem"
        );
        assert_eq!(
            extract_table_name("BindableTableScan(table=[[nation]], projects=[[0, 2]])")
                .expect("name"),
            "nation"
        );
    }

    #[test]
    fn projects_list_parses() {
        assert_eq!(
            extract_projects("BindableTableScan(table=[[t]], projects=[[0, 2]])").expect("ok"),
            Some(vec![0, 2])
        );
        assert_eq!(
            extract_projects("LogicalTableScan(table=[[t]])").expect("ok"),
            None
        );
    }
}
