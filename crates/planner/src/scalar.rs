//! Scalar expression parsing for filter conditions and projections.
//!
//! The plan prints scalar expressions in prefix-call form, e.g.
//! `condition=[AND(>($0, 5), <($1, 3.5))]` or `EXPR$0=[+($0, $1)]`.
//! Supported leaves are `$<int>` column references and int/float/string/bool
//! literals; supported calls are the comparison, boolean, and arithmetic
//! operators of the plan subset.

use ffr_common::{FfrError, Result};
use serde::{Deserialize, Serialize};

/// Operator of a scalar call expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarOp {
    /// Boolean conjunction.
    And,
    /// Boolean disjunction.
    Or,
    /// Boolean negation.
    Not,
    /// Equality.
    Eq,
    /// Inequality.
    NotEq,
    /// Less-than.
    Lt,
    /// Less-than-or-equal.
    LtEq,
    /// Greater-than.
    Gt,
    /// Greater-than-or-equal.
    GtEq,
    /// Addition.
    Plus,
    /// Subtraction.
    Minus,
    /// Multiplication.
    Multiply,
    /// Division.
    Divide,
}

impl ScalarOp {
    fn from_name(name: &str) -> Option<ScalarOp> {
        Some(match name {
            "AND" => ScalarOp::And,
            "OR" => ScalarOp::Or,
            "NOT" => ScalarOp::Not,
            "=" => ScalarOp::Eq,
            "<>" => ScalarOp::NotEq,
            "<" => ScalarOp::Lt,
            "<=" => ScalarOp::LtEq,
            ">" => ScalarOp::Gt,
            ">=" => ScalarOp::GtEq,
            "+" => ScalarOp::Plus,
            "-" => ScalarOp::Minus,
            "*" => ScalarOp::Multiply,
            "/" => ScalarOp::Divide,
            _ => return None,
        })
    }
}

/// A parsed scalar expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarExpr {
    /// `$<int>` input column reference.
    ColumnRef(usize),
    /// Integer literal.
    LiteralInt(i64),
    /// Floating-point literal.
    LiteralFloat(f64),
    /// String literal (single-quoted in plan text).
    LiteralUtf8(String),
    /// Boolean literal.
    LiteralBool(bool),
    /// Prefix call, e.g. `>($0, 5)`.
    Call {
        /// The operator.
        op: ScalarOp,
        /// Ordered arguments.
        args: Vec<ScalarExpr>,
    },
}

impl ScalarExpr {
    /// Highest input column index referenced by this expression, if any.
    pub fn max_column_ref(&self) -> Option<usize> {
        match self {
            ScalarExpr::ColumnRef(i) => Some(*i),
            ScalarExpr::Call { args, .. } => args.iter().filter_map(ScalarExpr::max_column_ref).max(),
            _ => None,
        }
    }
}

/// Parse one prefix-form scalar expression.
pub fn parse_scalar(text: &str) -> Result<ScalarExpr> {
    let mut parser = Parser {
        text,
        pos: 0,
    };
    let expr = parser.parse_expr()?;
    parser.skip_ws();
    if parser.pos != parser.text.len() {
        return Err(parser.error("trailing characters after expression"));
    }
    Ok(expr)
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: &str) -> FfrError {
        FfrError::PlanParse {
            line: 0,
            reason: format!("{reason} at offset {} in `{}`", self.pos, self.text),
        }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.text.len() - trimmed.len();
    }

    fn parse_expr(&mut self) -> Result<ScalarExpr> {
        self.skip_ws();
        let rest = self.rest();

        if rest.starts_with('$') {
            let end = rest[1..]
                .find(|c: char| !c.is_ascii_digit())
                .map(|i| i + 1)
                .unwrap_or(rest.len());
            let idx: usize = rest[1..end]
                .parse()
                .map_err(|_| self.error("invalid column reference"))?;
            self.pos += end;
            return Ok(ScalarExpr::ColumnRef(idx));
        }

        if let Some(stripped) = rest.strip_prefix('\'') {
            let close = stripped
                .find('\'')
                .ok_or_else(|| self.error("unterminated string literal"))?;
            let value = stripped[..close].to_string();
            self.pos += close + 2;
            return Ok(ScalarExpr::LiteralUtf8(value));
        }

        // Operator name: symbols or keywords, possibly a call.
        let name_len = rest
            .find(|c: char| c == '(' || c == ',' || c == ')' || c.is_whitespace())
            .unwrap_or(rest.len());
        let name = &rest[..name_len];
        if name.is_empty() {
            return Err(self.error("expected expression"));
        }

        if rest[name_len..].trim_start().starts_with('(') {
            let op = ScalarOp::from_name(name).ok_or_else(|| self.error("unknown operator"))?;
            self.pos += name_len;
            self.skip_ws();
            self.pos += 1; // consume '('
            let mut args = Vec::new();
            loop {
                self.skip_ws();
                if self.rest().starts_with(')') {
                    self.pos += 1;
                    break;
                }
                args.push(self.parse_expr()?);
                self.skip_ws();
                if self.rest().starts_with(',') {
                    self.pos += 1;
                }
            }
            if args.is_empty() {
                return Err(self.error("operator call without arguments"));
            }
            return Ok(ScalarExpr::Call { op, args });
        }

        self.pos += name_len;
        match name {
            "true" => Ok(ScalarExpr::LiteralBool(true)),
            "false" => Ok(ScalarExpr::LiteralBool(false)),
            _ => {
                if name.contains('.') || name.contains('e') || name.contains('E') {
                    name.parse::<f64>()
                        .map(ScalarExpr::LiteralFloat)
                        .map_err(|_| self.error("invalid numeric literal"))
                } else {
                    name.parse::<i64>()
                        .map(ScalarExpr::LiteralInt)
                        .map_err(|_| self.error("invalid literal"))
                }
            }
        }
    }
}

/// Output columns of a project line as `(name, expression)` pairs.
pub fn project_exprs(line: &str) -> Result<Vec<(String, ScalarExpr)>> {
    let mut out = Vec::new();
    for param in crate::agg::split_params(crate::expr::query_part(line)) {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        let value = value
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim();
        out.push((name.trim().to_string(), parse_scalar(value)?));
    }
    Ok(out)
}

/// Filter predicate of a filter line (`condition=[...]`).
pub fn filter_condition(line: &str) -> Result<ScalarExpr> {
    let raw = crate::expr::named_expression(line, "condition").ok_or_else(|| {
        FfrError::PlanParse {
            line: 0,
            reason: format!("filter line has no condition: `{line}`"),
        }
    })?;
    parse_scalar(&raw)
}

/// Extract the equi-join key pairs from a join condition such as
/// `=($0, $2)` or `AND(=($0, $2), =($1, $3))`.
///
/// Returns `(left_keys, right_keys)` where right-side references are
/// rebased by `left_width` (the plan numbers join inputs contiguously).
pub fn equi_join_keys(condition: &ScalarExpr, left_width: usize) -> Result<(Vec<usize>, Vec<usize>)> {
    let mut left = Vec::new();
    let mut right = Vec::new();
    collect_equi_keys(condition, left_width, &mut left, &mut right)?;
    Ok((left, right))
}

fn collect_equi_keys(
    expr: &ScalarExpr,
    left_width: usize,
    left: &mut Vec<usize>,
    right: &mut Vec<usize>,
) -> Result<()> {
    match expr {
        ScalarExpr::Call {
            op: ScalarOp::And,
            args,
        } => {
            for arg in args {
                collect_equi_keys(arg, left_width, left, right)?;
            }
            Ok(())
        }
        ScalarExpr::Call {
            op: ScalarOp::Eq,
            args,
        } if args.len() == 2 => match (&args[0], &args[1]) {
            (ScalarExpr::ColumnRef(a), ScalarExpr::ColumnRef(b)) => {
                let (l, r) = if a < b { (*a, *b) } else { (*b, *a) };
                if l >= left_width || r < left_width {
                    return Err(FfrError::PlanParse {
                        line: 0,
                        reason: "join condition does not reference both sides".to_string(),
                    });
                }
                left.push(l);
                right.push(r - left_width);
                Ok(())
            }
            _ => Err(FfrError::PlanParse {
                line: 0,
                reason: "join equality must compare column references".to_string(),
            }),
        },
        _ => Err(FfrError::PlanParse {
            line: 0,
            reason: "only conjunctions of column equalities are supported in joins".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_prefix_calls() {
        let expr = parse_scalar("AND(>($0, 5), <($1, 3.5))").expect("expr");
        match expr {
            ScalarExpr::Call {
                op: ScalarOp::And,
                args,
            } => {
                assert_eq!(args.len(), 2);
                assert_eq!(
                    args[0],
                    ScalarExpr::Call {
                        op: ScalarOp::Gt,
                        args: vec![ScalarExpr::ColumnRef(0), ScalarExpr::LiteralInt(5)],
                    }
                );
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_string_and_bool_literals() {
        assert_eq!(
            parse_scalar("=($2, 'FRANCE')").expect("expr"),
            ScalarExpr::Call {
                op: ScalarOp::Eq,
                args: vec![
                    ScalarExpr::ColumnRef(2),
                    ScalarExpr::LiteralUtf8("FRANCE".to_string())
                ],
            }
        );
        assert_eq!(parse_scalar("true").expect("expr"), ScalarExpr::LiteralBool(true));
    }

    #[test]
    fn join_keys_rebase_right_side() {
        let condition = parse_scalar("AND(=($0, $2), =($3, $1))").expect("expr");
        let (left, right) = equi_join_keys(&condition, 2).expect("keys");
        assert_eq!(left, vec![0, 1]);
        assert_eq!(right, vec![0, 1]);
    }

    #[test]
    fn rejects_non_equi_join_condition() {
        let condition = parse_scalar(">($0, $2)").expect("expr");
        assert!(equi_join_keys(&condition, 2).is_err());
    }
}
