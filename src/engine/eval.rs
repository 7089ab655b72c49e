//! Single-row projection evaluator used by `LocalEngine`
//!
//! Supports `SELECT <expr> [AS alias], ...` without a FROM clause, where an
//! expression is an integer or string literal, `NULL`, or a call to one of
//! the built-in functions below. Arguments may themselves be calls.
//!
//! | function            | result                                     |
//! |---------------------|--------------------------------------------|
//! | `sleep(ms)`         | blocks for `ms` milliseconds, returns `ms` |
//! | `date_add(d, n)`    | `d` (YYYY-MM-DD) plus `n` days             |
//! | `raise_error(msg)`  | fails the task with `msg`                  |

use std::sync::OnceLock;
use std::time::Duration;

use chrono::NaiveDate;
use regex_lite::Regex;

use super::{EngineError, NumberFormatError, ResultSet, Value};

/// Hooks through which a running task observes cancellation.
pub trait TaskControl {
    /// Block for `duration`. Returns `Interrupted` if woken by a forceful
    /// cancellation.
    fn sleep(&self, duration: Duration) -> Result<(), EngineError>;

    /// Check-point between units of work. Returns `Interrupted` once any
    /// cancellation has been requested.
    fn checkpoint(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Int(i64),
    Str(String),
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub label: String,
    pub expr: Expr,
}

fn call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)$").unwrap())
}

fn alias_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)^(.*\S)\s+as\s+([A-Za-z_][A-Za-z0-9_]*)$").unwrap())
}

/// Split on commas that are outside quotes and parentheses.
fn split_top_level(input: &str) -> Result<Vec<&str>, EngineError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quote = false;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth < 0 {
                    return Err(EngineError::Parse("unbalanced ')'".to_string()));
                }
            }
            ',' if !in_quote && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if in_quote {
        return Err(EngineError::Parse("unterminated string literal".to_string()));
    }
    if depth != 0 {
        return Err(EngineError::Parse("unbalanced '('".to_string()));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn parse_expr(text: &str) -> Result<Expr, EngineError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(EngineError::Parse("empty expression".to_string()));
    }

    if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
        return Ok(Expr::Str(text[1..text.len() - 1].replace("''", "'")));
    }
    if text.eq_ignore_ascii_case("null") {
        return Ok(Expr::Null);
    }
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Expr::Int(n));
    }

    let caps = call_regex()
        .captures(text)
        .ok_or_else(|| EngineError::Parse(format!("unsupported expression '{}'", text)))?;
    let name = caps[1].to_ascii_lowercase();
    let inner = caps[2].trim();
    let args = if inner.is_empty() {
        Vec::new()
    } else {
        split_top_level(inner)?
            .into_iter()
            .map(parse_expr)
            .collect::<Result<Vec<_>, _>>()?
    };

    Ok(Expr::Call { name, args })
}

/// Parse a `SELECT` projection list.
pub fn parse_select(sql: &str) -> Result<Vec<Projection>, EngineError> {
    let sql = sql.trim().trim_end_matches(';').trim();
    let body = match sql.get(..6) {
        Some(kw) if kw.eq_ignore_ascii_case("select") => &sql[6..],
        _ => return Err(EngineError::Parse(format!("expected SELECT, got '{}'", sql))),
    };
    if body.trim().is_empty() {
        return Err(EngineError::Parse("empty projection list".to_string()));
    }
    if !body.starts_with(char::is_whitespace) {
        return Err(EngineError::Parse(format!("expected SELECT, got '{}'", sql)));
    }

    split_top_level(body)?
        .into_iter()
        .map(|item| {
            let item = item.trim();
            let (expr_text, label) = match alias_regex().captures(item) {
                Some(caps) => (caps[1].to_string(), caps[2].to_string()),
                None => (item.to_string(), item.to_string()),
            };
            Ok(Projection { label, expr: parse_expr(&expr_text)? })
        })
        .collect()
}

fn ordinal(index: usize) -> &'static str {
    match index {
        0 => "first",
        1 => "second",
        2 => "third",
        _ => "nth",
    }
}

fn expect_args(function: &str, args: &[Expr], expected: usize) -> Result<(), EngineError> {
    if args.len() != expected {
        return Err(EngineError::WrongArgumentCount {
            function: function.to_string(),
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

fn integer_arg(function: &str, index: usize, value: &Value) -> Result<i64, EngineError> {
    match value {
        Value::Int(n) => Ok(*n),
        other => {
            let text = other.to_string();
            text.trim().parse::<i64>().map_err(|source| EngineError::InvalidIntegerArgument {
                function: function.to_string(),
                position: ordinal(index),
                value: text.clone(),
                source: NumberFormatError { input: text.clone(), source },
            })
        }
    }
}

fn eval_expr(expr: &Expr, ctl: &dyn TaskControl) -> Result<Value, EngineError> {
    let (name, args) = match expr {
        Expr::Null => return Ok(Value::Null),
        Expr::Int(n) => return Ok(Value::Int(*n)),
        Expr::Str(s) => return Ok(Value::Str(s.clone())),
        Expr::Call { name, args } => (name.as_str(), args),
    };

    let values = args
        .iter()
        .map(|a| eval_expr(a, ctl))
        .collect::<Result<Vec<_>, _>>()?;

    match name {
        "sleep" => {
            expect_args(name, args, 1)?;
            let ms = integer_arg(name, 0, &values[0])?.max(0);
            ctl.sleep(Duration::from_millis(ms as u64))?;
            Ok(Value::Int(ms))
        }
        "date_add" => {
            expect_args(name, args, 2)?;
            let date_text = values[0].to_string();
            let date = NaiveDate::parse_from_str(date_text.trim(), "%Y-%m-%d").map_err(|source| {
                EngineError::InvalidDateArgument {
                    function: name.to_string(),
                    position: ordinal(0),
                    value: date_text.clone(),
                    source,
                }
            })?;
            let days = integer_arg(name, 1, &values[1])?;
            let shifted = date
                .checked_add_signed(chrono::Duration::days(days))
                .ok_or_else(|| EngineError::TaskFailed(format!("date overflow adding {} days", days)))?;
            Ok(Value::Str(shifted.format("%Y-%m-%d").to_string()))
        }
        "raise_error" => {
            expect_args(name, args, 1)?;
            Err(EngineError::TaskFailed(values[0].to_string()))
        }
        other => Err(EngineError::UndefinedFunction(other.to_string())),
    }
}

/// Evaluate projections left to right, stopping at the first check-point
/// that observes a cancellation.
pub fn evaluate(projections: &[Projection], ctl: &dyn TaskControl) -> Result<ResultSet, EngineError> {
    ctl.checkpoint()?;

    let mut row = Vec::with_capacity(projections.len());
    for projection in projections {
        row.push(eval_expr(&projection.expr, ctl)?);
        ctl.checkpoint()?;
    }

    let columns = projections.iter().map(|p| p.label.clone()).collect();
    Ok(ResultSet::single_row(columns, row))
}
