//! The Assertion Evaluator (spec.md §4.2): `<ref-expansion> <op> <rhs>`
//! over the same layered context the Interpolator reads.
//!
//! Parse errors don't abort the test — they come back as a failing
//! `AssertionResult` with a descriptive message, the same way the
//! teacher's `validation/mod.rs` accumulates structured errors instead
//! of raising.

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::context::Context;
use crate::protocol::{AssertionResult, AssertionSpec};

#[derive(Debug, Error)]
pub enum AssertionError {
    #[error("Invalid expression syntax: {0}")]
    Syntax(String),
    #[error("invalid regular expression in `matches`: {0}")]
    BadRegex(String),
}

/// Evaluate every assertion in order, producing one `AssertionResult`
/// per entry. A syntax error yields `passed=false`, never a hard stop —
/// the caller decides the test's overall pass/fail from the results.
pub fn evaluate_all(specs: &[AssertionSpec], ctx: &Context) -> Vec<AssertionResult> {
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| evaluate_one(index, spec, ctx))
        .collect()
}

fn evaluate_one(index: usize, spec: &AssertionSpec, ctx: &Context) -> AssertionResult {
    match evaluate(&spec.expr, ctx) {
        Ok((passed, actual, expected)) => AssertionResult {
            index,
            expr: spec.expr.clone(),
            message: message_for(spec, passed, &actual, &expected),
            passed,
            actual,
            expected,
        },
        Err(e) => AssertionResult {
            index,
            expr: spec.expr.clone(),
            message: e.to_string(),
            passed: false,
            actual: String::new(),
            expected: String::new(),
        },
    }
}

fn message_for(spec: &AssertionSpec, passed: bool, actual: &str, expected: &str) -> String {
    if passed {
        return String::new();
    }
    spec.message
        .clone()
        .unwrap_or_else(|| format!("expected `{actual}` to satisfy `{}`, got `{expected}`", spec.expr))
}

/// Returns `(passed, actual, expected)` — both rendered as display
/// strings for the report, regardless of the operator's native type.
fn evaluate(expr: &str, ctx: &Context) -> Result<(bool, String, String), AssertionError> {
    let tokens = tokenize(expr)?;
    let mut iter = tokens.into_iter();
    let ref_token = iter
        .next()
        .ok_or_else(|| AssertionError::Syntax("empty expression".to_string()))?;
    let reference = unwrap_ref(&ref_token)
        .ok_or_else(|| AssertionError::Syntax(format!("expected `${{...}}`, got `{ref_token}`")))?;
    let value = ctx.resolve_ref(reference);
    let actual_str = render(&value);

    let rest: Vec<String> = iter.collect();
    let op = rest
        .first()
        .ok_or_else(|| AssertionError::Syntax("missing operator".to_string()))?
        .as_str();

    match op {
        "==" | "!=" => {
            let rhs = rhs_str(&rest, 1, ctx)?;
            let passed = compare_eq(&actual_str, &rhs) == (op == "==");
            Ok((passed, actual_str, rhs))
        }
        "<" | "<=" | ">" | ">=" => {
            let rhs = rhs_str(&rest, 1, ctx)?;
            let passed = compare_ord(&actual_str, &rhs, op)?;
            Ok((passed, actual_str, rhs))
        }
        "contains" => {
            let rhs = rhs_str(&rest, 1, ctx)?;
            Ok((actual_str.contains(&rhs), actual_str, rhs))
        }
        "icontains" => {
            let rhs = rhs_str(&rest, 1, ctx)?;
            let passed = actual_str.to_lowercase().contains(&rhs.to_lowercase());
            Ok((passed, actual_str, rhs))
        }
        "iequal" | "ieq" => {
            let rhs = rhs_str(&rest, 1, ctx)?;
            let passed = actual_str.to_lowercase() == rhs.to_lowercase();
            Ok((passed, actual_str, rhs))
        }
        "startswith" => {
            let rhs = rhs_str(&rest, 1, ctx)?;
            Ok((actual_str.starts_with(&rhs), actual_str, rhs))
        }
        "endswith" => {
            let rhs = rhs_str(&rest, 1, ctx)?;
            Ok((actual_str.ends_with(&rhs), actual_str, rhs))
        }
        "matches" => {
            let rhs = rhs_str(&rest, 1, ctx)?;
            let re = Regex::new(&rhs).map_err(|e| AssertionError::BadRegex(e.to_string()))?;
            Ok((re.is_match(&actual_str), actual_str, rhs))
        }
        "exists" => Ok((!actual_str.is_empty(), actual_str, "exists".to_string())),
        "not" => {
            let second = rest.get(1).map(|s| s.as_str()).unwrap_or("");
            match second {
                "exists" => Ok((actual_str.is_empty(), actual_str, "not exists".to_string())),
                "contains" => {
                    let rhs = rhs_str(&rest, 2, ctx)?;
                    Ok((!actual_str.contains(&rhs), actual_str, rhs))
                }
                other => Err(AssertionError::Syntax(format!(
                    "unsupported `not {other}` operator"
                ))),
            }
        }
        "is" => {
            let type_name = rest
                .get(1)
                .ok_or_else(|| AssertionError::Syntax("`is` requires a type name".to_string()))?;
            let passed = matches_type(&value, type_name);
            Ok((passed, actual_str, type_name.clone()))
        }
        "length" => {
            let cmp_op = rest
                .get(1)
                .ok_or_else(|| AssertionError::Syntax("`length` requires a comparison".to_string()))?;
            let n: i64 = rest
                .get(2)
                .ok_or_else(|| AssertionError::Syntax("`length` requires an integer".to_string()))?
                .parse()
                .map_err(|_| AssertionError::Syntax("`length` operand must be an integer".to_string()))?;
            let len = value_length(&value);
            let passed = compare_i64(len, n, cmp_op)?;
            Ok((passed, len.to_string(), n.to_string()))
        }
        other => Err(AssertionError::Syntax(format!("unknown operator `{other}`"))),
    }
}

fn rhs_str(rest: &[String], at: usize, ctx: &Context) -> Result<String, AssertionError> {
    let raw = rest
        .get(at)
        .ok_or_else(|| AssertionError::Syntax("missing right-hand side".to_string()))?;
    let stripped = strip_quotes(raw);
    if let Some(reference) = unwrap_ref(&stripped) {
        Ok(render(&ctx.resolve_ref(reference)))
    } else {
        Ok(ctx.interpolate(&stripped))
    }
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn unwrap_ref(s: &str) -> Option<&str> {
    s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}'))
}

fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compare_eq(lhs: &str, rhs: &str) -> bool {
    match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn compare_ord(lhs: &str, rhs: &str, op: &str) -> Result<bool, AssertionError> {
    let a: f64 = lhs
        .parse()
        .map_err(|_| AssertionError::Syntax(format!("`{op}` requires numeric operands")))?;
    let b: f64 = rhs
        .parse()
        .map_err(|_| AssertionError::Syntax(format!("`{op}` requires numeric operands")))?;
    Ok(match op {
        "<" => a < b,
        "<=" => a <= b,
        ">" => a > b,
        ">=" => a >= b,
        _ => unreachable!(),
    })
}

fn compare_i64(a: i64, b: i64, op: &str) -> Result<bool, AssertionError> {
    Ok(match op {
        "==" => a == b,
        "!=" => a != b,
        "<" => a < b,
        "<=" => a <= b,
        ">" => a > b,
        ">=" => a >= b,
        other => {
            return Err(AssertionError::Syntax(format!(
                "unknown length comparison `{other}`"
            )))
        }
    })
}

fn value_length(v: &Value) -> i64 {
    match v {
        Value::Array(a) => a.len() as i64,
        Value::Object(o) => o.len() as i64,
        Value::String(s) => s.chars().count() as i64,
        Value::Null => 0,
        _ => 0,
    }
}

fn matches_type(v: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => matches!(v, Value::String(_)),
        "number" => matches!(v, Value::Number(_)),
        "bool" => matches!(v, Value::Bool(_)),
        "array" => matches!(v, Value::Array(_)),
        "object" => matches!(v, Value::Object(_)),
        "null" => matches!(v, Value::Null),
        _ => false,
    }
}

/// Splits on whitespace but keeps single- or double-quoted spans intact.
fn tokenize(expr: &str) -> Result<Vec<String>, AssertionError> {
    let mut tokens = Vec::new();
    let mut chars = expr.trim().chars().peekable();
    while chars.peek().is_some() {
        while chars.peek() == Some(&' ') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
        let quote = matches!(chars.peek(), Some('\'') | Some('"'));
        let mut token = String::new();
        if quote {
            let q = chars.next().unwrap();
            token.push(q);
            let mut closed = false;
            for c in chars.by_ref() {
                token.push(c);
                if c == q {
                    closed = true;
                    break;
                }
            }
            if !closed {
                return Err(AssertionError::Syntax(format!(
                    "unterminated quoted string in `{expr}`"
                )));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx_with_capture(name: &str, value: &str) -> Context {
        let mut c = Context::new(Value::Null, PathBuf::from("/workspace"));
        c.capture(name, value);
        c
    }

    #[test]
    fn contains_pass() {
        let ctx = ctx_with_capture("out", "hello world");
        let (passed, actual, _) = evaluate("${captured.out} contains 'world'", &ctx).unwrap();
        assert!(passed);
        assert_eq!(actual, "hello world");
    }

    #[test]
    fn numeric_equality() {
        let ctx = ctx_with_capture("n", "42");
        let (passed, _, _) = evaluate("${captured.n} == 42", &ctx).unwrap();
        assert!(passed);
    }

    #[test]
    fn string_equality_fallback() {
        let ctx = ctx_with_capture("n", "abc");
        let (passed, _, _) = evaluate("${captured.n} == 'abc'", &ctx).unwrap();
        assert!(passed);
    }

    #[test]
    fn assertion_failure_reports_actual_and_expected() {
        let ctx = ctx_with_capture("g", "hi");
        let (passed, actual, expected) = evaluate("${captured.g} contains 'bye'", &ctx).unwrap();
        assert!(!passed);
        assert_eq!(actual, "hi");
        assert_eq!(expected, "bye");
    }

    #[test]
    fn not_exists_on_missing_ref() {
        let ctx = Context::new(Value::Null, PathBuf::from("/workspace"));
        let (passed, _, _) = evaluate("${captured.missing} not exists", &ctx).unwrap();
        assert!(passed);
    }

    #[test]
    fn length_operator() {
        let ctx = ctx_with_capture("arr", "abcd");
        let (passed, actual, expected) = evaluate("${captured.arr} length == 4", &ctx).unwrap();
        assert!(passed);
        assert_eq!(actual, "4");
        assert_eq!(expected, "4");
    }

    #[test]
    fn invalid_syntax_reports_failure_not_panic() {
        let ctx = Context::new(Value::Null, PathBuf::from("/workspace"));
        let specs = vec![AssertionSpec {
            expr: "not a valid expr".to_string(),
            message: None,
        }];
        let results = evaluate_all(&specs, &ctx);
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
        assert!(results[0].message.starts_with("Invalid expression syntax"));
    }

    #[test]
    fn ordering_operator() {
        let ctx = ctx_with_capture("n", "10");
        let (passed, _, _) = evaluate("${captured.n} > 5", &ctx).unwrap();
        assert!(passed);
    }

    #[test]
    fn matches_regex() {
        let ctx = ctx_with_capture("out", "build-1234");
        let (passed, _, _) = evaluate("${captured.out} matches '^build-[0-9]+$'", &ctx).unwrap();
        assert!(passed);
    }
}
