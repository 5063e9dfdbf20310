//! The Interpolator (spec.md §4.1): resolves `${...}` references over a
//! layered, mostly-read-only context (spec.md §3) and substitutes them
//! into templates.
//!
//! Regex-driven substitution adapted from the teacher's
//! `context/mod.rs`; the single `ENV_` prefix there is generalised into
//! the `env:` / `file:` / `jq:` prefix family, and the dotted-path lookup
//! is extended to walk the named context layers in priority order.

pub mod jq;

use std::collections::HashMap;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Outcome of the most recently executed step in the current phase.
/// Resets at each phase boundary (spec.md §3: "`last.*` is always the
/// immediately previous step in the current phase").
#[derive(Debug, Clone, Default)]
pub struct LastResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Layered interpolation/assertion environment for a single test. Owned
/// exclusively by one test's runner; never shared across threads
/// (spec.md §5: "Context: exclusively owned by a single test's runner").
pub struct Context {
    captured: HashMap<String, String>,
    last: LastResult,
    params: Option<HashMap<String, Value>>,
    config: Value,
    pub workdir: PathBuf,
}

static ESCAPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\$\{([^}]*)\}").unwrap());
static REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]*)\}").unwrap());

impl Context {
    pub fn new(config: Value, workdir: PathBuf) -> Self {
        Self {
            captured: HashMap::new(),
            last: LastResult::default(),
            params: None,
            config,
            workdir,
        }
    }

    pub fn set_last(&mut self, last: LastResult) {
        self.last = last;
    }

    /// Reset `last.*` at a phase boundary.
    pub fn reset_last(&mut self) {
        self.last = LastResult::default();
    }

    /// Captures are write-once within a test only in the sense that a
    /// re-capture overwrites — that *is* the defined behaviour
    /// (spec.md §3).
    pub fn capture(&mut self, name: &str, value: impl Into<String>) {
        self.captured.insert(name.to_string(), value.into());
    }

    pub fn captured(&self, name: &str) -> Option<&str> {
        self.captured.get(name).map(|s| s.as_str())
    }

    /// Bind `params.*` for the duration of a routine expansion. Routines
    /// are non-recursive (spec.md §4.4), so a single active binding is
    /// all the model needs.
    pub fn bind_params(&mut self, params: HashMap<String, Value>) {
        self.params = Some(params);
    }

    pub fn clear_params(&mut self) {
        self.params = None;
    }

    /// `Interpolate(template, ctx) → string`. Unknown references resolve
    /// to the empty string rather than raising (spec.md §4.1). `$${x}`
    /// escapes to a literal `${x}`.
    pub fn interpolate(&self, template: &str) -> String {
        // Protect escaped tokens behind a sentinel the reference regex
        // can't match, so they survive the substitution pass untouched.
        let protected = ESCAPE_RE.replace_all(template, "\u{0}{$1}");
        let resolved = REF_RE.replace_all(&protected, |caps: &regex::Captures| {
            value_to_string(&self.resolve(&caps[1]))
        });
        resolved.replace('\u{0}', "$")
    }

    /// Resolve a bare `<ref>` (no surrounding `${` `}`) to its typed
    /// value, for callers that need more than a string — the Assertion
    /// Evaluator's `is`/`length`/`exists` operators in particular.
    pub fn resolve_ref(&self, reference: &str) -> Value {
        self.resolve(reference)
    }

    /// Resolve a single `<ref>` (the content between `${` and `}`).
    fn resolve(&self, reference: &str) -> Value {
        if let Some(rest) = reference.strip_prefix("env:") {
            return std::env::var(rest).map(Value::String).unwrap_or(Value::Null);
        }
        if let Some(path) = reference.strip_prefix("file:") {
            return std::fs::read_to_string(self.resolve_path(path))
                .map(Value::String)
                .unwrap_or(Value::Null);
        }
        if let Some(rest) = reference.strip_prefix("jq:") {
            return self.resolve_jq(rest);
        }
        self.resolve_dotted(reference)
    }

    fn resolve_jq(&self, rest: &str) -> Value {
        let Some((varref, path)) = rest.split_once(':') else {
            return Value::Null;
        };
        let raw = value_to_string(&self.resolve_dotted(varref));
        let Ok(decoded) = serde_json::from_str::<Value>(&raw) else {
            return Value::Null;
        };
        jq::select(&decoded, path).unwrap_or(Value::Null)
    }

    fn resolve_dotted(&self, reference: &str) -> Value {
        if let Some(name) = reference.strip_prefix("captured.") {
            return self
                .captured
                .get(name)
                .map(|s| Value::String(s.clone()))
                .unwrap_or(Value::Null);
        }
        if let Some(field) = reference.strip_prefix("last.") {
            return match field {
                "exit_code" => Value::from(self.last.exit_code),
                "stdout" => Value::String(self.last.stdout.clone()),
                "stderr" => Value::String(self.last.stderr.clone()),
                _ => Value::Null,
            };
        }
        if let Some(name) = reference.strip_prefix("params.") {
            return self
                .params
                .as_ref()
                .and_then(|p| p.get(name))
                .cloned()
                .unwrap_or(Value::Null);
        }
        if let Some(path) = reference.strip_prefix("config.") {
            return jq::select(&self.config, path).unwrap_or(Value::Null);
        }
        Value::Null
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let resolved = self.interpolate(path);
        let candidate = PathBuf::from(&resolved);
        if candidate.is_absolute() {
            candidate
        } else {
            self.workdir.join(candidate)
        }
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Context {
        Context::new(
            json!({"packages": {"cli_version": "1.2.3"}}),
            PathBuf::from("/workspace"),
        )
    }

    #[test]
    fn unknown_reference_is_empty_string() {
        let c = ctx();
        assert_eq!(c.interpolate("${captured.missing}"), "");
    }

    #[test]
    fn captured_roundtrip() {
        let mut c = ctx();
        c.capture("out", "hello");
        assert_eq!(c.interpolate("${captured.out}"), "hello");
    }

    #[test]
    fn last_fields() {
        let mut c = ctx();
        c.set_last(LastResult {
            exit_code: 0,
            stdout: "42\n".to_string(),
            stderr: String::new(),
        });
        assert_eq!(c.interpolate("${last.stdout}"), "42\n");
        assert_eq!(c.interpolate("${last.exit_code}"), "0");
    }

    #[test]
    fn config_dotted_path() {
        let c = ctx();
        assert_eq!(c.interpolate("${config.packages.cli_version}"), "1.2.3");
    }

    #[test]
    fn env_prefix() {
        std::env::set_var("TSUITE_TEST_VAR", "envval");
        let c = ctx();
        assert_eq!(c.interpolate("${env:TSUITE_TEST_VAR}"), "envval");
    }

    #[test]
    fn escape_produces_literal() {
        let c = ctx();
        assert_eq!(c.interpolate("$${captured.out}"), "${captured.out}");
    }

    #[test]
    fn jq_prefix_decodes_and_selects() {
        let mut c = ctx();
        c.capture("body", r#"{"data":{"token":"abc123"}}"#);
        assert_eq!(c.interpolate("${jq:captured.body:data.token}"), "abc123");
    }

    #[test]
    fn double_interpolation_is_idempotent_when_no_refs_remain() {
        let mut c = ctx();
        c.capture("out", "plain text");
        let once = c.interpolate("${captured.out}");
        let twice = c.interpolate(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn params_binding_scoped_to_routine_expansion() {
        let mut c = ctx();
        let mut params = HashMap::new();
        params.insert("greeting".to_string(), json!("hi"));
        c.bind_params(params);
        assert_eq!(c.interpolate("${params.greeting}"), "hi");
        c.clear_params();
        assert_eq!(c.interpolate("${params.greeting}"), "");
    }
}
