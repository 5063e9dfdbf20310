//! Data model shared by every engine component: discovered tests, the
//! step/routine descriptors read from YAML, and the results produced by
//! running them.
//!
//! Shape mirrors a UTDL-style plan (see the teacher's `protocol` module)
//! but generalised to the suite/use-case/test-case hierarchy and the
//! pre_run/test/post_run phase model.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies one test, produced once at discovery and never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct TestDescriptor {
    /// `<uc>/<tc>`.
    pub test_id: String,
    pub use_case: String,
    pub test_case: String,
    pub name: String,
    pub tags: Vec<String>,
    pub timeout: Duration,
    pub yaml_path: PathBuf,
    pub suite_root: PathBuf,
}

impl TestDescriptor {
    pub fn new(
        use_case: impl Into<String>,
        test_case: impl Into<String>,
        name: impl Into<String>,
        tags: Vec<String>,
        timeout: Duration,
        yaml_path: PathBuf,
        suite_root: PathBuf,
    ) -> Self {
        let use_case = use_case.into();
        let test_case = test_case.into();
        let test_id = format!("{use_case}/{test_case}");
        Self {
            test_id,
            use_case,
            test_case,
            name: name.into(),
            tags,
            timeout,
            yaml_path,
            suite_root,
        }
    }
}

/// A phase of test execution. `pre_run` failures abort the test before any
/// assertion runs; `test` failures still allow `post_run` to run;
/// `post_run` steps always run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreRun,
    Test,
    PostRun,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::PreRun => "pre_run",
            Phase::Test => "test",
            Phase::PostRun => "post_run",
        }
    }
}

/// One step descriptor as read from `test.yaml` or a routine body.
///
/// A step whose only content is `routine` is expanded by the Routine
/// Resolver before the runner ever sees it — by the time `TestRunner`
/// iterates a phase's steps, no `routine` references remain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,

    #[serde(default)]
    pub handler: Option<String>,

    #[serde(default)]
    pub routine: Option<String>,

    #[serde(default)]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub ignore_errors: bool,

    #[serde(default)]
    pub capture: Option<String>,

    #[serde(default)]
    pub workdir: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Every other handler-specific key (`command`, `url`, `method`,
    /// `body`, `path`, `type`, `seconds`, `operation`, ...). Kept as a
    /// generic JSON map the same way the teacher's `Step::params` does,
    /// since each handler interprets a different subset.
    #[serde(flatten)]
    pub params: HashMap<String, Value>,

    /// Binding used only while a routine expansion is in scope; not
    /// present in raw YAML.
    #[serde(skip)]
    pub params_binding: Option<HashMap<String, Value>>,
}

impl Step {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }
}

/// A named, parameterised sequence of steps. Keyed by name within a
/// scope (`global` or `uc.<uc_id>`) — see [`crate::routines`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routine {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub params: HashMap<String, RoutineParam>,

    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineParam {
    #[serde(rename = "type")]
    pub param_type: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<Value>,
}

/// A single assertion entry: `{expr, message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionSpec {
    pub expr: String,

    #[serde(default)]
    pub message: Option<String>,
}

/// The full on-disk shape of a `test.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFile {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub pre_run: Vec<Step>,

    #[serde(default)]
    pub test: Vec<Step>,

    #[serde(default)]
    pub assertions: Vec<AssertionSpec>,

    #[serde(default)]
    pub post_run: Vec<Step>,
}

/// Outcome of a single handler invocation. `success` is derived, not
/// stored independently, to keep the invariant
/// `success ⇔ exit_code == 0 ∧ error == ""` from drifting.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn ok(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        let stdout = stdout.into();
        let stderr = stderr.into();
        Self {
            success: exit_code == 0,
            exit_code,
            stdout,
            stderr,
            error: None,
        }
    }

    pub fn fail(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn timeout() -> Self {
        Self {
            success: false,
            exit_code: 124,
            stdout: String::new(),
            stderr: String::new(),
            error: Some("timeout".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionResult {
    pub index: usize,
    pub expr: String,
    pub message: String,
    pub passed: bool,
    pub actual: String,
    pub expected: String,
}

/// Record of one executed step, folding its phase/index/handler name and
/// the handler's `StepResult` into one reportable unit (matches
/// `TestResult.steps[]` in spec.md §3).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedStep {
    pub phase: Phase,
    pub index: usize,
    pub handler: String,
    pub name: String,
    #[serde(flatten)]
    pub result: StepResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub test_id: String,
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub steps: Vec<ExecutedStep>,
    pub assertions: Vec<AssertionResult>,
}

impl TestResult {
    /// Never-dispatched placeholder for a test the scheduler skips
    /// without running (pool drained on `stop_on_fail`, or root already
    /// cancelled before the worker reached it).
    pub fn skipped(test_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            name: name.into(),
            passed: false,
            error: Some("skipped".to_string()),
            duration_ms: 0,
            steps: Vec::new(),
            assertions: Vec::new(),
        }
    }

    /// Maps a result onto the control plane's terminal `TestState`
    /// (spec.md §4.9, §7.6): a cancellation with no recorded step is
    /// indistinguishable from never having started, so it reports
    /// `Skipped`; a cancellation mid-step, or any resource error the
    /// container executor tags `crashed:`, reports `Crashed`.
    ///
    /// The container executor never records per-step detail (one
    /// container is one test attempt, not a sequence of observable
    /// steps), so `steps.is_empty()` can't tell "never started" apart
    /// from "started and killed" there the way it can for the in-process
    /// runner. It instead tags its own cancellations explicitly as
    /// `cancelled:not-started` or `cancelled:running`.
    pub fn state(&self) -> TestState {
        if self.passed {
            return TestState::Passed;
        }
        match self.error.as_deref() {
            Some("skipped") => TestState::Skipped,
            Some("cancelled:not-started") => TestState::Skipped,
            Some("cancelled:running") => TestState::Crashed,
            Some("cancelled") if self.steps.is_empty() => TestState::Skipped,
            Some("cancelled") => TestState::Crashed,
            Some(e) if e.starts_with("crashed:") => TestState::Crashed,
            _ => TestState::Failed,
        }
    }
}

/// Per-test terminal/non-terminal state as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    Pending,
    Running,
    Passed,
    Failed,
    Crashed,
    Skipped,
}

impl TestState {
    /// Terminal states may not be overwritten (spec.md §3, §8).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TestState::Passed | TestState::Failed | TestState::Crashed | TestState::Skipped
        )
    }
}

/// Run-level state as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_result_success_matches_exit_code() {
        let ok = StepResult::ok(0, "hi", "");
        assert!(ok.success);
        let bad = StepResult::ok(1, "", "");
        assert!(!bad.success);
    }

    #[test]
    fn terminal_states() {
        assert!(TestState::Passed.is_terminal());
        assert!(!TestState::Running.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Pending.is_terminal());
    }

    #[test]
    fn result_state_mapping() {
        let mut passed = TestResult::skipped("uc/tc", "Test");
        passed.error = None;
        passed.passed = true;
        assert_eq!(passed.state(), TestState::Passed);

        assert_eq!(TestResult::skipped("uc/tc", "Test").state(), TestState::Skipped);

        let mut cancelled_early = TestResult::skipped("uc/tc", "Test");
        cancelled_early.error = Some("cancelled".to_string());
        assert_eq!(cancelled_early.state(), TestState::Skipped);

        let mut cancelled_mid = TestResult::skipped("uc/tc", "Test");
        cancelled_mid.error = Some("cancelled".to_string());
        cancelled_mid.steps.push(ExecutedStep {
            phase: Phase::Test,
            index: 0,
            handler: "shell".to_string(),
            name: "s".to_string(),
            result: StepResult::fail(1, "cancelled"),
        });
        assert_eq!(cancelled_mid.state(), TestState::Crashed);

        let mut resource_error = TestResult::skipped("uc/tc", "Test");
        resource_error.error = Some("crashed: image not found".to_string());
        assert_eq!(resource_error.state(), TestState::Crashed);

        let mut container_never_started = TestResult::skipped("uc/tc", "Test");
        container_never_started.error = Some("cancelled:not-started".to_string());
        assert_eq!(container_never_started.state(), TestState::Skipped);

        let mut container_running = TestResult::skipped("uc/tc", "Test");
        container_running.error = Some("cancelled:running".to_string());
        assert_eq!(container_running.state(), TestState::Crashed);
    }

    #[test]
    fn test_descriptor_id_format() {
        let d = TestDescriptor::new(
            "auth",
            "login",
            "Login flow",
            vec![],
            Duration::from_secs(30),
            PathBuf::from("/suite/suites/auth/login/test.yaml"),
            PathBuf::from("/suite"),
        );
        assert_eq!(d.test_id, "auth/login");
    }
}
