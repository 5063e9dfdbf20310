//! Test Runner (spec.md §4.5): orchestrates one test's
//! `pre_run` → `test` → `post_run` phases.
//!
//! Sequential step iteration and per-step bookkeeping (`last.*`,
//! `capture`) are modelled on the teacher's `main.rs::execute_sequential`;
//! the retry-with-backoff wrapper there (`execute_step_with_retry`) has
//! no spec counterpart (spec.md §4.3: handlers never retry except
//! `wait`'s own internal polling) and is not carried over — the one
//! piece of it this keeps is `ignore_errors` acting as a pass-through,
//! now inline below instead of behind a `RecoveryStrategy` enum.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::assertions;
use crate::context::{Context, LastResult};
use crate::handlers::HandlerRegistry;
use crate::protocol::{ExecutedStep, Phase, Step, TestDescriptor, TestFile, TestResult};
use crate::routines::{self, RoutineSet};
use crate::scheduler::TestExecutor;

pub struct TestRunner<'a> {
    handlers: &'a HandlerRegistry,
}

struct PhaseOutcome {
    ok: bool,
    timed_out: bool,
    cancelled: bool,
}

impl<'a> TestRunner<'a> {
    pub fn new(handlers: &'a HandlerRegistry) -> Self {
        Self { handlers }
    }

    pub async fn run_test(
        &self,
        descriptor: &TestDescriptor,
        test_file: &TestFile,
        routine_set: &RoutineSet,
        config: Value,
        workdir: std::path::PathBuf,
        cancel: &CancellationToken,
    ) -> TestResult {
        let start = Instant::now();
        let deadline = start + descriptor.timeout;
        let mut ctx = Context::new(config, workdir);
        let mut executed = Vec::new();

        let result = self
            .run_all_phases(descriptor, test_file, routine_set, &mut ctx, &mut executed, deadline, cancel)
            .await;

        TestResult {
            test_id: descriptor.test_id.clone(),
            name: descriptor.name.clone(),
            passed: result.passed,
            error: result.error,
            duration_ms: start.elapsed().as_millis() as u64,
            steps: executed,
            assertions: result.assertions,
        }
    }

    async fn run_all_phases(
        &self,
        descriptor: &TestDescriptor,
        test_file: &TestFile,
        routine_set: &RoutineSet,
        ctx: &mut Context,
        executed: &mut Vec<ExecutedStep>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let pre_run = match routines::flatten_phase(&test_file.pre_run, routine_set, &descriptor.use_case) {
            Ok(steps) => steps,
            Err(e) => return RunOutcome::crashed(e),
        };
        let test_steps = match routines::flatten_phase(&test_file.test, routine_set, &descriptor.use_case) {
            Ok(steps) => steps,
            Err(e) => return RunOutcome::crashed(e),
        };
        let post_run = match routines::flatten_phase(&test_file.post_run, routine_set, &descriptor.use_case) {
            Ok(steps) => steps,
            Err(e) => return RunOutcome::crashed(e),
        };

        let pre_outcome = self
            .run_phase(Phase::PreRun, &pre_run, ctx, executed, deadline, cancel)
            .await;

        if pre_outcome.cancelled {
            return RunOutcome::with_error(false, "cancelled".to_string());
        }
        if pre_outcome.timed_out {
            return RunOutcome::with_error(false, "timeout".to_string());
        }

        let (test_outcome, ran_test) = if pre_outcome.ok {
            (
                self.run_phase(Phase::Test, &test_steps, ctx, executed, deadline, cancel)
                    .await,
                true,
            )
        } else {
            (
                PhaseOutcome {
                    ok: false,
                    timed_out: false,
                    cancelled: false,
                },
                false,
            )
        };

        if test_outcome.cancelled {
            return RunOutcome::with_error(false, "cancelled".to_string());
        }
        if test_outcome.timed_out {
            return RunOutcome::with_error(false, "timeout".to_string());
        }

        // Assertions run only if pre_run and test both completed without aborting.
        let assertions_ran = pre_outcome.ok && ran_test && test_outcome.ok;
        let assertions_results = if assertions_ran {
            assertions::evaluate_all(&test_file.assertions, ctx)
        } else {
            Vec::new()
        };

        ctx.reset_last();
        ctx.clear_params();
        let post_outcome = self
            .run_phase(Phase::PostRun, &post_run, ctx, executed, deadline, cancel)
            .await;
        // post_run failures never fail the test (spec.md §4.5); only a
        // mid-post_run cancellation/timeout is worth surfacing.
        let _ = post_outcome;

        let assertions_ok = assertions_results.iter().all(|a| a.passed);
        let passed = pre_outcome.ok && test_outcome.ok && assertions_ok;
        RunOutcome {
            passed,
            error: if passed { None } else { Some(failure_reason(pre_outcome.ok, test_outcome.ok, assertions_ok)) },
            assertions: assertions_results,
        }
    }

    async fn run_phase(
        &self,
        phase: Phase,
        steps: &[Step],
        ctx: &mut Context,
        executed: &mut Vec<ExecutedStep>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> PhaseOutcome {
        ctx.reset_last();
        for (index, step) in steps.iter().enumerate() {
            match &step.params_binding {
                Some(binding) => ctx.bind_params(binding.clone()),
                None => ctx.clear_params(),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                return PhaseOutcome {
                    ok: false,
                    timed_out: true,
                    cancelled: false,
                };
            }

            let result = tokio::select! {
                res = self.handlers.dispatch(step, ctx) => res,
                _ = tokio::time::sleep(remaining) => test_timeout_result(),
                _ = cancel.cancelled() => cancelled_result(),
            };

            let is_test_timeout = result.error.as_deref() == Some("test timeout");
            let is_cancelled = result.error.as_deref() == Some("cancelled");

            ctx.set_last(LastResult {
                exit_code: result.exit_code,
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
            });
            if let Some(name) = &step.capture {
                ctx.capture(name, result.stdout.clone());
            }

            let success_or_ignored = result.success || step.ignore_errors;
            executed.push(ExecutedStep {
                phase,
                index,
                handler: step.handler.clone().unwrap_or_else(|| "routine".to_string()),
                name: step.name.clone(),
                result,
            });

            if is_test_timeout {
                return PhaseOutcome {
                    ok: false,
                    timed_out: true,
                    cancelled: false,
                };
            }
            if is_cancelled {
                return PhaseOutcome {
                    ok: false,
                    timed_out: false,
                    cancelled: true,
                };
            }
            if !success_or_ignored {
                if phase == Phase::PostRun {
                    continue;
                }
                return PhaseOutcome {
                    ok: false,
                    timed_out: false,
                    cancelled: false,
                };
            }
        }
        PhaseOutcome {
            ok: true,
            timed_out: false,
            cancelled: false,
        }
    }
}

/// Adapts [`TestRunner`] to [`TestExecutor`] for standalone-mode
/// dispatch: each call re-reads the test's YAML (tests are independent
/// and run at most once, so there is no benefit to pre-loading every
/// file up front) and runs it in-process rather than inside a container.
pub struct StandaloneExecutor {
    handlers: HandlerRegistry,
    routines: RoutineSet,
    config: Value,
}

impl StandaloneExecutor {
    pub fn new(handlers: HandlerRegistry, routines: RoutineSet, config: Value) -> Self {
        Self {
            handlers,
            routines,
            config,
        }
    }
}

#[async_trait]
impl TestExecutor for StandaloneExecutor {
    async fn execute(&self, descriptor: &TestDescriptor, cancel: CancellationToken) -> TestResult {
        let test_file = match crate::discovery::load_test_file(&descriptor.yaml_path) {
            Ok(tf) => tf,
            Err(e) => {
                error!(test_id = %descriptor.test_id, error = %e, "failed to load test file");
                let mut result = TestResult::skipped(descriptor.test_id.clone(), descriptor.name.clone());
                result.error = Some(format!("crashed: {e}"));
                return result;
            }
        };

        let workdir = descriptor.suite_root.join(".workspaces").join(&descriptor.test_id);
        if let Err(e) = std::fs::create_dir_all(&workdir) {
            let mut result = TestResult::skipped(descriptor.test_id.clone(), descriptor.name.clone());
            result.error = Some(format!("crashed: failed to create workspace: {e}"));
            return result;
        }

        let runner = TestRunner::new(&self.handlers);
        runner
            .run_test(descriptor, &test_file, &self.routines, self.config.clone(), workdir, &cancel)
            .await
    }
}

struct RunOutcome {
    passed: bool,
    error: Option<String>,
    assertions: Vec<crate::protocol::AssertionResult>,
}

impl RunOutcome {
    fn crashed(message: String) -> Self {
        Self {
            passed: false,
            error: Some(message),
            assertions: Vec::new(),
        }
    }

    fn with_error(passed: bool, message: String) -> Self {
        Self {
            passed,
            error: Some(message),
            assertions: Vec::new(),
        }
    }
}

fn failure_reason(pre_ok: bool, test_ok: bool, assertions_ok: bool) -> String {
    if !pre_ok {
        "pre_run step failed".to_string()
    } else if !test_ok {
        "test step failed".to_string()
    } else if !assertions_ok {
        "assertion failed".to_string()
    } else {
        "failed".to_string()
    }
}

fn test_timeout_result() -> crate::protocol::StepResult {
    crate::protocol::StepResult {
        success: false,
        exit_code: 124,
        stdout: String::new(),
        stderr: String::new(),
        error: Some("test timeout".to_string()),
    }
}

fn cancelled_result() -> crate::protocol::StepResult {
    crate::protocol::StepResult {
        success: false,
        exit_code: 1,
        stdout: String::new(),
        stderr: String::new(),
        error: Some("cancelled".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AssertionSpec;
    use serde_json::json;
    use std::collections::HashMap;

    fn shell_step(name: &str, command: &str) -> Step {
        let mut params = HashMap::new();
        params.insert("command".to_string(), json!(command));
        Step {
            name: name.to_string(),
            handler: Some("shell".to_string()),
            routine: None,
            timeout: None,
            ignore_errors: false,
            capture: None,
            workdir: None,
            env: Default::default(),
            params,
            params_binding: None,
        }
    }

    fn descriptor() -> TestDescriptor {
        TestDescriptor::new(
            "uc",
            "tc",
            "Test",
            vec![],
            Duration::from_secs(5),
            std::path::PathBuf::from("/suite/suites/uc/tc/test.yaml"),
            std::path::PathBuf::from("/suite"),
        )
    }

    #[tokio::test]
    async fn single_shell_success_with_passing_assertion() {
        let handlers = HandlerRegistry::with_builtins();
        let runner = TestRunner::new(&handlers);
        let mut out_step = shell_step("echo", "echo ok");
        out_step.capture = Some("out".to_string());

        let test_file = TestFile {
            name: "Test".to_string(),
            description: None,
            tags: vec![],
            timeout: None,
            pre_run: vec![],
            test: vec![out_step],
            assertions: vec![AssertionSpec {
                expr: "${captured.out} contains 'ok'".to_string(),
                message: None,
            }],
            post_run: vec![],
        };

        let result = runner
            .run_test(
                &descriptor(),
                &test_file,
                &RoutineSet::new(),
                json!({}),
                std::path::PathBuf::from("/tmp"),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.passed);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.assertions.len(), 1);
        assert!(result.assertions[0].passed);
    }

    #[tokio::test]
    async fn failure_in_test_still_runs_post_run() {
        let handlers = HandlerRegistry::with_builtins();
        let runner = TestRunner::new(&handlers);
        let mut cleanup = shell_step("cleanup", "echo cleanup");
        cleanup.ignore_errors = true;

        let test_file = TestFile {
            name: "Test".to_string(),
            description: None,
            tags: vec![],
            timeout: None,
            pre_run: vec![],
            test: vec![shell_step("boom", "exit 3")],
            assertions: vec![],
            post_run: vec![cleanup],
        };

        let result = runner
            .run_test(
                &descriptor(),
                &test_file,
                &RoutineSet::new(),
                json!({}),
                std::path::PathBuf::from("/tmp"),
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.passed);
        assert_eq!(result.steps.len(), 2);
        assert!(result.steps[1].result.success);
    }

    #[tokio::test]
    async fn empty_phases_with_no_assertions_pass() {
        let handlers = HandlerRegistry::with_builtins();
        let runner = TestRunner::new(&handlers);
        let test_file = TestFile {
            name: "Empty".to_string(),
            description: None,
            tags: vec![],
            timeout: None,
            pre_run: vec![],
            test: vec![],
            assertions: vec![],
            post_run: vec![],
        };

        let result = runner
            .run_test(
                &descriptor(),
                &test_file,
                &RoutineSet::new(),
                json!({}),
                std::path::PathBuf::from("/tmp"),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.passed);
        assert!(result.steps.is_empty());
    }

    #[tokio::test]
    async fn test_level_timeout_marks_failed() {
        let handlers = HandlerRegistry::with_builtins();
        let runner = TestRunner::new(&handlers);
        let mut d = descriptor();
        d.timeout = Duration::from_millis(200);

        let test_file = TestFile {
            name: "Slow".to_string(),
            description: None,
            tags: vec![],
            timeout: None,
            pre_run: vec![],
            test: vec![shell_step("slow", "sleep 5")],
            assertions: vec![],
            post_run: vec![],
        };

        let result = runner
            .run_test(
                &d,
                &test_file,
                &RoutineSet::new(),
                json!({}),
                std::path::PathBuf::from("/tmp"),
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.passed);
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }
}
