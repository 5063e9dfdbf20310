//! Pre-flight validation (spec.md §7.1, configuration errors): catches
//! what would otherwise surface as a first-step failure inside a
//! container, before any worker or sandbox is spent on it.
//!
//! Shape follows the teacher's `validation/mod.rs`: a `ValidationError`
//! enum via `thiserror`, a `Vec<ValidationError>` accumulator instead of
//! fail-fast, and one entry function per unit (suite config, test file).
//! The teacher's DAG-cycle detection has no counterpart here — steps run
//! strictly in declared order within a phase, there is no `depends_on`
//! graph to walk.

use std::collections::HashSet;

use thiserror::Error;

use crate::config::SuiteConfig;
use crate::protocol::{AssertionSpec, Phase, Step, TestFile};
use crate::routines::RoutineSet;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{phase}[{index}] `{name}`: unknown handler `{handler}`")]
    UnknownHandler {
        phase: &'static str,
        index: usize,
        name: String,
        handler: String,
    },

    #[error("{phase}[{index}] `{name}`: must declare exactly one of `handler` or `routine`")]
    AmbiguousStepTarget {
        phase: &'static str,
        index: usize,
        name: String,
    },

    #[error("{phase}[{index}] `{name}`: missing required parameter `{param}`")]
    MissingRequiredParam {
        phase: &'static str,
        index: usize,
        name: String,
        param: String,
    },

    #[error("{phase}[{index}] `{name}`: {detail}")]
    UnknownRoutine {
        phase: &'static str,
        index: usize,
        name: String,
        detail: String,
    },

    #[error("assertions[{index}]: empty expression")]
    EmptyAssertionExpr { index: usize },

    #[error("docker mode requires `docker.base_image`")]
    MissingBaseImage,

    #[error("execution.max_workers must be at least 1, got {value}")]
    ZeroWorkers { value: u32 },
}

pub type ValidationResult = Result<(), Vec<ValidationError>>;

const KNOWN_HANDLERS: &[&str] = &["shell", "wait", "file", "http", "npm-install", "pip-install"];

/// Validates the suite-level `config.yaml`.
pub fn validate_config(config: &SuiteConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.suite.mode == crate::config::Mode::Docker && config.docker.is_none() {
        errors.push(ValidationError::MissingBaseImage);
    }
    if config.execution.max_workers == 0 {
        errors.push(ValidationError::ZeroWorkers {
            value: config.execution.max_workers,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validates one `test.yaml`, given the routine set visible to its use
/// case. Collects every problem found rather than stopping at the
/// first (matches the teacher's accumulate-then-report style).
///
/// A test.yaml with every phase empty and no assertions is valid: it
/// passes trivially (spec.md §8), it isn't malformed.
pub fn validate_test_file(test_file: &TestFile, routines: &RoutineSet, use_case: &str) -> ValidationResult {
    let mut errors = Vec::new();

    for (index, assertion) in test_file.assertions.iter().enumerate() {
        validate_assertion(index, assertion, &mut errors);
    }

    validate_phase_steps(Phase::PreRun, &test_file.pre_run, routines, use_case, &mut errors);
    validate_phase_steps(Phase::Test, &test_file.test, routines, use_case, &mut errors);
    validate_phase_steps(Phase::PostRun, &test_file.post_run, routines, use_case, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_assertion(index: usize, assertion: &AssertionSpec, errors: &mut Vec<ValidationError>) {
    if assertion.expr.trim().is_empty() {
        errors.push(ValidationError::EmptyAssertionExpr { index });
    }
}

fn validate_phase_steps(
    phase: Phase,
    steps: &[Step],
    routines: &RoutineSet,
    use_case: &str,
    errors: &mut Vec<ValidationError>,
) {
    for (index, step) in steps.iter().enumerate() {
        validate_step(phase, index, step, routines, use_case, errors);
    }
}

fn validate_step(
    phase: Phase,
    index: usize,
    step: &Step,
    routines: &RoutineSet,
    use_case: &str,
    errors: &mut Vec<ValidationError>,
) {
    match (&step.handler, &step.routine) {
        (Some(handler), None) => validate_handler_step(phase, index, step, handler, errors),
        (None, Some(reference)) => validate_routine_step(phase, index, step, reference, routines, use_case, errors),
        _ => errors.push(ValidationError::AmbiguousStepTarget {
            phase: phase.as_str(),
            index,
            name: step.name.clone(),
        }),
    }
}

fn validate_handler_step(
    phase: Phase,
    index: usize,
    step: &Step,
    handler: &str,
    errors: &mut Vec<ValidationError>,
) {
    if !KNOWN_HANDLERS.contains(&handler) {
        errors.push(ValidationError::UnknownHandler {
            phase: phase.as_str(),
            index,
            name: step.name.clone(),
            handler: handler.to_string(),
        });
        return;
    }

    let missing = |param: &str| ValidationError::MissingRequiredParam {
        phase: phase.as_str(),
        index,
        name: step.name.clone(),
        param: param.to_string(),
    };

    match handler {
        "shell" => {
            if step.param_str("command").is_none() {
                errors.push(missing("command"));
            }
        }
        "http" => {
            if step.param_str("url").is_none() {
                errors.push(missing("url"));
            }
        }
        "file" => {
            match step.param_str("operation") {
                None => errors.push(missing("operation")),
                Some("write") if step.param_str("content").is_none() => errors.push(missing("content")),
                _ => {}
            }
            if step.param_str("path").is_none() {
                errors.push(missing("path"));
            }
        }
        "wait" => match step.param_str("type") {
            None | Some("seconds") => {}
            Some("http") if step.param_str("url").is_none() => errors.push(missing("url")),
            Some("file") if step.param_str("path").is_none() => errors.push(missing("path")),
            Some("command") if step.param_str("command").is_none() => errors.push(missing("command")),
            Some(_) => {}
        },
        // npm-install / pip-install need only a workdir, already covered
        // by `step_workdir`'s fallback to the test workspace root.
        _ => {}
    }
}

fn validate_routine_step(
    phase: Phase,
    index: usize,
    step: &Step,
    reference: &str,
    routines: &RoutineSet,
    use_case: &str,
    errors: &mut Vec<ValidationError>,
) {
    if let Err(detail) = crate::routines::flatten_phase(std::slice::from_ref(step), routines, use_case) {
        errors.push(ValidationError::UnknownRoutine {
            phase: phase.as_str(),
            index,
            name: step.name.clone(),
            detail,
        });
    }
}

/// Cross-checks that every `routine:` reference reachable from a test
/// file's three phases resolves, without binding params (used by
/// discovery to fail a whole suite load fast if a routine file is
/// missing an entry referenced elsewhere).
pub fn referenced_routines(test_file: &TestFile) -> HashSet<&str> {
    test_file
        .pre_run
        .iter()
        .chain(test_file.test.iter())
        .chain(test_file.post_run.iter())
        .filter_map(|s| s.routine.as_deref())
        .collect()
}
