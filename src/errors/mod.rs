//! Structured error codes (spec.md §7's seven-category taxonomy), kept
//! in the teacher's `ErrorCode`/`StructuredError` shape — a numeric code
//! plus an optional step/path/expected/actual context — but remapped
//! from the teacher's five HTTP-centric categories (E1-E5: validation,
//! HTTP, assertion, configuration, internal) onto the engine's seven
//! (configuration, resource, step, assertion, timeout, cancellation,
//! control-plane).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(u16);

impl ErrorCode {
    // E1xxx: configuration — wrong before any test starts.
    pub const MISSING_TEST_FILE: Self = Self(1001);
    pub const MALFORMED_YAML: Self = Self(1002);
    pub const UNKNOWN_HANDLER: Self = Self(1003);
    pub const MISSING_REQUIRED_PARAM: Self = Self(1004);
    pub const UNKNOWN_ROUTINE: Self = Self(1005);

    // E2xxx: resource — fatal to one test attempt, not the run.
    pub const IMAGE_MISSING: Self = Self(2001);
    pub const WORKSPACE_CREATE_FAILED: Self = Self(2002);
    pub const MOUNT_SOURCE_MISSING: Self = Self(2003);

    // E3xxx: step failures.
    pub const STEP_NON_ZERO_EXIT: Self = Self(3001);
    pub const HANDLER_REPORTED_ERROR: Self = Self(3002);

    // E4xxx: assertion failures.
    pub const ASSERTION_FAILED: Self = Self(4001);
    pub const ASSERTION_SYNTAX_ERROR: Self = Self(4002);

    // E5xxx: timeouts.
    pub const STEP_TIMEOUT: Self = Self(5001);
    pub const TEST_TIMEOUT: Self = Self(5002);

    // E6xxx: cancellation.
    pub const CANCELLED_MID_TEST: Self = Self(6001);
    pub const SKIPPED_BEFORE_START: Self = Self(6002);

    // E7xxx: control-plane errors, always best-effort.
    pub const CONTROL_PLANE_REQUEST_FAILED: Self = Self(7001);
    pub const CONTROL_PLANE_REJECTED: Self = Self(7002);

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn formatted(&self) -> String {
        format!("E{:04}", self.0)
    }

    pub fn category(&self) -> ErrorCategory {
        match self.0 / 1000 {
            1 => ErrorCategory::Configuration,
            2 => ErrorCategory::Resource,
            3 => ErrorCategory::Step,
            4 => ErrorCategory::Assertion,
            5 => ErrorCategory::Timeout,
            6 => ErrorCategory::Cancellation,
            7 => ErrorCategory::ControlPlane,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self.0 {
            1001 => "test.yaml not found",
            1002 => "malformed YAML",
            1003 => "unknown handler",
            1004 => "missing required routine parameter",
            1005 => "unknown routine reference",
            2001 => "container image missing locally",
            2002 => "workspace creation failed",
            2003 => "mount source missing",
            3001 => "step exited non-zero",
            3002 => "handler reported an error",
            4001 => "assertion failed",
            4002 => "assertion syntax error",
            5001 => "step timed out",
            5002 => "test timed out",
            6001 => "cancelled mid-test",
            6002 => "skipped before start",
            7001 => "control-plane request failed",
            7002 => "control-plane rejected the write",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Resource,
    Step,
    Assertion,
    Timeout,
    Cancellation,
    ControlPlane,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Resource => write!(f, "resource"),
            Self::Step => write!(f, "step"),
            Self::Assertion => write!(f, "assertion"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancellation => write!(f, "cancellation"),
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug)]
pub struct StructuredError {
    pub code: ErrorCode,
    pub message: String,
    pub context: Option<ErrorContext>,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub test_id: Option<String>,
    pub step_name: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl StructuredError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_test_id(mut self, test_id: impl Into<String>) -> Self {
        self.context.get_or_insert_with(ErrorContext::default).test_id = Some(test_id.into());
        self
    }

    pub fn user_message(&self) -> String {
        let mut msg = format!("[{}] {}", self.code, self.message);
        if let Some(ctx) = &self.context {
            if let Some(test_id) = &ctx.test_id {
                msg.push_str(&format!(" (test: {test_id})"));
            }
            if let Some(step_name) = &ctx.step_name {
                msg.push_str(&format!(" (step: {step_name})"));
            }
            if let (Some(expected), Some(actual)) = (&ctx.expected, &ctx.actual) {
                msg.push_str(&format!(" [expected: {expected}, actual: {actual}]"));
            }
        }
        msg
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for StructuredError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_leading_zero() {
        assert_eq!(ErrorCode::MISSING_TEST_FILE.formatted(), "E1001");
        assert_eq!(ErrorCode::STEP_TIMEOUT.formatted(), "E5001");
    }

    #[test]
    fn categorizes_by_leading_digit() {
        assert_eq!(ErrorCode::UNKNOWN_HANDLER.category(), ErrorCategory::Configuration);
        assert_eq!(ErrorCode::IMAGE_MISSING.category(), ErrorCategory::Resource);
        assert_eq!(ErrorCode::ASSERTION_FAILED.category(), ErrorCategory::Assertion);
        assert_eq!(ErrorCode::CANCELLED_MID_TEST.category(), ErrorCategory::Cancellation);
        assert_eq!(
            ErrorCode::CONTROL_PLANE_REQUEST_FAILED.category(),
            ErrorCategory::ControlPlane
        );
    }

    #[test]
    fn user_message_includes_context() {
        let err = StructuredError::new(ErrorCode::ASSERTION_FAILED, "status mismatch")
            .with_test_id("auth/login")
            .with_context(ErrorContext {
                test_id: Some("auth/login".to_string()),
                step_name: Some("check_status".to_string()),
                expected: Some("200".to_string()),
                actual: Some("404".to_string()),
            });
        let msg = err.user_message();
        assert!(msg.contains("E4001"));
        assert!(msg.contains("auth/login"));
        assert!(msg.contains("expected: 200, actual: 404"));
    }
}
