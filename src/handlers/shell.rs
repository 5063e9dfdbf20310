//! `shell` handler (spec.md §4.3): runs `bash -c <command>` with the
//! interpolated command string.

use async_trait::async_trait;

use super::{run_shell, step_env, step_timeout, step_workdir, Handler};
use crate::context::Context;
use crate::protocol::{Step, StepResult};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub struct ShellHandler;

#[async_trait]
impl Handler for ShellHandler {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, step: &Step, ctx: &mut Context) -> StepResult {
        let Some(command) = step.param_str("command") else {
            return StepResult::fail(1, "shell step missing `command`");
        };
        let command = ctx.interpolate(command);
        let workdir = step_workdir(step, ctx);
        let env = step_env(step, ctx);
        let timeout = step_timeout(step, DEFAULT_TIMEOUT_SECS);
        run_shell(&command, &workdir, &env, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn step(command: &str) -> Step {
        let mut params = std::collections::HashMap::new();
        params.insert("command".to_string(), json!(command));
        Step {
            name: "s".to_string(),
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

    #[tokio::test]
    async fn echo_succeeds() {
        let mut ctx = Context::new(json!({}), PathBuf::from("/tmp"));
        let result = ShellHandler.execute(&step("echo hi"), &mut ctx).await;
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure() {
        let mut ctx = Context::new(json!({}), PathBuf::from("/tmp"));
        let result = ShellHandler.execute(&step("exit 3"), &mut ctx).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_returns_124() {
        let mut ctx = Context::new(json!({}), PathBuf::from("/tmp"));
        let mut s = step("sleep 5");
        s.timeout = Some(1);
        let result = ShellHandler.execute(&s, &mut ctx).await;
        assert_eq!(result.exit_code, 124);
        assert!(!result.success);
    }
}
