//! Handler Registry (spec.md §4.3): dispatches a step to its named
//! handler and returns a uniform `StepResult`.
//!
//! Trait shape is the teacher's `executors::StepExecutor` renamed and
//! trimmed: `can_handle` collapses into a registry keyed by name since
//! the handler set is fixed and spec'd, not probed per-action.

pub mod file;
pub mod http;
pub mod npm_install;
pub mod pip_install;
pub mod shell;
pub mod wait;

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::context::Context;
use crate::protocol::{Step, StepResult};

#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, step: &Step, ctx: &mut Context) -> StepResult;
}

/// Read-only after construction; lock-free reads (spec.md §5).
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn with_builtins() -> Self {
        let builtins: Vec<Arc<dyn Handler>> = vec![
            Arc::new(shell::ShellHandler),
            Arc::new(wait::WaitHandler),
            Arc::new(file::FileHandler),
            Arc::new(http::HttpHandler::new()),
            Arc::new(npm_install::NpmInstallHandler),
            Arc::new(pip_install::PipInstallHandler),
        ];
        let mut handlers = HashMap::new();
        for h in builtins {
            handlers.insert(h.name(), h);
        }
        Self { handlers }
    }

    pub async fn dispatch(&self, step: &Step, ctx: &mut Context) -> StepResult {
        let Some(name) = step.handler.as_deref() else {
            return StepResult::fail(1, "step has no handler");
        };
        match self.handlers.get(name) {
            Some(h) => h.execute(step, ctx).await,
            None => StepResult::fail(1, format!("unknown handler: {name}")),
        }
    }
}

/// Shared by `shell`, `wait`'s `command` sub-type, and the package
/// installers — all of them ultimately shell out and enforce a timeout.
pub async fn run_shell(
    command: &str,
    workdir: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> StepResult {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workdir)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Both the inner timeout below and an outer cancellation
        // (runner::run_phase's tokio::select!) drop this future without
        // ever observing it finish; kill_on_drop is what actually sends
        // SIGKILL to bash (and its child) rather than orphaning it.
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return StepResult::fail(1, format!("failed to spawn shell: {e}")),
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(1);
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if exit_code == 0 {
                StepResult::ok(0, stdout, stderr)
            } else {
                StepResult {
                    success: false,
                    exit_code,
                    stdout,
                    stderr,
                    error: Some(format!("command exited with status {exit_code}")),
                }
            }
        }
        Ok(Err(e)) => StepResult::fail(1, format!("shell execution error: {e}")),
        Err(_) => StepResult::timeout(),
    }
}

pub fn step_timeout(step: &Step, default_secs: u64) -> Duration {
    Duration::from_secs(step.timeout.unwrap_or(default_secs))
}

pub fn step_workdir(step: &Step, ctx: &Context) -> std::path::PathBuf {
    match &step.workdir {
        Some(w) => {
            let resolved = ctx.interpolate(w);
            let p = std::path::PathBuf::from(resolved);
            if p.is_absolute() {
                p
            } else {
                ctx.workdir.join(p)
            }
        }
        None => ctx.workdir.clone(),
    }
}

/// Interpolates every value in a step's `env` map against the context,
/// plus `TSUITE_API` when present in the ambient process environment
/// (spec.md §4.3: `shell` inherits process environment plus `TSUITE_API`).
pub fn step_env(step: &Step, ctx: &Context) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = step
        .env
        .iter()
        .map(|(k, v)| (k.clone(), ctx.interpolate(v)))
        .collect();
    if let Ok(api) = std::env::var("TSUITE_API") {
        env.entry("TSUITE_API".to_string()).or_insert(api);
    }
    env
}
