//! `wait` handler (spec.md §4.3): four sub-types selected by `type`.
//!
//! Sub-type dispatch and the `default`/`seconds` sleep form are adapted
//! from the teacher's `executors/wait.rs`; `http`/`file`/`command`
//! polling are new, grounded in the same poll-until-timeout shape.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{run_shell, step_env, step_workdir, Handler};
use crate::context::Context;
use crate::protocol::{Step, StepResult};

const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_INTERVAL_SECS: u64 = 2;

pub struct WaitHandler;

#[async_trait]
impl Handler for WaitHandler {
    fn name(&self) -> &'static str {
        "wait"
    }

    async fn execute(&self, step: &Step, ctx: &mut Context) -> StepResult {
        match step.param_str("type") {
            None | Some("seconds") => wait_seconds(step, ctx).await,
            Some("http") => wait_http(step, ctx).await,
            Some("file") => wait_file(step, ctx).await,
            Some("command") => wait_command(step, ctx).await,
            Some(other) => StepResult::fail(1, format!("unknown wait type: {other}")),
        }
    }
}

async fn wait_seconds(step: &Step, _ctx: &Context) -> StepResult {
    let secs = step.param_u64("seconds").unwrap_or(0);
    tokio::time::sleep(Duration::from_secs(secs)).await;
    StepResult::ok(0, "", "")
}

async fn wait_http(step: &Step, ctx: &mut Context) -> StepResult {
    let Some(url) = step.param_str("url") else {
        return StepResult::fail(1, "wait(http) missing `url`");
    };
    let url = ctx.interpolate(url);
    let interval = Duration::from_secs(step.param_u64("interval").unwrap_or(DEFAULT_INTERVAL_SECS));
    let timeout = Duration::from_secs(
        step.param_u64("timeout")
            .unwrap_or(DEFAULT_POLL_TIMEOUT_SECS),
    );
    let expect_status: Vec<u64> = step
        .params
        .get("expect_status")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_u64()).collect())
        .unwrap_or_else(|| vec![200]);

    let client = reqwest::Client::new();
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(resp) = client.get(&url).send().await {
            let status = resp.status().as_u16() as u64;
            if expect_status.contains(&status) {
                return StepResult::ok(0, format!("status {status}"), "");
            }
        }
        if Instant::now() >= deadline {
            return StepResult::timeout();
        }
        tokio::time::sleep(interval).await;
    }
}

async fn wait_file(step: &Step, ctx: &mut Context) -> StepResult {
    let Some(path) = step.param_str("path") else {
        return StepResult::fail(1, "wait(file) missing `path`");
    };
    let path = ctx.interpolate(path);
    let workdir = step_workdir(step, ctx);
    let full = {
        let p = std::path::PathBuf::from(&path);
        if p.is_absolute() {
            p
        } else {
            workdir.join(p)
        }
    };
    let timeout = Duration::from_secs(
        step.param_u64("timeout")
            .unwrap_or(DEFAULT_POLL_TIMEOUT_SECS),
    );
    let interval = Duration::from_secs(step.param_u64("interval").unwrap_or(DEFAULT_INTERVAL_SECS));
    let deadline = Instant::now() + timeout;
    loop {
        if full.exists() {
            return StepResult::ok(0, "", "");
        }
        if Instant::now() >= deadline {
            return StepResult::timeout();
        }
        tokio::time::sleep(interval).await;
    }
}

async fn wait_command(step: &Step, ctx: &mut Context) -> StepResult {
    let Some(command) = step.param_str("command") else {
        return StepResult::fail(1, "wait(command) missing `command`");
    };
    let command = ctx.interpolate(command);
    let workdir = step_workdir(step, ctx);
    let env = step_env(step, ctx);
    let timeout = Duration::from_secs(
        step.param_u64("timeout")
            .unwrap_or(DEFAULT_POLL_TIMEOUT_SECS),
    );
    let interval = Duration::from_secs(step.param_u64("interval").unwrap_or(DEFAULT_INTERVAL_SECS));
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = run_shell(&command, &workdir, &env, remaining).await;
        if result.success {
            return result;
        }
        if Instant::now() >= deadline {
            return StepResult::timeout();
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn step_with(params: serde_json::Map<String, serde_json::Value>) -> Step {
        Step {
            name: "w".to_string(),
            handler: Some("wait".to_string()),
            routine: None,
            timeout: None,
            ignore_errors: false,
            capture: None,
            workdir: None,
            env: Default::default(),
            params: params.into_iter().collect(),
            params_binding: None,
        }
    }

    #[tokio::test]
    async fn sleeps_for_requested_seconds() {
        let mut ctx = Context::new(json!({}), PathBuf::from("/tmp"));
        let mut params = serde_json::Map::new();
        params.insert("seconds".to_string(), json!(0));
        let start = Instant::now();
        let result = WaitHandler.execute(&step_with(params), &mut ctx).await;
        assert!(result.success);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn file_wait_times_out_when_absent() {
        let mut ctx = Context::new(json!({}), PathBuf::from("/tmp"));
        let mut params = serde_json::Map::new();
        params.insert("type".to_string(), json!("file"));
        params.insert("path".to_string(), json!("/definitely/does/not/exist"));
        params.insert("timeout".to_string(), json!(1));
        params.insert("interval".to_string(), json!(1));
        let result = WaitHandler.execute(&step_with(params), &mut ctx).await;
        assert_eq!(result.exit_code, 124);
    }
}
