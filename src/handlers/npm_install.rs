//! `npm-install` handler (spec.md §4.3): bootstraps an npm package
//! directory. Adopts the "replace" dialect for `file:` dependency
//! rewriting (spec.md §9 open question) — `file:` deps in `package.json`
//! are rewritten to a version derived from `config.packages.*`, not
//! stripped.

use async_trait::async_trait;
use serde_json::Value;

use super::{run_shell, step_env, step_timeout, step_workdir, Handler};
use crate::context::Context;
use crate::protocol::{Step, StepResult};

const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// Directory, relative to the install target, that holds a pre-built
/// local copy of the package for offline/overlay installs.
const LOCAL_PACKAGE_DIR: &str = "local-packages";

pub struct NpmInstallHandler;

#[async_trait]
impl Handler for NpmInstallHandler {
    fn name(&self) -> &'static str {
        "npm-install"
    }

    async fn execute(&self, step: &Step, ctx: &mut Context) -> StepResult {
        let target = step_workdir(step, ctx);
        let manifest_path = target.join("package.json");

        if manifest_path.exists() {
            let raw = match std::fs::read_to_string(&manifest_path) {
                Ok(r) => r,
                Err(e) => return StepResult::fail(1, format!("failed to read package.json: {e}")),
            };
            let mut manifest: Value = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => return StepResult::fail(1, format!("invalid package.json: {e}")),
            };
            let version = resolve_sdk_version(ctx, "sdk_typescript_version");
            rewrite_file_deps(&mut manifest, "dependencies", &version);
            rewrite_file_deps(&mut manifest, "devDependencies", &version);
            let rewritten = match serde_json::to_string_pretty(&manifest) {
                Ok(s) => s,
                Err(e) => return StepResult::fail(1, format!("failed to serialize package.json: {e}")),
            };
            if let Err(e) = std::fs::write(&manifest_path, rewritten) {
                return StepResult::fail(1, format!("failed to write package.json: {e}"));
            }
        }

        let env = step_env(step, ctx);
        let timeout = step_timeout(step, DEFAULT_TIMEOUT_SECS);
        let local_dir = target.join(LOCAL_PACKAGE_DIR);

        let command = if local_dir.exists() {
            format!(
                "npm install {} && npm install",
                local_dir.to_string_lossy()
            )
        } else {
            "npm install".to_string()
        };

        run_shell(&command, &target, &env, timeout).await
    }
}

fn resolve_sdk_version(ctx: &Context, config_key: &str) -> String {
    match ctx.resolve_ref(&format!("config.packages.{config_key}")) {
        Value::String(s) if !s.is_empty() => s,
        Value::Number(n) => n.to_string(),
        _ => "*".to_string(),
    }
}

fn rewrite_file_deps(manifest: &mut Value, section: &str, version: &str) {
    let Some(deps) = manifest.get_mut(section).and_then(|v| v.as_object_mut()) else {
        return;
    };
    for (_, v) in deps.iter_mut() {
        if matches!(v.as_str(), Some(s) if s.starts_with("file:")) {
            *v = Value::String(version.to_string());
        }
    }
}
