//! `pip-install` handler (spec.md §4.3): bootstraps a Python package
//! directory's `requirements.txt`. Mirrors `npm-install`'s "replace"
//! dialect for `file:`-style local-path requirements, but pip has no
//! `"*"` wildcard version, so an unresolved SDK version is left
//! unpinned (bare package name) rather than synthesised.

use async_trait::async_trait;

use super::{run_shell, step_env, step_timeout, step_workdir, Handler};
use crate::context::Context;
use crate::protocol::{Step, StepResult};

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const LOCAL_PACKAGE_DIR: &str = "local-packages";

pub struct PipInstallHandler;

#[async_trait]
impl Handler for PipInstallHandler {
    fn name(&self) -> &'static str {
        "pip-install"
    }

    async fn execute(&self, step: &Step, ctx: &mut Context) -> StepResult {
        let target = step_workdir(step, ctx);
        let requirements_path = target.join("requirements.txt");

        if requirements_path.exists() {
            let raw = match std::fs::read_to_string(&requirements_path) {
                Ok(r) => r,
                Err(e) => {
                    return StepResult::fail(1, format!("failed to read requirements.txt: {e}"))
                }
            };
            let version = resolve_sdk_version(ctx);
            let rewritten = rewrite_file_requirements(&raw, version.as_deref());
            if let Err(e) = std::fs::write(&requirements_path, rewritten) {
                return StepResult::fail(1, format!("failed to write requirements.txt: {e}"));
            }
        }

        let env = step_env(step, ctx);
        let timeout = step_timeout(step, DEFAULT_TIMEOUT_SECS);
        let local_dir = target.join(LOCAL_PACKAGE_DIR);

        let command = if local_dir.exists() {
            format!(
                "pip install {} && pip install -r requirements.txt",
                local_dir.to_string_lossy()
            )
        } else {
            "pip install -r requirements.txt".to_string()
        };

        run_shell(&command, &target, &env, timeout).await
    }
}

fn resolve_sdk_version(ctx: &Context) -> Option<String> {
    match ctx.resolve_ref("config.packages.sdk_python_version") {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Rewrites `<name> @ file:<path>` lines to `<name>==<version>` (or
/// bare `<name>` when no version is configured).
fn rewrite_file_requirements(contents: &str, version: Option<&str>) -> String {
    contents
        .lines()
        .map(|line| {
            let Some((name, rest)) = line.split_once('@') else {
                return line.to_string();
            };
            if rest.trim().starts_with("file:") {
                let name = name.trim();
                match version {
                    Some(v) => format!("{name}=={v}"),
                    None => name.to_string(),
                }
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_file_requirement_with_version() {
        let input = "requests==2.0\nsdk @ file:../sdk-py\n";
        let out = rewrite_file_requirements(input, Some("1.0.0"));
        assert!(out.contains("sdk==1.0.0"));
        assert!(out.contains("requests==2.0"));
    }

    #[test]
    fn leaves_unpinned_without_configured_version() {
        let input = "sdk @ file:../sdk-py";
        let out = rewrite_file_requirements(input, None);
        assert_eq!(out, "sdk");
    }
}
