//! `file` handler (spec.md §4.3): `exists | read | write | delete | mkdir`.
//! Paths are interpolated and made absolute against the step's workdir.

use async_trait::async_trait;

use super::{step_workdir, Handler};
use crate::context::Context;
use crate::protocol::{Step, StepResult};

pub struct FileHandler;

#[async_trait]
impl Handler for FileHandler {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn execute(&self, step: &Step, ctx: &mut Context) -> StepResult {
        let Some(operation) = step.param_str("operation") else {
            return StepResult::fail(1, "file step missing `operation`");
        };
        let Some(raw_path) = step.param_str("path") else {
            return StepResult::fail(1, "file step missing `path`");
        };
        let path = resolve_path(step, ctx, raw_path);

        match operation {
            "exists" => {
                if path.exists() {
                    StepResult::ok(0, "true", "")
                } else {
                    StepResult::ok(1, "false", "")
                }
            }
            "read" => match std::fs::read_to_string(&path) {
                Ok(contents) => StepResult::ok(0, contents, ""),
                Err(e) => StepResult::fail(1, format!("read failed: {e}")),
            },
            "write" => {
                let Some(content) = step.param_str("content") else {
                    return StepResult::fail(1, "file write missing `content`");
                };
                let content = ctx.interpolate(content);
                if let Some(parent) = path.parent() {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        return StepResult::fail(1, format!("mkdir -p failed: {e}"));
                    }
                }
                match std::fs::write(&path, content) {
                    Ok(()) => StepResult::ok(0, "", ""),
                    Err(e) => StepResult::fail(1, format!("write failed: {e}")),
                }
            }
            "delete" => match std::fs::remove_file(&path) {
                Ok(()) => StepResult::ok(0, "", ""),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => StepResult::ok(0, "", ""),
                Err(e) => StepResult::fail(1, format!("delete failed: {e}")),
            },
            "mkdir" => match std::fs::create_dir_all(&path) {
                Ok(()) => StepResult::ok(0, "", ""),
                Err(e) => StepResult::fail(1, format!("mkdir failed: {e}")),
            },
            other => StepResult::fail(1, format!("unknown file operation: {other}")),
        }
    }
}

fn resolve_path(step: &Step, ctx: &Context, raw_path: &str) -> std::path::PathBuf {
    let interpolated = ctx.interpolate(raw_path);
    let p = std::path::PathBuf::from(interpolated);
    if p.is_absolute() {
        p
    } else {
        step_workdir(step, ctx).join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_with(params: serde_json::Map<String, serde_json::Value>) -> Step {
        Step {
            name: "f".to_string(),
            handler: Some("file".to_string()),
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
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(json!({}), dir.path().to_path_buf());

        let mut write_params = serde_json::Map::new();
        write_params.insert("operation".to_string(), json!("write"));
        write_params.insert("path".to_string(), json!("out.txt"));
        write_params.insert("content".to_string(), json!("hello"));
        let write_result = FileHandler.execute(&step_with(write_params), &mut ctx).await;
        assert!(write_result.success);

        let mut read_params = serde_json::Map::new();
        read_params.insert("operation".to_string(), json!("read"));
        read_params.insert("path".to_string(), json!("out.txt"));
        let read_result = FileHandler.execute(&step_with(read_params), &mut ctx).await;
        assert!(read_result.success);
        assert_eq!(read_result.stdout, "hello");
    }

    #[tokio::test]
    async fn exists_false_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(json!({}), dir.path().to_path_buf());
        let mut params = serde_json::Map::new();
        params.insert("operation".to_string(), json!("exists"));
        params.insert("path".to_string(), json!("missing.txt"));
        let result = FileHandler.execute(&step_with(params), &mut ctx).await;
        assert_eq!(result.stdout, "false");
    }
}
