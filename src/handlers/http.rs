//! `http` handler (spec.md §4.3): a single interpolated HTTP request.
//! Response body becomes `stdout`; the numeric status becomes
//! `exit_code` (0 iff the status is in the 200-299 range, matching the
//! rest of the engine's POSIX-style exit-code convention).
//!
//! `reqwest::Client` construction and the method/headers/body handling
//! follow the teacher's `executors/http.rs`; assertion wiring is
//! removed here since assertions are evaluated at the test level
//! (spec.md §4.2), not per-step as in the teacher.

use async_trait::async_trait;
use reqwest::{Client, Method};
use tracing::debug;

use super::{step_timeout, Handler};
use crate::context::Context;
use crate::protocol::{Step, StepResult};
use crate::telemetry::instrumentation::HttpSpanContext;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct HttpHandler {
    client: Client,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Handler for HttpHandler {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn execute(&self, step: &Step, ctx: &mut Context) -> StepResult {
        let Some(raw_url) = step.param_str("url") else {
            return StepResult::fail(1, "http step missing `url`");
        };
        let url = ctx.interpolate(raw_url);

        let method_str = step.param_str("method").unwrap_or("GET");
        let method = match Method::from_bytes(method_str.to_uppercase().as_bytes()) {
            Ok(m) => m,
            Err(_) => return StepResult::fail(1, format!("invalid HTTP method: {method_str}")),
        };

        let mut request = self.client.request(method, &url);

        if let Some(headers) = step.params.get("headers").and_then(|v| v.as_object()) {
            for (k, v) in headers {
                let value = match v.as_str() {
                    Some(s) => ctx.interpolate(s),
                    None => v.to_string(),
                };
                request = request.header(k, value);
            }
        }

        if let Some(body) = step.params.get("body") {
            let interpolated = interpolate_json(body, ctx);
            request = request.json(&interpolated);
        }

        let timeout = step_timeout(step, DEFAULT_TIMEOUT_SECS);
        let mut span = HttpSpanContext::new(method_str, &url, &step.name);
        match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                let exit_code = if (200..300).contains(&status) { 0 } else { 1 };
                span.finish(status);
                debug!(attributes = ?span.attributes(), "http step completed");
                match tokio::time::timeout(timeout, response.text()).await {
                    Ok(Ok(body)) => StepResult {
                        success: exit_code == 0,
                        exit_code,
                        stdout: body,
                        stderr: String::new(),
                        error: if exit_code == 0 {
                            None
                        } else {
                            Some(format!("HTTP status {status}"))
                        },
                    },
                    Ok(Err(e)) => StepResult::fail(1, format!("failed to read response body: {e}")),
                    Err(_) => StepResult::timeout(),
                }
            }
            Ok(Err(e)) => StepResult::fail(1, format!("HTTP request failed: {e}")),
            Err(_) => StepResult::timeout(),
        }
    }
}

/// Recursively interpolates every string leaf of a JSON body before it
/// is sent, so `${captured.token}` works inside nested request bodies.
fn interpolate_json(value: &serde_json::Value, ctx: &Context) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(ctx.interpolate(s)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| interpolate_json(v, ctx)).collect())
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), interpolate_json(v, ctx));
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn interpolates_nested_body() {
        let mut ctx = Context::new(json!({}), PathBuf::from("/tmp"));
        ctx.capture("token", "abc123");
        let body = json!({"auth": {"bearer": "${captured.token}"}, "n": 3});
        let out = interpolate_json(&body, &ctx);
        assert_eq!(out["auth"]["bearer"], "abc123");
        assert_eq!(out["n"], 3);
    }
}
