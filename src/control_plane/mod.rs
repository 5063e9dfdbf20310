//! Control-Plane Client (spec.md §4.8, §6.4): a thin REST client over
//! the run/test reporting contract. All writes are best-effort — a
//! failed request is logged and the run continues, since the test
//! outcome is always written to stdout regardless (spec.md §4.8).
//!
//! `reqwest::Client` usage follows the teacher's `executors/http.rs`
//! pattern (build once, `.json()` bodies, explicit timeout); unlike that
//! handler, failures here never become a `StepResult` — there is no step
//! to fail, only a log line.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::protocol::{RunState, TestResult};
use crate::scheduler::ResultReporter;

const REQUEST_TIMEOUT_SECS: u64 = 30;

pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct CreateRunBody<'a> {
    suite_name: &'a str,
    tests: &'a [String],
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// `POST /api/runs`. Returns the server-assigned run id on success;
    /// `None` on any failure (logged, not fatal — the run proceeds
    /// without control-plane reporting per spec.md §4.8).
    pub async fn create_run(&self, suite_name: &str, test_ids: &[String]) -> Option<String> {
        let body = CreateRunBody {
            suite_name,
            tests: test_ids,
        };
        let url = format!("{}/api/runs", self.base_url);
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(v) => v.get("run_id").and_then(|r| r.as_str()).map(str::to_string),
                Err(e) => {
                    warn!(error = %e, "create_run: malformed response body");
                    None
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "create_run failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "create_run request failed");
                None
            }
        }
    }

    /// `PATCH /api/runs/{run_id}/test/{test_id}` with `status: "running"`,
    /// sent the moment a worker picks the test up — must reach the
    /// control plane before the matching terminal `report_test` write
    /// (spec.md §1, §5).
    pub async fn report_running(&self, run_id: &str, test_id: &str) {
        let url = format!("{}/api/runs/{}/test/{}", self.base_url, run_id, test_id);
        let body = json!({ "status": "running" });
        self.patch_best_effort(&url, &body, "report_running").await;
    }

    /// `PATCH /api/runs/{run_id}/test/{test_id}`. Idempotent at the
    /// server (spec.md §6.4): a 409/4xx on a repeat terminal write is
    /// tolerated, not treated as a run-level failure.
    pub async fn report_test(&self, run_id: &str, result: &TestResult) {
        let url = format!("{}/api/runs/{}/test/{}", self.base_url, run_id, result.test_id);
        let steps_passed = result.steps.iter().filter(|s| s.result.success).count();
        let steps_failed = result.steps.len() - steps_passed;
        let body = json!({
            "status": result.state(),
            "duration_ms": result.duration_ms,
            "error_message": result.error,
            "steps_passed": steps_passed,
            "steps_failed": steps_failed,
            "steps": result.steps,
            "assertions": result.assertions,
        });
        self.patch_best_effort(&url, &body, "report_test").await;
    }

    /// `PATCH /api/runs/{run_id}`, used only to push a non-default
    /// terminal run status (`cancelled`); ordinary completion goes
    /// through [`ControlPlaneClient::complete_run`].
    pub async fn set_run_state(&self, run_id: &str, state: RunState) {
        let url = format!("{}/api/runs/{}", self.base_url, run_id);
        let body = json!({ "status": state });
        self.patch_best_effort(&url, &body, "set_run_state").await;
    }

    /// `POST /api/runs/{run_id}/complete`, sent once the dispatch queue
    /// has fully drained.
    pub async fn complete_run(&self, run_id: &str) {
        let url = format!("{}/api/runs/{}/complete", self.base_url, run_id);
        match self.client.post(&url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 409 => {}
            Ok(resp) => warn!(status = %resp.status(), "complete_run rejected"),
            Err(e) => warn!(error = %e, "complete_run request failed"),
        }
    }

    /// `GET /api/runs/{run_id}`, used by the Cancel Checker to poll
    /// `cancel_requested`.
    pub async fn fetch_run(&self, run_id: &str) -> Option<Value> {
        let url = format!("{}/api/runs/{}", self.base_url, run_id);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<Value>().await.ok(),
            Ok(resp) => {
                warn!(status = %resp.status(), "fetch_run failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "fetch_run request failed");
                None
            }
        }
    }

    async fn patch_best_effort(&self, url: &str, body: &Value, op: &'static str) {
        match self.client.patch(url).json(body).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 409 => {}
            Ok(resp) => warn!(status = %resp.status(), op, "request rejected"),
            Err(e) => warn!(error = %e, op, "request failed"),
        }
    }
}

/// Binds a [`ControlPlaneClient`] to a single run so the scheduler can
/// report live status without knowing about run ids at all.
pub struct ControlPlaneReporter {
    client: Arc<ControlPlaneClient>,
    run_id: String,
}

impl ControlPlaneReporter {
    pub fn new(client: Arc<ControlPlaneClient>, run_id: String) -> Self {
        Self { client, run_id }
    }
}

#[async_trait]
impl ResultReporter for ControlPlaneReporter {
    async fn report_running(&self, test_id: &str) {
        self.client.report_running(&self.run_id, test_id).await;
    }

    async fn report_done(&self, result: &TestResult) {
        self.client.report_test(&self.run_id, result).await;
    }
}
