//! Cancel Checker (spec.md §4.9): polls the control plane for
//! `cancel_requested` and flips the shared root `CancellationToken`
//! exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::control_plane::ControlPlaneClient;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Spawns the poller as a background task and returns immediately; the
/// task exits on its own once the root token is cancelled, whether by
/// itself or by anything else (spec.md §4.9: "exits promptly when the
/// root context is already done").
pub fn spawn(client: Arc<ControlPlaneClient>, run_id: String, root_cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(client, run_id, root_cancel))
}

async fn run(client: Arc<ControlPlaneClient>, run_id: String, root_cancel: CancellationToken) {
    let invoked = AtomicBool::new(false);
    loop {
        tokio::select! {
            _ = root_cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        if root_cancel.is_cancelled() {
            return;
        }

        let Some(body) = client.fetch_run(&run_id).await else {
            continue;
        };
        let requested = body.get("cancel_requested").and_then(|v| v.as_bool()).unwrap_or(false);
        if requested && !invoked.swap(true, Ordering::SeqCst) {
            info!(run_id, "cancellation requested by control plane");
            root_cancel.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn exits_promptly_when_root_already_cancelled() {
        let client = Arc::new(ControlPlaneClient::new("http://127.0.0.1:1"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let handle = spawn(client, "run-1".to_string(), cancel);
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("checker should exit promptly")
            .unwrap();
    }

    #[test]
    fn cancel_requested_flag_parses_from_response_body() {
        let body = json!({"cancel_requested": true});
        assert!(body.get("cancel_requested").and_then(|v| v.as_bool()).unwrap_or(false));
        let body = json!({"status": "running"});
        assert!(!body.get("cancel_requested").and_then(|v| v.as_bool()).unwrap_or(false));
    }
}
