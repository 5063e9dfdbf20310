//! Worker Pool / Scheduler (spec.md §4.7): a bounded pool of N workers
//! pulling `TestDescriptor`s off a FIFO queue, with cancellation fan-out
//! and `stop_on_fail` draining.
//!
//! `imbue-ai-offload`'s `orchestrator::Scheduler` only slices tests into
//! static round-robin batches ahead of time; it never actually drives
//! concurrent execution. The batching idea is kept (bounded parallelism
//! over an ordered test list) but reimplemented as a live worker loop —
//! a shared queue plus one spawned task per worker — since dispatch here
//! must react to in-flight failures (`stop_on_fail`) and a cancellation
//! token, which a precomputed batch list cannot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::protocol::{TestDescriptor, TestResult, TestState};

/// Runs one test to completion, in-process or inside a container
/// depending on the suite's mode. Implemented by `runner::TestRunner`
/// (standalone) and `container::ContainerExecutor` (docker mode); the
/// scheduler itself is agnostic to which.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(&self, descriptor: &TestDescriptor, cancel: CancellationToken) -> TestResult;
}

/// Streams live status to the control plane as the pool dispatches
/// (spec.md §1, §5: "running" must reach the control plane before any
/// terminal status for the same test). Implemented by
/// `control_plane::ControlPlaneReporter`; a worker calls
/// `report_running` the moment it pops a test off the queue and
/// `report_done` once that test reaches a terminal state, including
/// tests that are skipped without ever running.
#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn report_running(&self, test_id: &str);
    async fn report_done(&self, result: &TestResult);
}

pub struct PoolConfig {
    pub max_workers: u32,
    pub stop_on_fail: bool,
}

#[derive(Debug, Default)]
pub struct PoolSummary {
    pub total: usize,
    pub passed: u32,
    pub failed: u32,
    pub crashed: u32,
    pub skipped: u32,
    pub results: Vec<TestResult>,
}

impl PoolSummary {
    fn push(&mut self, result: TestResult) {
        match result.state() {
            TestState::Passed => self.passed += 1,
            TestState::Failed => self.failed += 1,
            TestState::Crashed => self.crashed += 1,
            TestState::Skipped => self.skipped += 1,
            TestState::Pending | TestState::Running => {}
        }
        self.results.push(result);
    }
}

struct Shared {
    queue: Mutex<VecDeque<TestDescriptor>>,
    stopped: AtomicBool,
    results: Mutex<Vec<TestResult>>,
}

/// Dispatches `descriptors` in discovery order across `config.max_workers`
/// workers (spec.md §4.7: "Tests are dispatched in discovery order;
/// result emission order is not guaranteed"), running `executor` for
/// each. Returns once the queue has drained and every in-flight test has
/// finished.
pub async fn run_pool(
    descriptors: Vec<TestDescriptor>,
    executor: Arc<dyn TestExecutor>,
    config: PoolConfig,
    root_cancel: CancellationToken,
    reporter: Option<Arc<dyn ResultReporter>>,
) -> PoolSummary {
    let total = descriptors.len();
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::from(descriptors)),
        stopped: AtomicBool::new(false),
        results: Mutex::new(Vec::with_capacity(total)),
    });

    let workers = config.max_workers.max(1);
    info!(workers, total, "starting worker pool");

    let mut set = JoinSet::new();
    for worker_id in 0..workers {
        let shared = shared.clone();
        let executor = executor.clone();
        let root_cancel = root_cancel.clone();
        let stop_on_fail = config.stop_on_fail;
        let reporter = reporter.clone();
        set.spawn(async move {
            worker_loop(worker_id, shared, executor, root_cancel, stop_on_fail, reporter).await;
        });
    }
    while set.join_next().await.is_some() {}

    let results = Arc::try_unwrap(shared)
        .unwrap_or_else(|_| unreachable!("all workers joined"))
        .results
        .into_inner();

    let mut summary = PoolSummary {
        total,
        ..Default::default()
    };
    for result in results {
        summary.push(result);
    }
    summary
}

async fn worker_loop(
    worker_id: u32,
    shared: Arc<Shared>,
    executor: Arc<dyn TestExecutor>,
    root_cancel: CancellationToken,
    stop_on_fail: bool,
    reporter: Option<Arc<dyn ResultReporter>>,
) {
    loop {
        if root_cancel.is_cancelled() || shared.stopped.load(Ordering::SeqCst) {
            drain_as_skipped(&shared, reporter.as_deref()).await;
            return;
        }

        let next = shared.queue.lock().await.pop_front();
        let Some(descriptor) = next else { return };

        info!(worker_id, test_id = %descriptor.test_id, "dispatching test");
        if let Some(reporter) = &reporter {
            reporter.report_running(&descriptor.test_id).await;
        }
        let test_cancel = root_cancel.child_token();
        let result = executor.execute(&descriptor, test_cancel).await;

        if !result.passed && stop_on_fail {
            warn!(test_id = %descriptor.test_id, "stop_on_fail: draining pool");
            shared.stopped.store(true, Ordering::SeqCst);
        }

        if let Some(reporter) = &reporter {
            reporter.report_done(&result).await;
        }
        shared.results.lock().await.push(result);
    }
}

/// Pops every remaining descriptor and records it as skipped, without
/// running it. Called by every worker once the pool is stopped or
/// cancelled so the queue empties deterministically regardless of which
/// worker observes the stop first.
async fn drain_as_skipped(shared: &Shared, reporter: Option<&dyn ResultReporter>) {
    let mut queue = shared.queue.lock().await;
    if queue.is_empty() {
        return;
    }
    let mut results = shared.results.lock().await;
    while let Some(descriptor) = queue.pop_front() {
        let result = TestResult::skipped(descriptor.test_id, descriptor.name);
        if let Some(reporter) = reporter {
            reporter.report_done(&result).await;
        }
        results.push(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct FakeExecutor {
        fail_on: Option<String>,
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TestExecutor for FakeExecutor {
        async fn execute(&self, descriptor: &TestDescriptor, _cancel: CancellationToken) -> TestResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            let passed = self.fail_on.as_deref() != Some(descriptor.test_id.as_str());
            TestResult {
                test_id: descriptor.test_id.clone(),
                name: descriptor.name.clone(),
                passed,
                error: if passed { None } else { Some("boom".to_string()) },
                duration_ms: 0,
                steps: Vec::new(),
                assertions: Vec::new(),
            }
        }
    }

    fn descriptor(use_case: &str, test_case: &str) -> TestDescriptor {
        TestDescriptor::new(
            use_case,
            test_case,
            format!("{use_case}/{test_case}"),
            vec![],
            Duration::from_secs(30),
            std::path::PathBuf::from("/suite/suites"),
            std::path::PathBuf::from("/suite"),
        )
    }

    #[tokio::test]
    async fn every_test_runs_exactly_once() {
        let descriptors = vec![descriptor("uc", "a"), descriptor("uc", "b"), descriptor("uc", "c")];
        let executor = Arc::new(FakeExecutor {
            fail_on: None,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        });
        let summary = run_pool(
            descriptors,
            executor.clone(),
            PoolConfig {
                max_workers: 2,
                stop_on_fail: false,
            },
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 3);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stop_on_fail_skips_remaining_queue() {
        let descriptors = vec![descriptor("uc", "a"), descriptor("uc", "b"), descriptor("uc", "c")];
        let executor = Arc::new(FakeExecutor {
            fail_on: Some("uc/a".to_string()),
            delay: Duration::from_millis(20),
            calls: AtomicU32::new(0),
        });
        let summary = run_pool(
            descriptors,
            executor,
            PoolConfig {
                max_workers: 1,
                stop_on_fail: true,
            },
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.passed + summary.failed + summary.crashed + summary.skipped, 3);
    }

    #[tokio::test]
    async fn pre_cancelled_root_skips_everything() {
        let descriptors = vec![descriptor("uc", "a"), descriptor("uc", "b")];
        let executor = Arc::new(FakeExecutor {
            fail_on: None,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = run_pool(
            descriptors,
            executor.clone(),
            PoolConfig {
                max_workers: 4,
                stop_on_fail: false,
            },
            cancel,
            None,
        )
        .await;

        assert_eq!(summary.skipped, 2);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }
}
