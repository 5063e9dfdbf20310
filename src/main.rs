//! Entry point for the `tsuite` binary, which runs in one of two modes
//! depending on how it is invoked:
//!
//! - **Host orchestrator** (`tsuite run <suite>`): discovers the suite,
//!   validates it, and drives the Worker Pool/Scheduler end to end —
//!   either dispatching to the in-process [`tsuite::runner::StandaloneExecutor`]
//!   or to [`tsuite::container::ContainerExecutor`], depending on
//!   `config.yaml`'s `suite.mode`.
//! - **In-container runner**: the same binary, bind-mounted read-only
//!   into every docker-mode test's container (spec.md §4.6 mount step
//!   1) and invoked there with no arguments. It's detected by the
//!   presence of `TSUITE_TEST_ID` (spec.md §6.6) and runs exactly one
//!   test, then exits with the code spec.md §6.7 defines — this is what
//!   `ContainerExecutor::wait_for_exit` observes.
//!
//! CLI surface is intentionally thin; argument parsing itself isn't the
//! concern here (docker-mode invocation is driven by environment
//! variables, not flags). What flags exist follow the teacher's
//! `main.rs` clap-derive style.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use uuid::Uuid;

use tsuite::config;
use tsuite::container::{ContainerConfig, ContainerExecutor};
use tsuite::control_plane::{ControlPlaneClient, ControlPlaneReporter};
use tsuite::discovery;
use tsuite::handlers::HandlerRegistry;
use tsuite::protocol::{RunState, TestResult};
use tsuite::runner::{StandaloneExecutor, TestRunner};
use tsuite::scheduler::{self, PoolConfig, ResultReporter, TestExecutor};
use tsuite::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use tsuite::validation;

#[derive(Parser)]
#[command(name = "tsuite")]
#[command(about = "Declarative integration-test orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discovers and runs every test under a suite root.
    Run {
        /// Suite root, the directory holding `config.yaml` and `suites/`.
        #[arg(short, long)]
        suite: PathBuf,

        /// Control-plane base URL. Falls back to `TSUITE_API` if unset;
        /// the run proceeds without remote reporting if neither is set.
        #[arg(long)]
        control_plane: Option<String>,

        #[arg(long, default_value = "false")]
        otel: bool,

        #[arg(long)]
        otel_endpoint: Option<String>,

        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,

        /// Path to write the JSON run summary; printed to stdout if unset.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Docker-mode containers invoke this same binary with no
    // subcommand; TSUITE_TEST_ID is how it tells the two modes apart.
    if std::env::var("TSUITE_TEST_ID").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        return run_in_container().await;
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            suite,
            control_plane,
            otel,
            otel_endpoint,
            silent,
            verbose,
            output,
        } => {
            let mut telemetry_config = TelemetryConfig::from_env();
            telemetry_config.log_level = if silent {
                Level::ERROR
            } else if verbose {
                Level::DEBUG
            } else {
                Level::INFO
            };
            if otel {
                if let Some(endpoint) = otel_endpoint {
                    telemetry_config.otlp_endpoint = Some(endpoint);
                } else if telemetry_config.otlp_endpoint.is_none() {
                    telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
                }
            }
            if let Err(e) = init_telemetry(telemetry_config) {
                if !silent {
                    eprintln!("Warning: failed to initialize telemetry: {e}");
                }
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                    .try_init();
            }

            let code = run_suite(&suite, control_plane, output, silent).await;
            shutdown_telemetry();
            code
        }
    }
}

/// Runs exactly one test inside its container, reading the corpus off
/// the `/tests` mount and reporting straight to `TSUITE_API` (spec.md
/// §6.6). Exit code per spec.md §6.7.
async fn run_in_container() -> ExitCode {
    let suite_root = PathBuf::from("/tests");
    let test_id = std::env::var("TSUITE_TEST_ID").unwrap_or_default();
    let run_id = std::env::var("TSUITE_RUN_ID").ok();
    let api = std::env::var("TSUITE_API").ok();

    let Some((use_case, test_case)) = test_id.split_once('/') else {
        error!(test_id, "TSUITE_TEST_ID must be `<use_case>/<test_case>`");
        return ExitCode::from(125);
    };

    let yaml_path = suite_root.join("suites").join(use_case).join(test_case).join("test.yaml");
    let test_file = match discovery::load_test_file(&yaml_path) {
        Ok(tf) => tf,
        Err(e) => {
            error!(test_id, error = %e, "failed to load test file");
            return ExitCode::from(125);
        }
    };
    let routines = match discovery::load_routines(&suite_root) {
        Ok(r) => r,
        Err(e) => {
            error!(test_id, error = %e, "failed to load routines");
            return ExitCode::from(125);
        }
    };
    let config = match config::load(&suite_root.join("config.yaml")) {
        Ok(c) => c,
        Err(e) => {
            error!(test_id, error = %e, "failed to load config.yaml");
            return ExitCode::from(125);
        }
    };

    let timeout = std::time::Duration::from_secs(test_file.timeout.unwrap_or(300));
    let descriptor = tsuite::protocol::TestDescriptor::new(
        use_case,
        test_case,
        test_file.name.clone(),
        test_file.tags.clone(),
        timeout,
        yaml_path,
        suite_root,
    );

    let handlers = HandlerRegistry::with_builtins();
    let runner = TestRunner::new(&handlers);
    let cancel = CancellationToken::new();
    let result = runner
        .run_test(
            &descriptor,
            &test_file,
            &routines,
            config.to_json(),
            PathBuf::from("/workspace"),
            &cancel,
        )
        .await;

    if let (Some(api), Some(run_id)) = (api, run_id) {
        let client = ControlPlaneClient::new(api);
        client.report_test(&run_id, &result).await;
    }

    exit_code_for(&result)
}

fn exit_code_for(result: &TestResult) -> ExitCode {
    if result.passed {
        return ExitCode::from(0);
    }
    match result.error.as_deref() {
        Some("timeout") => ExitCode::from(124),
        Some(e) if e.starts_with("crashed:") => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

/// Host-side orchestration: discover, validate, schedule, report.
async fn run_suite(
    suite_root: &std::path::Path,
    control_plane_url: Option<String>,
    output: Option<PathBuf>,
    silent: bool,
) -> ExitCode {
    let config_path = suite_root.join("config.yaml");
    let config = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "failed to load config.yaml");
            return ExitCode::FAILURE;
        }
    };
    if let Err(errors) = validation::validate_config(&config) {
        for e in &errors {
            error!(%e, "config.yaml validation error");
        }
        return ExitCode::FAILURE;
    }

    let descriptors = match discovery::discover_tests(suite_root) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "test discovery failed");
            return ExitCode::FAILURE;
        }
    };
    let routines = match discovery::load_routines(suite_root) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "routine loading failed");
            return ExitCode::FAILURE;
        }
    };

    let mut had_validation_errors = false;
    for descriptor in &descriptors {
        let test_file = match discovery::load_test_file(&descriptor.yaml_path) {
            Ok(tf) => tf,
            Err(e) => {
                error!(test_id = %descriptor.test_id, error = %e, "failed to parse test.yaml");
                had_validation_errors = true;
                continue;
            }
        };
        if let Err(errors) = validation::validate_test_file(&test_file, &routines, &descriptor.use_case) {
            for e in &errors {
                error!(test_id = %descriptor.test_id, %e, "test.yaml validation error");
            }
            had_validation_errors = true;
        }
    }
    if had_validation_errors {
        return ExitCode::FAILURE;
    }

    info!(count = descriptors.len(), "discovered tests");

    let run_id = Uuid::new_v4().to_string();
    let api = control_plane_url.or_else(|| std::env::var("TSUITE_API").ok());
    let control_plane = api.as_ref().map(|url| Arc::new(ControlPlaneClient::new(url.clone())));

    let test_ids: Vec<String> = descriptors.iter().map(|d| d.test_id.clone()).collect();
    let server_run_id = match &control_plane {
        Some(client) => client.create_run(&config.suite.name, &test_ids).await,
        None => None,
    };
    let run_id = server_run_id.unwrap_or(run_id);

    let root_cancel = CancellationToken::new();
    let cancel_task = control_plane
        .clone()
        .map(|client| tsuite::cancel::spawn(client, run_id.clone(), root_cancel.clone()));

    if let Some(client) = &control_plane {
        client.set_run_state(&run_id, RunState::Running).await;
    }

    let executor: Arc<dyn TestExecutor> = match config.suite.mode {
        config::Mode::Standalone => Arc::new(StandaloneExecutor::new(HandlerRegistry::with_builtins(), routines, config.to_json())),
        config::Mode::Docker => {
            let Some(docker) = &config.docker else {
                error!("docker mode requires `docker.base_image`");
                return ExitCode::FAILURE;
            };
            let container_config = ContainerConfig {
                runner_binary: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("/proc/self/exe")),
                base_image: docker.base_image.clone(),
                control_plane_url: api.clone().unwrap_or_default(),
                run_id: run_id.clone(),
                log_dir: suite_root.join(".logs").join(&run_id),
                pool_timeout: std::time::Duration::from_secs(config.execution.timeout),
                suite_config: config.clone(),
            };
            match ContainerExecutor::new(container_config) {
                Ok(executor) => Arc::new(executor),
                Err(e) => {
                    error!(error = %e, "failed to connect to container runtime");
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    let pool_config = PoolConfig {
        max_workers: config.effective_max_workers(),
        stop_on_fail: config.execution.stop_on_fail,
    };
    let reporter: Option<Arc<dyn ResultReporter>> = control_plane
        .clone()
        .map(|client| Arc::new(ControlPlaneReporter::new(client, run_id.clone())) as Arc<dyn ResultReporter>);
    let summary = scheduler::run_pool(descriptors, executor, pool_config, root_cancel.clone(), reporter).await;

    if let Some(client) = &control_plane {
        if root_cancel.is_cancelled() {
            client.set_run_state(&run_id, RunState::Cancelled).await;
        }
        client.complete_run(&run_id).await;
    }
    if let Some(handle) = cancel_task {
        handle.abort();
    }

    if !silent {
        info!(
            passed = summary.passed,
            failed = summary.failed,
            crashed = summary.crashed,
            skipped = summary.skipped,
            "run complete"
        );
    }

    let report = serde_json::json!({
        "run_id": run_id,
        "total": summary.total,
        "passed": summary.passed,
        "failed": summary.failed,
        "crashed": summary.crashed,
        "skipped": summary.skipped,
        "tests": summary.results,
    });
    let rendered = serde_json::to_string_pretty(&report).unwrap_or_default();
    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, rendered) {
                warn!(error = %e, path = %path.display(), "failed to write output report");
            }
        }
        None => println!("{rendered}"),
    }

    if summary.failed == 0 && summary.crashed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
