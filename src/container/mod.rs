//! Container Executor (spec.md §4.6): runs one test attempt inside a
//! Docker container by re-invoking this same binary with the runner
//! mounted read-only, then waiting on the container's exit code. Mirrors
//! `imbue-ai-offload`'s `provider::docker::DockerProvider`/`DockerSandbox`
//! for the `bollard` call sequence (`connect_with_local_defaults`,
//! `create_container`/`start_container`, `wait_container`,
//! `remove_container` with `force: true`) and its tar-based
//! `upload`/`download` helpers for archiving; the mount-list construction
//! and localhost rewriting below have no teacher counterpart (the
//! teacher never talks to a container runtime) and are original to this
//! module, grounded directly in spec.md §4.6.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    KillContainerOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::TryStreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SuiteConfig;
use crate::protocol::{TestDescriptor, TestResult};
use crate::scheduler::TestExecutor;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("image `{0}` not found locally")]
    ImageMissing(String),
    #[error("failed to create container: {0}")]
    Create(String),
    #[error("failed to start container: {0}")]
    Start(String),
    #[error("failed waiting on container: {0}")]
    Wait(String),
    #[error("mount source missing: {0}")]
    Mount(String),
    /// Cancelled before `start_container` was ever reached — no
    /// container, and nothing, ran.
    #[error("cancelled before start")]
    CancelledBeforeStart,
    /// Cancelled after the container was started and killed mid-run.
    #[error("cancelled while running")]
    CancelledRunning,
}

pub struct ContainerConfig {
    pub runner_binary: PathBuf,
    pub base_image: String,
    pub control_plane_url: String,
    pub run_id: String,
    pub log_dir: PathBuf,
    pub pool_timeout: Duration,
    pub suite_config: SuiteConfig,
}

pub struct ContainerExecutor {
    docker: Docker,
    config: ContainerConfig,
}

impl ContainerExecutor {
    pub fn new(config: ContainerConfig) -> Result<Self, ContainerError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| ContainerError::Create(e.to_string()))?;
        Ok(Self { docker, config })
    }

    async fn ensure_image_present(&self) -> Result<(), ContainerError> {
        self.docker
            .inspect_image(&self.config.base_image)
            .await
            .map_err(|_| ContainerError::ImageMissing(self.config.base_image.clone()))?;
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        binds: &[String],
        env: &[String],
    ) -> Result<String, ContainerError> {
        let host_config = HostConfig {
            binds: Some(binds.to_vec()),
            ..Default::default()
        };
        let options = bollard::container::CreateContainerOptions { name, platform: None };
        let container_config = bollard::container::Config {
            image: Some(self.config.base_image.clone()),
            env: Some(env.to_vec()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| ContainerError::Create(e.to_string()))?;
        Ok(response.id)
    }

    async fn wait_for_exit(
        &self,
        container_id: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<i32, ContainerError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait_stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>)
            .try_collect::<Vec<_>>();

        tokio::select! {
            res = wait_stream => res
                .map(|results| results.last().map(|r| r.status_code as i32).unwrap_or(0))
                .map_err(|e| ContainerError::Wait(e.to_string())),
            _ = tokio::time::sleep(remaining) => {
                warn!(container_id, "container deadline exceeded, killing");
                self.kill(container_id).await;
                Ok(124)
            }
            _ = cancel.cancelled() => {
                self.kill(container_id).await;
                Err(ContainerError::CancelledRunning)
            }
        }
    }

    async fn kill(&self, container_id: &str) {
        let _ = self
            .docker
            .kill_container(container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await;
    }

    /// Runs one test attempt end to end. Container removal happens here
    /// unconditionally once `create_container` has succeeded, regardless
    /// of how `run_in_container` below returns — the one exit path with
    /// no container to clean up is a failure before creation.
    async fn run(
        &self,
        descriptor: &TestDescriptor,
        workspace: &Path,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<i32, ContainerError> {
        if cancel.is_cancelled() {
            return Err(ContainerError::CancelledBeforeStart);
        }
        self.ensure_image_present().await?;
        let binds = build_mounts(descriptor, workspace, &self.config)?;
        let env = build_env(descriptor, &self.config);
        let name = container_name(descriptor);

        if cancel.is_cancelled() {
            return Err(ContainerError::CancelledBeforeStart);
        }
        let container_id = self.create_container(&name, &binds, &env).await?;
        let result = self.run_in_container(&container_id, deadline, cancel).await;
        let _ = self
            .docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        result
    }

    async fn run_in_container(
        &self,
        container_id: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<i32, ContainerError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::Start(e.to_string()))?;
        self.wait_for_exit(container_id, deadline, cancel).await
    }
}

#[async_trait]
impl TestExecutor for ContainerExecutor {
    async fn execute(&self, descriptor: &TestDescriptor, cancel: CancellationToken) -> TestResult {
        let start = Instant::now();
        let pool_deadline = Instant::now() + self.config.pool_timeout;
        let test_deadline = Instant::now() + descriptor.timeout;
        let deadline = test_deadline.min(pool_deadline);
        let workspace = descriptor.suite_root.join(".workspaces").join(&descriptor.test_id);

        info!(test_id = %descriptor.test_id, "launching container");
        let outcome = self.run(descriptor, &workspace, deadline, &cancel).await;

        let (passed, error) = match outcome {
            Ok(exit_code) => classify_exit(exit_code),
            Err(ContainerError::CancelledBeforeStart) => (false, Some("cancelled:not-started".to_string())),
            Err(ContainerError::CancelledRunning) => (false, Some("cancelled:running".to_string())),
            Err(e) => (false, Some(format!("crashed: {e}"))),
        };

        TestResult {
            test_id: descriptor.test_id.clone(),
            name: descriptor.name.clone(),
            passed,
            error,
            duration_ms: start.elapsed().as_millis() as u64,
            steps: Vec::new(),
            assertions: Vec::new(),
        }
    }
}

/// Exit code contract (spec.md §6.7): `0` passed, `1` failed (detail
/// already reported by the in-container runner), `124` timeout, anything
/// else a process crash.
fn classify_exit(exit_code: i32) -> (bool, Option<String>) {
    match exit_code {
        0 => (true, None),
        1 => (false, None),
        124 => (false, Some("timeout".to_string())),
        other => (false, Some(format!("crashed: process exited with status {other}"))),
    }
}

fn container_name(descriptor: &TestDescriptor) -> String {
    format!(
        "tsuite-{}",
        descriptor.test_id.replace(['/', ' '], "-").to_lowercase()
    )
}

/// Builds the bind-mount list in the fixed 7-step order spec.md §4.6
/// requires.
fn build_mounts(
    descriptor: &TestDescriptor,
    workspace: &Path,
    config: &ContainerConfig,
) -> Result<Vec<String>, ContainerError> {
    let mut binds = Vec::new();

    // 1. runner binary, read-only.
    binds.push(format!(
        "{}:/usr/local/bin/tsuite:ro",
        canonical(&config.runner_binary)?.display()
    ));

    // 2. suite root, read-only.
    binds.push(format!("{}:/tests:ro", canonical(&descriptor.suite_root)?.display()));

    // 3. test workspace, read-write.
    std::fs::create_dir_all(workspace).map_err(|e| ContainerError::Mount(e.to_string()))?;
    binds.push(format!("{}:/workspace", canonical(workspace)?.display()));

    // 4. per-item test-case artifacts, symlink-resolved.
    let tc_artifacts = descriptor
        .suite_root
        .join("suites")
        .join(&descriptor.use_case)
        .join(&descriptor.test_case)
        .join("artifacts");
    binds.extend(artifact_binds(&tc_artifacts, "/artifacts"));

    // 5. per-item use-case artifacts, symlink-resolved.
    let uc_artifacts = descriptor.suite_root.join("suites").join(&descriptor.use_case).join("artifacts");
    binds.extend(artifact_binds(&uc_artifacts, "/uc-artifacts"));

    // 6. run-scoped log directories.
    std::fs::create_dir_all(&config.log_dir).map_err(|e| ContainerError::Mount(e.to_string()))?;
    binds.push(format!("{}:/logs/worker", canonical(&config.log_dir)?.display()));
    let agent_log_dir = config.log_dir.join("agent");
    std::fs::create_dir_all(&agent_log_dir).map_err(|e| ContainerError::Mount(e.to_string()))?;
    binds.push(format!("{}:/logs/agent", canonical(&agent_log_dir)?.display()));

    // 7. suite-config-declared mounts, resolved against the suite root.
    for mount in &config.suite_config.mounts {
        let source = canonical(&descriptor.suite_root.join(&mount.source))?;
        let suffix = if mount.read_only { ":ro" } else { "" };
        binds.push(format!("{}:{}{suffix}", source.display(), mount.target));
    }

    Ok(binds)
}

fn canonical(path: &Path) -> Result<PathBuf, ContainerError> {
    std::fs::canonicalize(path).map_err(|e| ContainerError::Mount(format!("{}: {e}", path.display())))
}

/// Mounts each entry of `dir` individually against its resolved target
/// (spec.md §4.6, steps 4-5): symlinks into the host tree work because
/// each entry gets its own bind rather than a single bind of `dir`
/// itself. A broken symlink (or any unresolvable entry) is silently
/// skipped (spec.md §8).
fn artifact_binds(dir: &Path, container_prefix: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let resolved = std::fs::canonicalize(entry.path()).ok()?;
            let name = entry.file_name();
            Some(format!("{}:{container_prefix}/{}", resolved.display(), name.to_string_lossy()))
        })
        .collect()
}

fn build_env(descriptor: &TestDescriptor, config: &ContainerConfig) -> Vec<String> {
    let mut env = vec![
        format!("TSUITE_API={}", rewrite_loopback(&config.control_plane_url)),
        format!("TSUITE_RUN_ID={}", config.run_id),
        format!("TSUITE_TEST_ID={}", descriptor.test_id),
        format!("TSUITE_LOG_DIR={}", config.log_dir.display()),
    ];
    for (key, value) in &config.suite_config.env {
        env.push(format!("{key}={}", resolve_env_refs(value)));
    }
    env
}

/// Rewrites `localhost`/`127.0.0.1` so the control-plane URL resolves
/// from inside the container (spec.md §4.6).
fn rewrite_loopback(url: &str) -> String {
    url.replace("127.0.0.1", "host.docker.internal")
        .replace("localhost", "host.docker.internal")
}

static ENV_REF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{env:([^}]+)\}").unwrap());

fn resolve_env_refs(value: &str) -> String {
    ENV_REF_RE
        .replace_all(value, |caps: &regex::Captures| std::env::var(&caps[1]).unwrap_or_default())
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_exit_codes() {
        assert_eq!(classify_exit(0), (true, None));
        assert_eq!(classify_exit(1), (false, None));
        assert_eq!(classify_exit(124), (false, Some("timeout".to_string())));
        assert_eq!(
            classify_exit(139),
            (false, Some("crashed: process exited with status 139".to_string()))
        );
    }

    #[test]
    fn cancelled_before_start_is_distinct_from_cancelled_running() {
        assert_ne!(
            ContainerError::CancelledBeforeStart.to_string(),
            ContainerError::CancelledRunning.to_string()
        );
    }

    #[test]
    fn rewrite_loopback_variants() {
        assert_eq!(
            rewrite_loopback("http://localhost:8080/api"),
            "http://host.docker.internal:8080/api"
        );
        assert_eq!(
            rewrite_loopback("http://127.0.0.1:8080/api"),
            "http://host.docker.internal:8080/api"
        );
    }

    #[test]
    fn resolve_env_refs_substitutes_host_env() {
        std::env::set_var("TSUITE_CONTAINER_TEST_VAR", "hostval");
        assert_eq!(
            resolve_env_refs("prefix-${env:TSUITE_CONTAINER_TEST_VAR}-suffix"),
            "prefix-hostval-suffix"
        );
    }

    #[test]
    fn artifact_binds_skips_broken_symlink_and_includes_valid_entries() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real_target");
        std::fs::write(&target, b"data").unwrap();

        let artifacts = dir.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&target, artifacts.join("good_link")).unwrap();
            std::os::unix::fs::symlink(dir.path().join("missing"), artifacts.join("broken_link")).unwrap();
        }
        std::fs::write(artifacts.join("plain_file"), b"x").unwrap();

        let binds = artifact_binds(&artifacts, "/artifacts");

        assert!(binds.iter().any(|b| b.ends_with("/artifacts/plain_file")));
        #[cfg(unix)]
        {
            assert!(binds.iter().any(|b| b.ends_with("/artifacts/good_link")));
            assert!(!binds.iter().any(|b| b.contains("broken_link")));
        }
    }

    #[test]
    fn container_name_is_filesystem_and_docker_safe() {
        let d = TestDescriptor::new(
            "auth",
            "login flow",
            "Login",
            vec![],
            Duration::from_secs(1),
            PathBuf::from("/suite/suites/auth/login flow/test.yaml"),
            PathBuf::from("/suite"),
        );
        assert_eq!(container_name(&d), "tsuite-auth-login-flow");
    }
}
