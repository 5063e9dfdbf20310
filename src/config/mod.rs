//! Suite configuration schema (spec.md §6.2): `config.yaml`.
//!
//! Struct shape and `#[serde(default = ...)]` style follow
//! `imbue-ai-offload`'s `config/schema.rs`; field set is spec.md's own.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Docker,
    Standalone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteMeta {
    pub name: String,
    pub mode: Mode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Packages {
    #[serde(default)]
    pub cli_version: Option<String>,
    #[serde(default)]
    pub sdk_python_version: Option<String>,
    #[serde(default)]
    pub sdk_typescript_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    pub base_image: String,
}

fn default_max_workers() -> u32 {
    4
}

fn default_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub stop_on_fail: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            timeout: default_timeout(),
            stop_on_fail: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub suite: SuiteMeta,
    #[serde(default)]
    pub packages: Packages,
    #[serde(default)]
    pub docker: Option<DockerConfig>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Additional suite-config-declared container mounts
    /// (spec.md §4.6, mount step 7), resolved against the suite root.
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    /// Free-form `env` overlay applied to every container run.
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl SuiteConfig {
    /// Effective worker count: the standalone mode forces a single
    /// worker regardless of the configured value (spec.md §4.7).
    pub fn effective_max_workers(&self) -> u32 {
        match self.suite.mode {
            Mode::Standalone => 1,
            Mode::Docker => self.execution.max_workers.max(1),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub fn load(path: &std::path::Path) -> anyhow::Result<SuiteConfig> {
    let raw = std::fs::read_to_string(path)?;
    let config: SuiteConfig = serde_yaml::from_str(&raw)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
suite:
  name: checkout
  mode: docker
packages:
  cli_version: "1.0.0"
docker:
  base_image: "tsuite/base:latest"
"#;
        let config: SuiteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.suite.name, "checkout");
        assert_eq!(config.execution.max_workers, 4);
        assert_eq!(config.packages.cli_version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn standalone_forces_single_worker() {
        let yaml = r#"
suite:
  name: smoke
  mode: standalone
execution:
  max_workers: 8
"#;
        let config: SuiteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.effective_max_workers(), 1);
    }
}
