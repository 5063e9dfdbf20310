//! Suite/use-case/test-case discovery (spec.md §6.1-6.3): walks
//! `<suite>/suites/<uc>/<tc>/test.yaml` into `TestDescriptor`s and loads
//! routine files at both scopes.
//!
//! Generalises the teacher's `loader/mod.rs` (a single JSON-plan read)
//! into a directory walk over many YAML files; no `walkdir` dependency
//! is needed since the hierarchy is a fixed two-level tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::protocol::{Routine, TestDescriptor, TestFile};
use crate::routines::RoutineSet;

const TEST_FILE: &str = "test.yaml";
const ROUTINES_FILE: &str = "routines.yaml";

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RoutinesFile {
    routines: HashMap<String, Routine>,
}

// Routine/RoutinesFile need Deserialize; bring serde's derive into scope
// without re-deriving on the already-`Serialize + Deserialize` `Routine`.
use serde::Deserialize;

/// Walks `<suite_root>/suites/*/*/test.yaml` and builds one
/// `TestDescriptor` per test case, in discovery order (use case then
/// test case, both alphabetical for determinism).
pub fn discover_tests(suite_root: &Path) -> Result<Vec<TestDescriptor>> {
    let suites_dir = suite_root.join("suites");
    let mut use_cases: Vec<PathBuf> = std::fs::read_dir(&suites_dir)
        .with_context(|| format!("reading suites directory {}", suites_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    use_cases.sort();

    let mut descriptors = Vec::new();
    for uc_dir in use_cases {
        let use_case = file_name(&uc_dir);
        let mut test_cases: Vec<PathBuf> = std::fs::read_dir(&uc_dir)
            .with_context(|| format!("reading use case directory {}", uc_dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        test_cases.sort();

        for tc_dir in test_cases {
            let yaml_path = tc_dir.join(TEST_FILE);
            if !yaml_path.exists() {
                continue;
            }
            let test_case = file_name(&tc_dir);
            let test_file = load_test_file(&yaml_path)?;
            let timeout = Duration::from_secs(test_file.timeout.unwrap_or(300));
            descriptors.push(TestDescriptor::new(
                use_case.clone(),
                test_case,
                test_file.name,
                test_file.tags,
                timeout,
                yaml_path,
                suite_root.to_path_buf(),
            ));
        }
    }
    Ok(descriptors)
}

pub fn load_test_file(path: &Path) -> Result<TestFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading test file {}", path.display()))?;
    let parsed: TestFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing test file {}", path.display()))?;
    Ok(parsed)
}

/// Loads global routines (`<suite_root>/routines.yaml`) and every use
/// case's scoped routines (`<suite_root>/suites/<uc>/routines.yaml`).
pub fn load_routines(suite_root: &Path) -> Result<RoutineSet> {
    let mut set = RoutineSet::new();

    let global_path = suite_root.join(ROUTINES_FILE);
    if global_path.exists() {
        let routines = load_routines_file(&global_path)?;
        for (name, routine) in routines {
            set.insert_global(name, routine);
        }
    }

    let suites_dir = suite_root.join("suites");
    if suites_dir.exists() {
        for entry in std::fs::read_dir(&suites_dir)? {
            let entry = entry?;
            let uc_dir = entry.path();
            if !uc_dir.is_dir() {
                continue;
            }
            let use_case = file_name(&uc_dir);
            let uc_routines_path = uc_dir.join(ROUTINES_FILE);
            if uc_routines_path.exists() {
                let routines = load_routines_file(&uc_routines_path)?;
                for (name, routine) in routines {
                    set.insert_use_case(use_case.clone(), name, routine);
                }
            }
        }
    }

    Ok(set)
}

fn load_routines_file(path: &Path) -> Result<HashMap<String, Routine>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading routines file {}", path.display()))?;
    let parsed: RoutinesFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing routines file {}", path.display()))?;
    Ok(parsed.routines)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn discovers_tests_in_alphabetical_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(
            &root.join("suites/auth/login/test.yaml"),
            "name: Login\ntest:\n  - name: s1\n    handler: shell\n    command: echo ok\n",
        );
        write(
            &root.join("suites/auth/logout/test.yaml"),
            "name: Logout\ntest: []\n",
        );

        let descriptors = discover_tests(root).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].test_id, "auth/login");
        assert_eq!(descriptors[1].test_id, "auth/logout");
    }

    #[test]
    fn loads_global_and_scoped_routines() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(
            &root.join("routines.yaml"),
            "routines:\n  setup:\n    steps:\n      - name: s\n        handler: shell\n        command: echo hi\n",
        );
        write(
            &root.join("suites/auth/routines.yaml"),
            "routines:\n  login_helper:\n    steps:\n      - name: s\n        handler: shell\n        command: echo hi\n",
        );

        let set = load_routines(root).unwrap();
        assert!(crate::routines::flatten_phase(
            &[crate::protocol::Step {
                name: "call".to_string(),
                handler: None,
                routine: Some("global.setup".to_string()),
                timeout: None,
                ignore_errors: false,
                capture: None,
                workdir: None,
                env: Default::default(),
                params: Default::default(),
                params_binding: None,
            }],
            &set,
            "auth"
        )
        .is_ok());
    }
}
