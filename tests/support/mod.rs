//! Helpers for dynamically creating work directories and part sources
//! under a temp dir for lifecycle integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use partforge::{LifecycleManager, NullRepository, ProjectOptions, Registry, Step};

/// A scratch project: a work directory for the lifecycle plus a sibling
/// directory for local part sources.
pub struct Project {
    root: tempfile::TempDir,
}

impl Project {
    pub fn new() -> Project {
        let _ = env_logger::builder().is_test(true).try_init();
        Project { root: tempfile::tempdir().expect("failed to create project dir") }
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.path().join("work")
    }

    /// Create a local source directory with the given files and return
    /// its absolute path as a string usable in a `source` property.
    pub fn source_dir(&self, name: &str, files: &[(&str, &str)]) -> String {
        let dir = self.root.path().join("sources").join(name);
        for (relative, content) in files {
            let path = dir.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        fs::create_dir_all(&dir).unwrap();
        dir.display().to_string()
    }

    pub fn manager(&self, document: &serde_json::Value) -> partforge::Result<LifecycleManager> {
        self.manager_with_registry(document, Registry::new())
    }

    pub fn manager_with_registry(
        &self,
        document: &serde_json::Value,
        registry: Registry,
    ) -> partforge::Result<LifecycleManager> {
        let mut options = ProjectOptions::new(self.work_dir())?;
        options.set_parallel_build_count(1);
        LifecycleManager::new(document, registry, Box::new(NullRepository::default()), options)
    }

    pub fn state_file(&self, part: &str, step: Step) -> PathBuf {
        self.work_dir().join("parts").join(part).join("state").join(step.name())
    }

    pub fn state_exists(&self, part: &str, step: Step) -> bool {
        self.state_file(part, step).exists()
    }

    pub fn state_mtime(&self, part: &str, step: Step) -> Option<SystemTime> {
        fs::metadata(self.state_file(part, step)).and_then(|m| m.modified()).ok()
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.work_dir().join("stage")
    }

    pub fn prime_dir(&self) -> PathBuf {
        self.work_dir().join("prime")
    }
}

/// Snapshot of every file under `root` with its mtime, for idempotence
/// checks.
pub fn tree_snapshot(root: &Path) -> Vec<(PathBuf, SystemTime)> {
    let mut snapshot = Vec::new();
    if !root.exists() {
        return snapshot;
    }
    for entry in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            snapshot.push((
                entry.path().to_path_buf(),
                entry.metadata().unwrap().modified().unwrap(),
            ));
        }
    }
    snapshot
}
