//! Process-wide state shared by every part, kept at
//! `<parts_dir>/.global_state`: which build prerequisites have been
//! installed over the lifetime of the work directory, and the grade the
//! eventual payload must carry.

use std::fmt;
use std::fs;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::states::{write_atomic, SCHEMA_VERSION};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grade {
    Stable,
    Devel,
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grade::Stable => f.write_str("stable"),
            Grade::Devel => f.write_str("devel"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    pub schema_version: u32,
    build_packages: Vec<String>,
    build_snaps: Vec<String>,
    required_grade: Option<Grade>,
}

impl GlobalState {
    pub fn new() -> GlobalState {
        GlobalState { schema_version: SCHEMA_VERSION, ..Default::default() }
    }

    /// Load the state, or start fresh if the file does not exist yet.
    pub fn load(path: &Path) -> Result<GlobalState> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(GlobalState::new());
            }
            Err(e) => return Err(e.into()),
        };
        let state: GlobalState = serde_json::from_slice(&data)
            .map_err(|_| Error::CorruptGlobalState { path: path.to_path_buf() })?;
        if state.schema_version != SCHEMA_VERSION {
            return Err(Error::CorruptGlobalState { path: path.to_path_buf() });
        }
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let value = serde_json::to_value(self)?;
        write_atomic(path, &serde_json::to_vec_pretty(&value)?)
    }

    /// Record newly installed packages. Additive: duplicates are dropped
    /// and insertion order is preserved across runs.
    pub fn append_build_packages<I: IntoIterator<Item = String>>(&mut self, packages: I) {
        for package in packages {
            if !self.build_packages.contains(&package) {
                self.build_packages.push(package);
            }
        }
    }

    pub fn append_build_snaps<I: IntoIterator<Item = String>>(&mut self, snaps: I) {
        for snap in snaps {
            if !self.build_snaps.contains(&snap) {
                self.build_snaps.push(snap);
            }
        }
    }

    pub fn build_packages(&self) -> &[String] {
        &self.build_packages
    }

    pub fn build_snaps(&self) -> &[String] {
        &self.build_snaps
    }

    pub fn required_grade(&self) -> Option<Grade> {
        self.required_grade
    }

    /// The grade is decided once, on the first run; callers must check
    /// `required_grade()` for absence before setting.
    pub fn set_required_grade(&mut self, grade: Grade) {
        if self.required_grade.is_none() {
            self.required_grade = Some(grade);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = GlobalState::load(&dir.path().join(".global_state")).unwrap();
        assert!(state.build_packages().is_empty());
        assert!(state.required_grade().is_none());
    }

    #[test]
    fn append_deduplicates_and_preserves_order() {
        let mut state = GlobalState::new();
        state.append_build_packages(vec!["gcc".to_string(), "make".to_string()]);
        state.append_build_packages(vec!["make".to_string(), "bison".to_string()]);
        assert_eq!(state.build_packages(), &["gcc", "make", "bison"]);
    }

    #[test]
    fn grade_is_set_once() {
        let mut state = GlobalState::new();
        state.set_required_grade(Grade::Devel);
        state.set_required_grade(Grade::Stable);
        assert_eq!(state.required_grade(), Some(Grade::Devel));
    }

    #[test]
    fn state_survives_a_save_load_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".global_state");
        let mut state = GlobalState::new();
        state.append_build_packages(vec!["gcc".to_string()]);
        state.set_required_grade(Grade::Devel);
        state.save(&path).unwrap();

        let loaded = GlobalState::load(&path).unwrap();
        assert_eq!(loaded, state);
    }
}
