use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

/// What the part contributed to the shared stage directory, and the
/// fileset filters that produced that selection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub schema_version: u32,
    /// Relative paths of staged files, sorted.
    pub files: Vec<PathBuf>,
    /// Relative paths of the directories implied by `files`, sorted.
    pub directories: Vec<PathBuf>,
    /// Raw `stage` fileset entries at the time of staging.
    pub stage_entries: Vec<String>,
}
