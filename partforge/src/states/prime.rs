use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

/// What the part contributed to the prime directory: its own files, plus
/// the runtime library closure the ELF scanner resolved for them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimeState {
    pub schema_version: u32,
    /// Relative paths of primed files, sorted.
    pub files: Vec<PathBuf>,
    /// Relative paths of the directories implied by `files`, sorted.
    pub directories: Vec<PathBuf>,
    /// Resolved library paths the primed binaries depend on.
    pub dependency_paths: Vec<PathBuf>,
    /// Raw `prime` fileset entries at the time of priming.
    pub prime_entries: Vec<String>,
    pub scriptlet_digests: BTreeMap<String, String>,
}
