//! Project-wide build options and the data handle passed to step
//! callbacks. Parts never hold a reference back to the lifecycle; whatever
//! context a step needs is carried explicitly through these types.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::info;

use crate::arch::{self, MachineInfo};
use crate::errors::{Error, Result};
use crate::steps::Step;

/// Options shared by every part of a lifecycle: directories, target
/// architecture and build parallelism, plus arbitrary caller extras that
/// are surfaced to callbacks.
#[derive(Debug)]
pub struct ProjectOptions {
    work_dir: PathBuf,
    parallel_build_count: usize,
    platform_machine: String,
    target_machine: String,
    machine: &'static MachineInfo,
    extras: BTreeMap<String, String>,
}

impl ProjectOptions {
    /// Build options for the host architecture, rooted at `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Result<ProjectOptions> {
        Self::for_target(work_dir, None)
    }

    /// Build options targeting `target_arch` (a UTS machine name or a
    /// Debian architecture alias).
    pub fn for_target(
        work_dir: impl Into<PathBuf>,
        target_arch: Option<&str>,
    ) -> Result<ProjectOptions> {
        let platform_machine = arch::platform_machine();
        let target_machine = match target_arch {
            Some(target) => {
                let machine = arch::find_machine(target)
                    .ok_or_else(|| Error::InvalidInput(format!("unsupported target architecture {:?}", target)))?;
                info!("setting target machine to {:?}", target);
                machine.to_string()
            }
            None => platform_machine.clone(),
        };
        let machine = arch::machine_info(&target_machine).ok_or_else(|| {
            Error::InvalidInput(format!("unsupported machine {:?}", target_machine))
        })?;

        Ok(ProjectOptions {
            work_dir: work_dir.into(),
            parallel_build_count: num_cpus::get(),
            platform_machine,
            target_machine,
            machine,
            extras: BTreeMap::new(),
        })
    }

    pub fn set_parallel_build_count(&mut self, count: usize) {
        self.parallel_build_count = count.max(1);
    }

    /// Attach a caller-defined key/value surfaced to step callbacks.
    pub fn insert_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extras.insert(key.into(), value.into());
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn parts_dir(&self) -> PathBuf {
        self.work_dir.join("parts")
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.work_dir.join("stage")
    }

    pub fn prime_dir(&self) -> PathBuf {
        self.work_dir.join("prime")
    }

    pub fn global_state_path(&self) -> PathBuf {
        self.parts_dir().join(".global_state")
    }

    pub fn arch_triplet(&self) -> &'static str {
        self.machine.triplet
    }

    pub fn deb_arch(&self) -> &'static str {
        self.machine.deb
    }

    pub fn machine_info(&self) -> &'static MachineInfo {
        self.machine
    }

    pub fn is_cross_compiling(&self) -> bool {
        self.target_machine != self.platform_machine
    }

    pub fn parallel_build_count(&self) -> usize {
        self.parallel_build_count
    }

    pub fn extras(&self) -> &BTreeMap<String, String> {
        &self.extras
    }

    /// Cross-build packages required for the current target, if any.
    pub fn cross_build_packages(&self) -> Vec<String> {
        if self.is_cross_compiling() {
            self.machine.cross_build_packages.iter().map(|p| p.to_string()).collect()
        } else {
            Vec::new()
        }
    }
}

/// Read-only view handed to pre- and post-step callbacks. Callbacks may
/// mutate the process environment but not this data.
#[derive(Debug)]
pub struct PartData<'a> {
    pub arch_triplet: &'a str,
    pub deb_arch: &'a str,
    pub parallel_build_count: usize,
    pub is_cross_compiling: bool,
    pub work_dir: &'a Path,
    pub parts_dir: PathBuf,
    pub stage_dir: PathBuf,
    pub prime_dir: PathBuf,
    pub part: &'a str,
    pub step: Step,
    pub part_build_dir: PathBuf,
    pub part_install_dir: PathBuf,
    pub extras: &'a BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_derive_from_work_dir() {
        let options = ProjectOptions::new("/work").unwrap();
        assert_eq!(options.parts_dir(), PathBuf::from("/work/parts"));
        assert_eq!(options.stage_dir(), PathBuf::from("/work/stage"));
        assert_eq!(options.prime_dir(), PathBuf::from("/work/prime"));
        assert_eq!(options.global_state_path(), PathBuf::from("/work/parts/.global_state"));
    }

    #[test]
    fn host_build_is_not_cross_compiling() {
        let options = ProjectOptions::new("/work").unwrap();
        assert!(!options.is_cross_compiling());
    }

    #[test]
    fn target_alias_selects_the_machine() {
        let options = ProjectOptions::for_target("/work", Some("arm64")).unwrap();
        assert_eq!(options.arch_triplet(), "aarch64-linux-gnu");
        assert_eq!(options.deb_arch(), "arm64");
    }

    #[test]
    fn unknown_target_is_invalid() {
        assert!(matches!(
            ProjectOptions::for_target("/work", Some("vax")),
            Err(Error::InvalidInput(_))
        ));
    }
}
