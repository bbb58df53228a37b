//! Persisted per-step state. One file per executed step lives under the
//! part's state directory, written atomically; a missing file is the one
//! and only signal that the step has not run. Records capture everything
//! that determined the step's output so the dirty detector can diff them
//! against the current configuration.

pub mod build;
pub mod global;
pub mod prime;
pub mod pull;
pub mod stage;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::errors::{Error, Result};
use crate::steps::{Step, STEPS};

pub use self::build::BuildState;
pub use self::global::{GlobalState, Grade};
pub use self::prime::PrimeState;
pub use self::pull::PullState;
pub use self::stage::StageState;

/// Bumped whenever a record's shape changes; records carrying any other
/// version fail to load as corrupt.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq)]
pub enum PartState {
    Pull(PullState),
    Build(BuildState),
    Stage(StageState),
    Prime(PrimeState),
}

impl PartState {
    pub fn step(&self) -> Step {
        match self {
            PartState::Pull(_) => Step::Pull,
            PartState::Build(_) => Step::Build,
            PartState::Stage(_) => Step::Stage,
            PartState::Prime(_) => Step::Prime,
        }
    }
}

pub fn state_file(state_dir: &Path, step: Step) -> PathBuf {
    state_dir.join(step.name())
}

/// Load the state of `step`, if it has run. A file that exists but cannot
/// be decoded (or carries an unknown schema version) is a hard error; the
/// cache can no longer be trusted and silently re-running steps would hide
/// the problem.
pub fn read(state_dir: &Path, step: Step) -> Result<Option<PartState>> {
    let path = state_file(state_dir, step);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let corrupt = || Error::CorruptState { step, path: path.clone() };

    let (state, version) = match step {
        Step::Pull => {
            let state: PullState = serde_json::from_slice(&data).map_err(|_| corrupt())?;
            let version = state.schema_version;
            (PartState::Pull(state), version)
        }
        Step::Build => {
            let state: BuildState = serde_json::from_slice(&data).map_err(|_| corrupt())?;
            let version = state.schema_version;
            (PartState::Build(state), version)
        }
        Step::Stage => {
            let state: StageState = serde_json::from_slice(&data).map_err(|_| corrupt())?;
            let version = state.schema_version;
            (PartState::Stage(state), version)
        }
        Step::Prime => {
            let state: PrimeState = serde_json::from_slice(&data).map_err(|_| corrupt())?;
            let version = state.schema_version;
            (PartState::Prime(state), version)
        }
    };

    if version != SCHEMA_VERSION {
        return Err(corrupt());
    }

    Ok(Some(state))
}

/// Serialize with sorted keys and replace the state file atomically.
pub fn write(state_dir: &Path, state: &PartState) -> Result<()> {
    fs::create_dir_all(state_dir)?;
    let value = match state {
        PartState::Pull(s) => serde_json::to_value(s)?,
        PartState::Build(s) => serde_json::to_value(s)?,
        PartState::Stage(s) => serde_json::to_value(s)?,
        PartState::Prime(s) => serde_json::to_value(s)?,
    };
    let data = serde_json::to_vec_pretty(&value)?;
    write_atomic(&state_file(state_dir, state.step()), &data)
}

/// Remove the state of `step`; removing state that never existed is fine.
pub fn remove(state_dir: &Path, step: Step) -> Result<()> {
    match fs::remove_file(state_file(state_dir, step)) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// The most advanced step that has state on disk.
pub fn latest_step(state_dir: &Path) -> Option<Step> {
    STEPS.iter().rev().find(|step| state_file(state_dir, **step).exists()).copied()
}

pub fn state_mtime(state_dir: &Path, step: Step) -> Option<SystemTime> {
    fs::metadata(state_file(state_dir, step)).and_then(|m| m.modified()).ok()
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_state_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(dir.path(), Step::Pull).unwrap().is_none());
    }

    #[test]
    fn state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let state = PullState {
            schema_version: SCHEMA_VERSION,
            stage_packages: vec!["libssl-dev".to_string()],
            ..Default::default()
        };
        write(dir.path(), &PartState::Pull(state.clone())).unwrap();
        match read(dir.path(), Step::Pull).unwrap() {
            Some(PartState::Pull(loaded)) => assert_eq!(loaded, state),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn corrupt_state_fails_hard() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(state_file(dir.path(), Step::Build), b"not json").unwrap();
        assert!(matches!(
            read(dir.path(), Step::Build),
            Err(Error::CorruptState { step: Step::Build, .. })
        ));
    }

    #[test]
    fn unknown_schema_version_fails_hard() {
        let dir = tempfile::tempdir().unwrap();
        let state = PullState { schema_version: 99, ..Default::default() };
        write(dir.path(), &PartState::Pull(state)).unwrap();
        assert!(matches!(read(dir.path(), Step::Pull), Err(Error::CorruptState { .. })));
    }

    #[test]
    fn latest_step_is_the_highest_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(latest_step(dir.path()), None);
        let pull = PullState { schema_version: SCHEMA_VERSION, ..Default::default() };
        write(dir.path(), &PartState::Pull(pull)).unwrap();
        assert_eq!(latest_step(dir.path()), Some(Step::Pull));
        let stage = StageState { schema_version: SCHEMA_VERSION, ..Default::default() };
        write(dir.path(), &PartState::Stage(stage)).unwrap();
        assert_eq!(latest_step(dir.path()), Some(Step::Stage));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        remove(dir.path(), Step::Prime).unwrap();
        remove(dir.path(), Step::Prime).unwrap();
    }

    #[test]
    fn written_state_has_sorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let state = BuildState { schema_version: SCHEMA_VERSION, ..Default::default() };
        write(dir.path(), &PartState::Build(state)).unwrap();
        let text = fs::read_to_string(state_file(dir.path(), Step::Build)).unwrap();
        let keys: Vec<&str> = text
            .lines()
            .filter_map(|l| l.trim().strip_prefix('"'))
            .filter_map(|l| l.split('"').next())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }
}
