//! Crate-wide error taxonomy. Every failure that can abort a lifecycle run
//! maps to a variant here; `exit_code` is what a front end should exit with.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::steps::Step;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to validate parts definition: {0}")]
    InvalidInput(String),

    #[error("part {part:?} is built after {missing:?}, but no such part is defined")]
    MissingDependency { part: String, missing: String },

    #[error("circular dependency chain found in parts definition")]
    CircularDependency,

    #[error("the part named {0:?} is not defined")]
    UnknownPart(String),

    #[error("failed to load plugin {plugin:?} for part {part:?}: {message}")]
    PluginLoad { plugin: String, part: String, message: String },

    #[error("failed to run {command:?}: exited with code {exit_code}")]
    StepCommand { command: String, exit_code: i32 },

    #[error("the {step} step of {part:?} is out of date: {report}")]
    StepOutdated { step: Step, part: String, report: String },

    #[error(
        "parts {part_a:?} and {part_b:?} have the following file to stage, \
         with different content: {path:?}"
    )]
    Collision { part_a: String, part_b: String, path: PathBuf },

    #[error("failed to decode {step} state from {path:?}")]
    CorruptState { step: Step, path: PathBuf },

    #[error("failed to decode global state from {path:?}")]
    CorruptGlobalState { path: PathBuf },

    #[error("unable to parse ELF file {path:?}: {message}")]
    CorruptedElf { path: PathBuf, message: String },

    #[error("{variable} environment variable must be defined: {hint}")]
    Environment { variable: String, hint: String },

    #[error("failed to run {scriptlet:?}: {feedback}")]
    ScriptletFailed { scriptlet: String, feedback: String },

    #[error("unable to determine source type of {0:?}")]
    SourceUnhandled(String),

    #[error("the {part:?} part has not yet run the {step} step")]
    MissingState { part: String, step: Step },

    #[error("failed to encode state record: {0}")]
    StateEncode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Exit code a front end should use when this error aborts the run.
    /// Zero is reserved for success.
    pub fn exit_code(&self) -> i32 {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_exits_with_2() {
        let errors = vec![
            Error::CircularDependency,
            Error::UnknownPart("foo".to_string()),
            Error::StepCommand { command: "make".to_string(), exit_code: 1 },
        ];
        for error in errors {
            assert_eq!(error.exit_code(), 2);
        }
    }

    #[test]
    fn collision_message_names_both_parts_and_path() {
        let error = Error::Collision {
            part_a: "a".to_string(),
            part_b: "b".to_string(),
            path: PathBuf::from("etc/x"),
        };
        let message = error.to_string();
        assert!(message.contains("\"a\""));
        assert!(message.contains("\"b\""));
        assert!(message.contains("etc/x"));
    }
}
