//! Executes step commands through generated shell scripts. Every command
//! is written out as a small `/bin/sh` script that exports the assembled
//! environment, changes into the work directory and `exec`s the command;
//! the scripts are kept under a per-process temp directory so failed runs
//! can be replayed by hand.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{self, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::errors::{Error, Result};

pub fn shell_quote(s: &str) -> String {
    shlex::try_quote(s).map(|quoted| quoted.into_owned()).unwrap_or_else(|_| s.to_string())
}

pub struct Runner {
    script_dir: PathBuf,
    run_number: AtomicUsize,
}

impl Default for Runner {
    fn default() -> Runner {
        Runner::new()
    }
}

impl Runner {
    pub fn new() -> Runner {
        let script_dir = std::env::temp_dir().join(format!("partforge-{}", process::id()));
        Runner { script_dir, run_number: AtomicUsize::new(0) }
    }

    /// Run `cmd` under the assembled environment, waiting for completion.
    pub fn run(
        &self,
        cmd: &[String],
        env: &[String],
        extra_env: &BTreeMap<String, String>,
        cwd: &Path,
    ) -> Result<()> {
        let script = self.write_script(cmd, env, extra_env, cwd)?;
        debug!("executing assembled script {:?}", script);

        let status = Command::new("/bin/sh").arg(&script).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::StepCommand {
                command: cmd.join(" "),
                exit_code: status.code().unwrap_or(-1),
            })
        }
    }

    /// Like `run`, but capture and return trimmed standard output.
    pub fn run_output(
        &self,
        cmd: &[String],
        env: &[String],
        extra_env: &BTreeMap<String, String>,
        cwd: &Path,
    ) -> Result<String> {
        let script = self.write_script(cmd, env, extra_env, cwd)?;
        debug!("executing assembled script {:?}", script);

        let output = Command::new("/bin/sh").arg(&script).stderr(Stdio::inherit()).output()?;
        if !output.status.success() {
            return Err(Error::StepCommand {
                command: cmd.join(" "),
                exit_code: output.status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub(crate) fn write_script(
        &self,
        cmd: &[String],
        env: &[String],
        extra_env: &BTreeMap<String, String>,
        cwd: &Path,
    ) -> Result<PathBuf> {
        let mut lines = vec!["#!/bin/sh".to_string()];

        if !extra_env.is_empty() {
            lines.push("# Exported via the `env` parameter:".to_string());
            for (key, value) in extra_env {
                lines.push(format!("export {}={}", key, shell_quote(value)));
            }
        }

        if !env.is_empty() {
            lines.push("# Exported via the assembled environment:".to_string());
            for entry in env {
                lines.push(format!("export {}", entry));
            }
        }

        lines.push(format!("cd {}", shell_quote(&cwd.display().to_string())));

        let quoted: Vec<String> = cmd.iter().map(|c| shell_quote(c)).collect();
        lines.push(format!("exec {}", quoted.join(" ")));

        fs::create_dir_all(&self.script_dir)?;
        let number = self.run_number.fetch_add(1, Ordering::SeqCst);
        let script = self.script_dir.join(format!("run-{}.sh", number));
        fs::write(&script, lines.join("\n") + "\n")?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;
        Ok(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_commands_return_ok() {
        let runner = Runner::new();
        let cwd = tempfile::tempdir().unwrap();
        runner
            .run(&["true".to_string()], &[], &BTreeMap::new(), cwd.path())
            .unwrap();
    }

    #[test]
    fn failing_commands_report_the_exit_code() {
        let runner = Runner::new();
        let cwd = tempfile::tempdir().unwrap();
        let result = runner.run(
            &["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            &[],
            &BTreeMap::new(),
            cwd.path(),
        );
        match result {
            Err(Error::StepCommand { exit_code, .. }) => assert_eq!(exit_code, 3),
            other => panic!("expected StepCommand, got {:?}", other),
        }
    }

    #[test]
    fn environment_reaches_the_command() {
        let runner = Runner::new();
        let cwd = tempfile::tempdir().unwrap();
        let marker = cwd.path().join("marker");
        let mut extra = BTreeMap::new();
        extra.insert("MARKER_PATH".to_string(), marker.display().to_string());

        runner
            .run(
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    "echo \"$GREETING\" > \"$MARKER_PATH\"".to_string(),
                ],
                &["GREETING=\"hello\"".to_string()],
                &extra,
                cwd.path(),
            )
            .unwrap();
        assert_eq!(fs::read_to_string(&marker).unwrap().trim(), "hello");
    }

    #[test]
    fn commands_run_in_the_requested_directory() {
        let runner = Runner::new();
        let cwd = tempfile::tempdir().unwrap();
        runner
            .run(
                &["sh".to_string(), "-c".to_string(), "pwd > where".to_string()],
                &[],
                &BTreeMap::new(),
                cwd.path(),
            )
            .unwrap();
        let reported = fs::read_to_string(cwd.path().join("where")).unwrap();
        let canonical = cwd.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(reported.trim()).canonicalize().unwrap(), canonical);
    }
}
