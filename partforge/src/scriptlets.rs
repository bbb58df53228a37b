//! Override scriptlets and the control channel they use to call back into
//! the engine. A scriptlet replaces a step body; from inside it, the ctl
//! helper can ask the engine to run the default body by writing a JSON
//! request to a named pipe and reading a feedback line back. Empty
//! feedback means success, anything else is fatal. The channel is
//! abstracted so tests can drive the protocol in-process.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};
use crate::runner::Runner;
use crate::steps::Step;

pub const CALL_FIFO_VAR: &str = "PARTFORGE_CALL_FIFO";
pub const FEEDBACK_FIFO_VAR: &str = "PARTFORGE_FEEDBACK_FIFO";

/// A request sent over the control channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CtlRequest {
    pub function: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// Issues control requests from the scriptlet side of the channel.
pub trait CallChannel {
    fn call(&mut self, request: &CtlRequest) -> Result<()>;
}

/// The scriptlet-facing side backed by the two FIFOs named in the
/// environment. This is what a `partforgectl`-style helper binary uses.
#[derive(Debug)]
pub struct FifoChannel {
    call_path: PathBuf,
    feedback_path: PathBuf,
}

impl FifoChannel {
    /// Locate the channel from the environment; outside a step run the
    /// variables are unset and this fails with a hint.
    pub fn from_env() -> Result<FifoChannel> {
        let lookup = |variable: &str| {
            std::env::var(variable).map(PathBuf::from).map_err(|_| Error::Environment {
                variable: variable.to_string(),
                hint: "this utility is only designed for use during part building".to_string(),
            })
        };
        Ok(FifoChannel { call_path: lookup(CALL_FIFO_VAR)?, feedback_path: lookup(FEEDBACK_FIFO_VAR)? })
    }
}

impl CallChannel for FifoChannel {
    fn call(&mut self, request: &CtlRequest) -> Result<()> {
        let mut call = OpenOptions::new().write(true).open(&self.call_path)?;
        call.write_all(serde_json::to_string(request)?.as_bytes())?;
        call.flush()?;
        drop(call);

        let feedback = OpenOptions::new().read(true).open(&self.feedback_path)?;
        let mut line = String::new();
        BufReader::new(feedback).read_line(&mut line)?;

        // Any feedback is a fatal error.
        if line.trim().is_empty() {
            Ok(())
        } else {
            Err(Error::ScriptletFailed {
                scriptlet: request.function.clone(),
                feedback: line.trim().to_string(),
            })
        }
    }
}

/// An in-process channel that dispatches straight to a handler, used by
/// tests to exercise the protocol without named pipes.
pub struct InProcessChannel<'a> {
    handler: &'a mut dyn FnMut(&CtlRequest) -> Result<()>,
}

impl<'a> InProcessChannel<'a> {
    pub fn new(handler: &'a mut dyn FnMut(&CtlRequest) -> Result<()>) -> InProcessChannel<'a> {
        InProcessChannel { handler }
    }
}

impl<'a> CallChannel for InProcessChannel<'a> {
    fn call(&mut self, request: &CtlRequest) -> Result<()> {
        (self.handler)(request)
    }
}

/// The scriptlets a part may declare, keyed by the overridden step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scriptlets {
    scriptlets: BTreeMap<String, String>,
}

impl Scriptlets {
    pub fn from_properties(properties: &serde_json::Map<String, serde_json::Value>) -> Scriptlets {
        let mut scriptlets = BTreeMap::new();
        for step in &crate::steps::STEPS {
            let key = format!("override-{}", step.name());
            if let Some(serde_json::Value::String(text)) = properties.get(&key) {
                scriptlets.insert(key, text.clone());
            }
        }
        Scriptlets { scriptlets }
    }

    pub fn get(&self, step: Step) -> Option<&str> {
        self.scriptlets.get(&format!("override-{}", step.name())).map(String::as_str)
    }

    /// SHA-256 digests of the declared scriptlets; recorded in state and
    /// diffed by the dirty detector.
    pub fn digests(&self) -> BTreeMap<String, String> {
        self.scriptlets
            .iter()
            .map(|(name, text)| {
                let mut hasher = Sha256::new();
                hasher.update(text.as_bytes());
                let digest = hasher.finalize();
                let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
                (name.clone(), hex)
            })
            .collect()
    }

    pub fn digest_for(&self, step: Step) -> Option<String> {
        self.digests().remove(&format!("override-{}", step.name()))
    }
}

/// Run a scriptlet, serving its control requests until it exits. The
/// handler is invoked for each request; handler failure is reported back
/// through the feedback pipe and fails the scriptlet.
pub fn run_scriptlet(
    runner: &Runner,
    scriptlet_name: &str,
    scriptlet: &str,
    env: &[String],
    extra_env: &BTreeMap<String, String>,
    cwd: &Path,
    handler: &mut dyn FnMut(&CtlRequest) -> Result<()>,
) -> Result<()> {
    let channel_dir = std::env::temp_dir()
        .join(format!("partforge-{}", process::id()))
        .join(format!("ctl-{}", scriptlet_name.replace('/', "-")));
    fs::create_dir_all(&channel_dir)?;

    let call_path = channel_dir.join("call");
    let feedback_path = channel_dir.join("feedback");
    for path in &[&call_path, &feedback_path] {
        if path.exists() {
            fs::remove_file(path)?;
        }
        mkfifo(path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| Error::InvalidInput(format!("cannot create fifo {:?}: {}", path, e)))?;
    }

    // Hold both ends read-write so neither open blocks and the call pipe
    // never reports writer-closed while the scriptlet is alive.
    let mut call = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(&call_path)?;
    let mut feedback = OpenOptions::new().read(true).write(true).open(&feedback_path)?;

    let mut scriptlet_env = extra_env.clone();
    scriptlet_env.insert(CALL_FIFO_VAR.to_string(), call_path.display().to_string());
    scriptlet_env.insert(FEEDBACK_FIFO_VAR.to_string(), feedback_path.display().to_string());

    let cmd = vec!["/bin/sh".to_string(), "-e".to_string(), "-c".to_string(), scriptlet.to_string()];
    let script = runner.write_script(&cmd, env, &scriptlet_env, cwd)?;
    debug!("running scriptlet {:?} via {:?}", scriptlet_name, script);
    let mut child = Command::new("/bin/sh").arg(&script).spawn()?;

    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut handler_error: Option<Error> = None;

    let status = loop {
        match call.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        serve_requests(&mut buffer, &mut feedback, handler, &mut handler_error)?;

        if let Some(status) = child.try_wait()? {
            serve_requests(&mut buffer, &mut feedback, handler, &mut handler_error)?;
            break status;
        }
        thread::sleep(Duration::from_millis(50));
    };

    if let Some(error) = handler_error {
        return Err(error);
    }
    if !status.success() {
        return Err(Error::ScriptletFailed {
            scriptlet: scriptlet_name.to_string(),
            feedback: format!("exit code was {}", status.code().unwrap_or(-1)),
        });
    }
    Ok(())
}

fn serve_requests(
    buffer: &mut Vec<u8>,
    feedback: &mut fs::File,
    handler: &mut dyn FnMut(&CtlRequest) -> Result<()>,
    handler_error: &mut Option<Error>,
) -> Result<()> {
    let mut consumed = 0;
    let mut replies: Vec<String> = Vec::new();
    {
        let mut stream =
            serde_json::Deserializer::from_slice(&buffer[..]).into_iter::<CtlRequest>();
        loop {
            match stream.next() {
                Some(Ok(request)) => {
                    consumed = stream.byte_offset();
                    debug!("ctl request: {:?}", request);
                    match handler(&request) {
                        Ok(()) => replies.push(String::new()),
                        Err(error) => {
                            warn!("ctl request {:?} failed: {}", request.function, error);
                            replies.push(error.to_string());
                            if handler_error.is_none() {
                                *handler_error = Some(error);
                            }
                        }
                    }
                }
                Some(Err(ref error)) if error.is_eof() => break,
                Some(Err(error)) => {
                    consumed = buffer.len();
                    replies.push(format!("invalid ctl request: {}", error));
                    break;
                }
                None => break,
            }
        }
    }
    buffer.drain(..consumed);
    for reply in replies {
        feedback.write_all(format!("{}\n", reply).as_bytes())?;
        feedback.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scriptlet_digests_are_stable_and_keyed_by_step() {
        let mut properties = serde_json::Map::new();
        properties.insert(
            "override-build".to_string(),
            serde_json::Value::String("make -j1".to_string()),
        );
        let scriptlets = Scriptlets::from_properties(&properties);

        assert_eq!(scriptlets.get(Step::Build), Some("make -j1"));
        assert_eq!(scriptlets.get(Step::Pull), None);

        let digests = scriptlets.digests();
        assert_eq!(digests.len(), 1);
        assert_eq!(digests, scriptlets.digests());
        assert_eq!(digests["override-build"].len(), 64);
    }

    #[test]
    fn in_process_channel_dispatches_to_the_handler() {
        let mut seen = Vec::new();
        let mut handler = |request: &CtlRequest| {
            seen.push(request.function.clone());
            Ok(())
        };
        let mut channel = InProcessChannel::new(&mut handler);
        channel
            .call(&CtlRequest { function: "build".to_string(), args: Default::default() })
            .unwrap();
        assert_eq!(seen, vec!["build".to_string()]);
    }

    #[test]
    fn missing_fifo_variables_surface_as_environment_errors() {
        std::env::remove_var(CALL_FIFO_VAR);
        std::env::remove_var(FEEDBACK_FIFO_VAR);
        match FifoChannel::from_env() {
            Err(Error::Environment { variable, .. }) => assert_eq!(variable, CALL_FIFO_VAR),
            other => panic!("expected Environment error, got {:?}", other),
        }
    }

    #[test]
    fn scriptlet_calls_reach_the_handler_through_the_fifos() {
        let runner = Runner::new();
        let cwd = tempfile::tempdir().unwrap();
        let mut calls = Vec::new();
        let mut handler = |request: &CtlRequest| {
            calls.push(request.function.clone());
            Ok(())
        };

        // Stand in for the ctl helper: write a request, read the feedback.
        let scriptlet = format!(
            "printf '%s' '{}' > \"${}\"\nread reply < \"${}\"\ntest -z \"$reply\"",
            r#"{"function": "build", "args": {}}"#,
            CALL_FIFO_VAR,
            FEEDBACK_FIFO_VAR,
        );

        run_scriptlet(
            &runner,
            "override-build",
            &scriptlet,
            &[],
            &BTreeMap::new(),
            cwd.path(),
            &mut handler,
        )
        .unwrap();
        assert_eq!(calls, vec!["build".to_string()]);
    }

    #[test]
    fn failing_scriptlets_are_fatal() {
        let runner = Runner::new();
        let cwd = tempfile::tempdir().unwrap();
        let mut handler = |_: &CtlRequest| Ok(());
        let result = run_scriptlet(
            &runner,
            "override-build",
            "exit 1",
            &[],
            &BTreeMap::new(),
            cwd.path(),
            &mut handler,
        );
        assert!(matches!(result, Err(Error::ScriptletFailed { .. })));
    }
}
