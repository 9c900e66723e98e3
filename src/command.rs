//! External command execution behind a trait so tests can script outcomes.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::thread;

use thiserror::Error;

/// Raised when an external command cannot be run at all.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when the process cannot be started or awaited.
    #[error("failed to run {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Human-readable error message.
        message: String,
    },
}

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;
}

/// Runs commands quietly, capturing their output.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| spawn_error(program, &err))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Bytes of each output stream kept by [`StreamingCommandRunner`].
pub const CAPTURE_LIMIT: usize = 64 * 1024;

/// Runs commands while forwarding their output to the console as it is
/// produced. Only the last [`CAPTURE_LIMIT`] bytes of each stream are kept
/// in the returned [`CommandOutput`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamingCommandRunner;

impl CommandRunner for StreamingCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(program, &err))?;

        let stdout = child
            .stdout
            .take()
            .map(|pipe| thread::spawn(move || forward(pipe, io::stdout(), CAPTURE_LIMIT)));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| thread::spawn(move || forward(pipe, io::stderr(), CAPTURE_LIMIT)));

        let status = child.wait().map_err(|err| spawn_error(program, &err))?;
        Ok(CommandOutput {
            code: status.code(),
            stdout: join_capture(stdout),
            stderr: join_capture(stderr),
        })
    }
}

/// Copies `pipe` to `sink`, returning the last `limit` bytes seen.
fn forward(mut pipe: impl Read, mut sink: impl Write, limit: usize) -> String {
    let mut tail = Vec::new();
    let mut buffer = [0_u8; 8192];
    loop {
        match pipe.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => {
                let chunk = buffer.get(..read).unwrap_or(&[]);
                sink.write_all(chunk).and_then(|()| sink.flush()).ok();
                tail.extend_from_slice(chunk);
                let excess = tail.len().saturating_sub(limit);
                tail.drain(..excess);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

fn join_capture(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn spawn_error(program: &str, err: &io::Error) -> CommandError {
    CommandError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}
