//! Invocation contract of the external playbook runner.

use std::ffi::OsString;

use camino::Utf8Path;
use thiserror::Error;
use tracing::{error, info};

use crate::command::{CommandError, CommandRunner};
use crate::workspace::AnsibleWorkspace;

/// Errors raised while running a playbook.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PlaybookError {
    /// Raised when the runner cannot be started.
    #[error(transparent)]
    Spawn(#[from] CommandError),
    /// Raised when the runner exits with a non-zero status.
    #[error("playbook {playbook} failed (exit code: {code})")]
    Failed {
        /// Playbook that failed.
        playbook: String,
        /// Exit code of the runner.
        code: i32,
    },
    /// Raised when the runner is killed before reporting a status.
    #[error("playbook {playbook} terminated without an exit status")]
    Terminated {
        /// Playbook that was running.
        playbook: String,
    },
}

/// Runs named playbooks against an inventory.
pub trait PlaybookRunner {
    /// Runs `playbook` against `inventory`.
    ///
    /// # Errors
    ///
    /// Returns [`PlaybookError`] when the runner cannot start or fails.
    fn run_playbook(&self, playbook: &str, inventory: &Utf8Path) -> Result<(), PlaybookError>;
}

/// Runs `ansible-playbook -v -i INVENTORY DIR/PLAYBOOK.yml`.
#[derive(Clone, Debug)]
pub struct AnsiblePlaybookRunner<R> {
    runner: R,
    program: String,
    workspace: AnsibleWorkspace,
}

impl<R: CommandRunner> AnsiblePlaybookRunner<R> {
    /// Creates a runner invoking `program` for playbooks under `workspace`.
    #[must_use]
    pub fn new(runner: R, program: impl Into<String>, workspace: AnsibleWorkspace) -> Self {
        Self {
            runner,
            program: program.into(),
            workspace,
        }
    }

    /// Arguments passed to the runner for `playbook`.
    #[must_use]
    pub fn arguments(&self, playbook: &str, inventory: &Utf8Path) -> Vec<OsString> {
        vec![
            OsString::from("-v"),
            OsString::from("-i"),
            OsString::from(inventory.as_str()),
            OsString::from(self.workspace.playbook_path(playbook).into_string()),
        ]
    }
}

impl<R: CommandRunner> PlaybookRunner for AnsiblePlaybookRunner<R> {
    fn run_playbook(&self, playbook: &str, inventory: &Utf8Path) -> Result<(), PlaybookError> {
        info!(playbook, %inventory, "running playbook");
        let output = self
            .runner
            .run(&self.program, &self.arguments(playbook, inventory))?;
        match output.code {
            Some(0) => Ok(()),
            Some(code) => {
                error!(playbook, code, "playbook failed");
                Err(PlaybookError::Failed {
                    playbook: playbook.to_owned(),
                    code,
                })
            }
            None => Err(PlaybookError::Terminated {
                playbook: playbook.to_owned(),
            }),
        }
    }
}
