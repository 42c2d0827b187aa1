//! External command execution
//!
//! Every host-level action the provisioning pipeline takes (formatting,
//! mounting, bootstrapping, chroot configuration) is expressed as a
//! [`CommandLine`] handed to a [`CommandRunner`]. The production
//! implementation is [`SystemRunner`]; tests substitute a fake that records
//! commands and injects failures.

use std::fmt::Display;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

/// Where a command executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecContext {
    /// Directly on the host.
    Host,
    /// With the filesystem root redirected into the given directory.
    Chroot(Utf8PathBuf),
}

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub context: ExecContext,
}

impl CommandLine {
    /// Create a host command from a program and its arguments.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            context: ExecContext::Host,
        }
    }

    /// Run this command inside `root` instead of on the host.
    pub fn in_chroot(mut self, root: &Utf8Path) -> Self {
        self.context = ExecContext::Chroot(root.to_owned());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Translate into a [`Command`], wrapping in `chroot` when required.
    pub fn to_command(&self) -> Option<Command> {
        let (program, args) = self.argv.split_first()?;
        let mut cmd = match &self.context {
            ExecContext::Host => {
                let mut c = Command::new(program);
                c.args(args);
                c
            }
            ExecContext::Chroot(root) => {
                let mut c = Command::new("chroot");
                c.arg(root.as_str()).arg(program).args(args);
                c
            }
        };
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Some(cmd)
    }
}

impl Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined = shlex::try_join(self.argv.iter().map(String::as_str))
            .unwrap_or_else(|_| self.argv.join(" "));
        match &self.context {
            ExecContext::Host => write!(f, "{joined}"),
            ExecContext::Chroot(root) => write!(f, "chroot {root} {joined}"),
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; signals are reported as 128 + signal number.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[cfg(test)]
    pub fn success() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Convert a non-zero exit into a [`CommandError`].
    pub fn check(self, cmd: &CommandLine) -> std::result::Result<Self, CommandError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(CommandError::Failed {
            command: cmd.to_string(),
            code: self.code,
            stderr: self.stderr.trim().to_owned(),
        })
    }
}

/// Failure to run an external command to a successful exit.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with status {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },
}

impl CommandError {
    /// Exit code to propagate to the calling process.
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                127
            }
            CommandError::Spawn { .. } => 1,
            CommandError::Failed { code, .. } => *code,
        }
    }

    pub fn command(&self) -> &str {
        match self {
            CommandError::Spawn { command, .. } | CommandError::Failed { command, .. } => command,
        }
    }
}

/// The single capability through which the pipeline touches the host.
pub trait CommandRunner {
    /// Execute `cmd` to completion. An `Err` means the command could not be
    /// started at all; a non-zero exit is reported in [`CommandOutput::code`].
    fn execute(&self, cmd: &CommandLine) -> std::result::Result<CommandOutput, CommandError>;

    /// Execute and require a zero exit status.
    fn run(&self, cmd: &CommandLine) -> std::result::Result<CommandOutput, CommandError> {
        self.execute(cmd)?.check(cmd)
    }
}

/// Runs commands on the real host with captured output.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn execute(&self, cmd: &CommandLine) -> std::result::Result<CommandOutput, CommandError> {
        let rendered = cmd.to_string();
        let Some(mut c) = cmd.to_command() else {
            return Err(CommandError::Spawn {
                command: rendered,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            });
        };
        debug!("exec: {rendered}");
        let output = c.output().map_err(|source| CommandError::Spawn {
            command: rendered.clone(),
            source,
        })?;
        let code = exit_code(&output.status);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !stdout.trim().is_empty() {
            debug!("{rendered}: stdout: {}", stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            debug!("{rendered}: stderr: {}", stderr.trim_end());
        }
        Ok(CommandOutput {
            code,
            stdout,
            stderr,
        })
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

/// Look up an executable by name in `PATH`.
pub fn find_in_path(name: &str) -> Option<Utf8PathBuf> {
    let path = which::which(name).ok()?;
    Utf8PathBuf::from_path_buf(path).ok()
}
