//! Console client invocation.

use std::{io, path::PathBuf, process::Stdio, time::Duration};

use opsdeck_core::BackendError;
use thiserror::Error;
use tokio::process::Command;

use crate::shell::resolve_executable_path;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
    #[error("Executable not found: {0}")]
    NotFound(String),
}

impl From<CommandBuildError> for BackendError {
    fn from(err: CommandBuildError) -> Self {
        match err {
            CommandBuildError::NotFound(_) => Self::BackendUnavailable(err.to_string()),
            other => Self::SpawnFailed(other.to_string()),
        }
    }
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }

    /// Render as one shell-quoted line.
    ///
    /// # Errors
    /// Returns error if a part cannot be quoted (embedded NUL).
    pub fn to_shell_line(&self) -> Result<String, CommandBuildError> {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        Ok(shlex::try_join(words)?)
    }
}

/// Builder for console client commands.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base executable command, possibly with leading arguments.
    pub base: String,
    /// Parameters appended to every invocation.
    pub params: Option<Vec<String>>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: None,
        }
    }

    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let extra: Vec<String> = more.into_iter().map(Into::into).collect();
        match &mut self.params {
            Some(p) => p.extend(extra),
            None => self.params = Some(extra),
        }
        self
    }

    /// Build the command with per-call arguments appended.
    ///
    /// # Errors
    /// Returns error if the base cannot be split or the result is empty.
    pub fn build<I>(&self, additional_args: I) -> Result<CommandParts, CommandBuildError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut parts = split_command_line(&self.base)?;
        if let Some(ref params) = self.params {
            parts.extend(params.iter().cloned());
        }
        parts.extend(additional_args.into_iter().map(Into::into));

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        let parts = winsplit::split(input);
        if parts.is_empty() {
            Err(CommandBuildError::EmptyCommand)
        } else {
            Ok(parts)
        }
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
    }
}

/// Captured result of one client run.
#[derive(Debug, Clone)]
pub struct ClientOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ClientOutput {
    /// Stdout on a zero exit, otherwise the failure text.
    ///
    /// # Errors
    /// [`BackendError::CommandFailed`] carrying stderr (or the exit code).
    pub fn into_result(self) -> Result<String, BackendError> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(BackendError::CommandFailed(self.failure_text()))
        }
    }

    /// Human-readable reason for a failed run.
    #[must_use]
    pub fn failure_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        self.code
            .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit status {c}"))
    }
}

/// Run a client to completion, bounded by `timeout`.
///
/// The child is killed if the timeout elapses.
///
/// # Errors
/// - [`BackendError::BackendUnavailable`] if the program does not exist
/// - [`BackendError::SpawnFailed`] for other spawn failures
/// - [`BackendError::CommandTimeout`] if `timeout` elapses
pub async fn run_client(parts: &CommandParts, timeout: Duration) -> Result<ClientOutput, BackendError> {
    let mut cmd = Command::new(&parts.program);
    cmd.args(&parts.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("TERM", "dumb")
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| spawn_error(&parts.program, &e))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let result = ClientOutput {
                success: output.status.success(),
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            tracing::debug!(program = %parts.program, code = ?result.code, "Client exited");
            Ok(result)
        }
        Ok(Err(e)) => Err(BackendError::SpawnFailed(format!("{}: {e}", parts.program))),
        Err(_) => {
            tracing::warn!(program = %parts.program, ?timeout, "Client timed out");
            Err(BackendError::CommandTimeout(timeout))
        }
    }
}

fn spawn_error(program: &str, err: &io::Error) -> BackendError {
    if err.kind() == io::ErrorKind::NotFound {
        BackendError::BackendUnavailable(format!("{program} not found"))
    } else {
        BackendError::SpawnFailed(format!("{program}: {err}"))
    }
}
