//! Executable resolution and detached terminal launching.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use command_group::AsyncCommandGroup;
use opsdeck_core::BackendError;
use tokio::process::Command;

use crate::command::CommandParts;

/// Graphical terminals in preference order, with their "execute" flag.
const GRAPHICAL_TERMINALS: [(&str, &str); 4] = [
    ("gnome-terminal", "--"),
    ("konsole", "-e"),
    ("xterm", "-e"),
    ("terminator", "-e"),
];

/// Resolve an executable by name.
///
/// Absolute paths are accepted as-is when they exist; anything else is looked
/// up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    which_async(executable).await
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// The user's shell from `$SHELL`, or `/bin/sh`.
#[must_use]
pub fn current_shell() -> PathBuf {
    std::env::var_os("SHELL")
        .map(PathBuf::from)
        .filter(|path| path.is_absolute() && path.is_file())
        .unwrap_or_else(|| PathBuf::from("/bin/sh"))
}

/// Where an interactive client is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalLauncher {
    /// A graphical terminal window.
    Graphical { program: PathBuf, exec_flag: &'static str },
    /// A new window in the running tmux server.
    Tmux(PathBuf),
    /// A detached screen session.
    Screen(PathBuf),
    /// A detached shell with no terminal attached.
    Detached(PathBuf),
}

impl TerminalLauncher {
    /// Detect the best launcher for this environment.
    pub async fn detect() -> Self {
        let display = std::env::var("DISPLAY").ok();
        let shell = current_shell();
        tokio::task::spawn_blocking(move || {
            Self::detect_with(display.as_deref(), shell, |name| which::which(name).ok())
        })
        .await
        .unwrap_or_else(|_| Self::Detached(PathBuf::from("/bin/sh")))
    }

    /// Detection against an explicit `DISPLAY` value and executable lookup.
    pub fn detect_with<F>(display: Option<&str>, shell: PathBuf, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<PathBuf>,
    {
        if display.is_some_and(|d| !d.trim().is_empty()) {
            for (name, exec_flag) in GRAPHICAL_TERMINALS {
                if let Some(program) = lookup(name) {
                    return Self::Graphical { program, exec_flag };
                }
            }
        }
        if let Some(program) = lookup("tmux") {
            return Self::Tmux(program);
        }
        if let Some(program) = lookup("screen") {
            return Self::Screen(program);
        }
        Self::Detached(shell)
    }

    /// Command that runs `line` through this launcher.
    ///
    /// `title` names the tmux window or screen session.
    #[must_use]
    pub fn command_for(&self, title: &str, line: &str) -> CommandParts {
        let shell = current_shell().to_string_lossy().into_owned();
        match self {
            Self::Graphical { program, exec_flag } => {
                let args = if program.file_name() == Some(OsStr::new("terminator")) {
                    vec![(*exec_flag).to_string(), line.to_string()]
                } else {
                    vec![(*exec_flag).to_string(), shell, "-c".into(), line.to_string()]
                };
                CommandParts::new(program.to_string_lossy().into_owned(), args)
            }
            Self::Tmux(program) => CommandParts::new(
                program.to_string_lossy().into_owned(),
                vec!["new-window".into(), "-n".into(), title.to_string(), line.to_string()],
            ),
            Self::Screen(program) => CommandParts::new(
                program.to_string_lossy().into_owned(),
                vec!["-dmS".into(), title.to_string(), shell, "-c".into(), line.to_string()],
            ),
            Self::Detached(shell) => CommandParts::new(
                shell.to_string_lossy().into_owned(),
                vec!["-c".into(), line.to_string()],
            ),
        }
    }
}

/// Spawn `parts` in its own process group without waiting for it.
///
/// With a zero `grace` this returns as soon as the process is spawned.
/// Otherwise the caller waits up to `grace` so an immediate failure can be
/// reported. Either way the process is reaped in the background and may
/// outlive the caller.
///
/// # Errors
/// [`BackendError::SpawnFailed`] if the spawn fails or the process exits
/// unsuccessfully within `grace`.
pub async fn spawn_detached(parts: &CommandParts, grace: Duration) -> Result<(), BackendError> {
    let mut cmd = Command::new(&parts.program);
    cmd.args(&parts.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = cmd
        .group_spawn()
        .map_err(|e| BackendError::SpawnFailed(format!("{}: {e}", parts.program)))?;

    if !grace.is_zero() {
        tokio::time::sleep(grace).await;
    }
    match child.try_wait() {
        Ok(Some(status)) if !status.success() => {
            return Err(BackendError::SpawnFailed(format!(
                "{} exited with {status}",
                parts.program
            )));
        }
        Ok(Some(_)) => return Ok(()),
        Ok(None) => {}
        Err(e) => tracing::debug!(program = %parts.program, ?e, "try_wait failed"),
    }

    tokio::spawn(async move {
        let _ = child.wait().await;
    });
    tracing::debug!(program = %parts.program, "Launched detached process");
    Ok(())
}

/// Open `client` in the best available terminal.
///
/// # Errors
/// See [`spawn_detached`].
pub async fn launch_in_terminal(title: &str, client: &CommandParts, grace: Duration) -> Result<(), BackendError> {
    let line = client.to_shell_line()?;
    let launcher = TerminalLauncher::detect().await;
    tracing::info!(?launcher, title, "Opening interactive client");
    spawn_detached(&launcher.command_for(title, &line), grace).await
}
