use crate::log;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("{name} is not set, export it in the environment or add it to the engine env")]
    ConfigurationMissing { name: String },
    #[error("failed to open log file: {0}")]
    LogFile(std::io::Error),
    #[error("failed to spawn process: {0}")]
    SpawnFailed(#[from] std::io::Error),
    #[error("failed to signal process: {0}")]
    Signal(#[from] nix::errno::Errno),
}

// ---------------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------------

pub fn parse_command(command: &str) -> Result<Vec<String>, ProcessError> {
    let words = shell_words::split(command)
        .map_err(|e| ProcessError::InvalidCommand(format!("failed to parse: {e}")))?;

    if words.is_empty() {
        return Err(ProcessError::InvalidCommand("command is empty".to_string()));
    }

    Ok(words)
}

/// Look up `name` in the supplied env first, then the ambient environment.
pub fn require_env(name: &str, env: &HashMap<String, String>) -> Result<String, ProcessError> {
    if let Some(value) = env.get(name).filter(|v| !v.is_empty()) {
        return Ok(value.clone());
    }
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ProcessError::ConfigurationMissing {
            name: name.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exit code, `None` when killed by a signal.
    Exited(Option<i32>),
}

/// Handle to a launched child. Cloning shares the same child.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    status: watch::Receiver<ProcessStatus>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.status() == ProcessStatus::Running
    }

    /// A receiver that changes once the child exits.
    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.status.clone()
    }

    /// Wait for the child to exit and return its exit code.
    pub async fn wait(&self) -> Option<i32> {
        let mut rx = self.status.clone();
        let result = rx.wait_for(|s| *s != ProcessStatus::Running).await;
        match result.map(|s| *s) {
            Ok(ProcessStatus::Exited(code)) => code,
            _ => None,
        }
    }

    /// Kill the child immediately with SIGKILL.
    pub fn kill(&self) -> Result<(), ProcessError> {
        let Some(raw_pid) = self.pid else {
            return Ok(());
        };
        if !self.is_running() {
            return Ok(());
        }
        let pid = nix::unistd::Pid::from_raw(raw_pid as i32);
        match nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::Signal(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Everything needed to start one engine process.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub commands: Vec<String>,
    pub env: HashMap<String, String>,
    /// Variable locating the engine installation; must be set before launch.
    pub home_var: Option<String>,
}

/// Start the child in `work_dir` with stdout and stderr appended to `log_file`.
///
/// Returns as soon as the process is running. A reaper task waits on the
/// child and publishes its exit status to the handle.
pub fn launch(
    spec: &LaunchSpec,
    work_dir: &Path,
    log_file: &Path,
) -> Result<ProcessHandle, ProcessError> {
    if let Some(ref home_var) = spec.home_var {
        let home = require_env(home_var, &spec.env)?;
        tracing::debug!(var = %home_var, home = %home, "engine home resolved");
    }

    let Some((program, args)) = spec.commands.split_first() else {
        return Err(ProcessError::InvalidCommand("command is empty".to_string()));
    };

    let stdout = log::open_for_append(log_file).map_err(ProcessError::LogFile)?;
    let stderr = stdout.try_clone().map_err(ProcessError::LogFile)?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(work_dir);
    cmd.envs(&spec.env);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(stdout));
    cmd.stderr(Stdio::from(stderr));

    let mut child = cmd.spawn().map_err(ProcessError::SpawnFailed)?;
    let pid = child.id();
    tracing::info!(?pid, program = %program, log = %log_file.display(), "engine process started");

    let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to wait on engine process");
                None
            }
        };
        tracing::info!(?pid, ?code, "engine process exited");
        let _ = status_tx.send(ProcessStatus::Exited(code));
    });

    Ok(ProcessHandle {
        pid,
        status: status_rx,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
