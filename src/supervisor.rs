use crate::config::SupervisorConfig;
use crate::engine::{ApplicationTarget, Engine};
use crate::log;
use crate::monitor::{self, DetectedError, LogMonitor, MonitorState, MonitorStatus, SharedState};
use crate::paths::Paths;
use crate::process::{self, ProcessError, ProcessHandle};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How long `error` waits for the monitor when nothing has been detected yet.
pub const ERROR_GRACE_PERIOD: Duration = Duration::from_secs(1);

const ERROR_GRACE_STEP: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("engine already started")]
    AlreadyStarted,
    #[error("failed to prepare working directory: {0}")]
    WorkDir(std::io::Error),
    #[error("failed to select log file: {0}")]
    LogFile(std::io::Error),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Diagnosis of a failed engine, built from its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineError {
    #[error(
        "{message}\n See more: {log_file}\n FYI: The last {} line(s) of log are:\n{}",
        .recent.len(),
        .recent.join("\n")
    )]
    Detected {
        message: String,
        log_file: String,
        recent: Vec<String>,
    },
    #[error(
        "Failed to detect the root cause, please check {log_file} if necessary. The last {} line(s) of log are:\n{}",
        .recent.len(),
        .recent.join("\n")
    )]
    RootCauseNotFound { log_file: String, recent: Vec<String> },
}

impl EngineError {
    pub fn log_file(&self) -> &str {
        match self {
            EngineError::Detected { log_file, .. } | EngineError::RootCauseNotFound { log_file, .. } => {
                log_file
            }
        }
    }

    pub fn recent(&self) -> &[String] {
        match self {
            EngineError::Detected { recent, .. } | EngineError::RootCauseNotFound { recent, .. } => {
                recent
            }
        }
    }

    /// The captured exception text, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            EngineError::Detected { message, .. } => Some(message),
            EngineError::RootCauseNotFound { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Started,
    Closed,
}

struct Inner {
    phase: Phase,
    work_dir: Option<PathBuf>,
    log_file: Option<PathBuf>,
    process: Option<ProcessHandle>,
    monitor: Option<LogMonitor>,
}

/// Launches one engine process, watches its log, and reports why it failed.
pub struct Supervisor<E: Engine> {
    engine: E,
    identity: String,
    config: SupervisorConfig,
    state: SharedState,
    inner: Mutex<Inner>,
}

impl<E: Engine> Supervisor<E> {
    pub fn new(engine: E, identity: impl Into<String>, config: SupervisorConfig) -> Self {
        let state = Arc::new(RwLock::new(MonitorState::new(config.max_log_lines)));
        Self {
            engine,
            identity: identity.into(),
            config,
            state,
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                work_dir: None,
                log_file: None,
                process: None,
                monitor: None,
            }),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub async fn phase(&self) -> Phase {
        self.inner.lock().await.phase
    }

    pub async fn log_file(&self) -> Option<PathBuf> {
        self.inner.lock().await.log_file.clone()
    }

    pub async fn working_dir(&self) -> Option<PathBuf> {
        self.inner.lock().await.work_dir.clone()
    }

    pub async fn process(&self) -> Option<ProcessHandle> {
        self.inner.lock().await.process.clone()
    }

    /// Released stays terminal after `close` has dropped the monitor.
    pub async fn monitor_status(&self) -> MonitorStatus {
        let inner = self.inner.lock().await;
        match (&inner.monitor, inner.phase) {
            (Some(monitor), _) => monitor.status(),
            (None, Phase::Idle) => MonitorStatus::NotStarted,
            (None, Phase::Started | Phase::Closed) => MonitorStatus::Released,
        }
    }

    /// Wait until the monitor has released its reader, which happens once the
    /// engine has exited and its log is fully drained. Returns false on
    /// timeout or when no monitor is running.
    pub async fn wait_released(&self, timeout: Duration) -> bool {
        let Some(mut status) = self.inner.lock().await.monitor.as_ref().map(LogMonitor::subscribe)
        else {
            return false;
        };
        let released = status.wait_for(|s| *s == MonitorStatus::Released);
        matches!(tokio::time::timeout(timeout, released).await, Ok(Ok(_)))
    }

    /// Resolve the working directory, pick a log file, launch the engine and
    /// start tailing its log.
    pub async fn start(&self) -> Result<ProcessHandle, SupervisorError> {
        let mut inner = self.inner.lock().await;
        if inner.phase != Phase::Idle {
            return Err(SupervisorError::AlreadyStarted);
        }

        // Validate the command line before touching the disk.
        let spec = self.engine.launch_spec()?;
        if let Some(ref home_var) = spec.home_var {
            process::require_env(home_var, &spec.env)?;
        }

        let paths = Paths::from_env(self.config.work_dir_root.as_deref(), &self.identity)
            .map_err(SupervisorError::WorkDir)?;
        let log_file = log::select_log_file(&paths, self.engine.module(), self.config.log_timeout)
            .map_err(SupervisorError::LogFile)?;

        tracing::info!(
            identity = %self.identity,
            module = %self.engine.module(),
            work_dir = %paths.work_dir().display(),
            log = %log_file.display(),
            "starting engine"
        );

        let handle = process::launch(&spec, paths.work_dir(), &log_file)?;
        let monitor = monitor::spawn_monitor(
            log_file.clone(),
            Arc::clone(&self.state),
            self.config.max_error_size,
            handle.subscribe(),
        );

        inner.phase = Phase::Started;
        inner.work_dir = Some(paths.work_dir().to_path_buf());
        inner.log_file = Some(log_file);
        inner.process = Some(handle.clone());
        inner.monitor = Some(monitor);
        Ok(handle)
    }

    /// Why the engine failed, as far as its log tells.
    ///
    /// When nothing has been detected yet this waits up to
    /// [`ERROR_GRACE_PERIOD`] for the monitor to catch up on pending output.
    pub async fn error(&self) -> EngineError {
        let log_file = self
            .log_file()
            .await
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let deadline = tokio::time::Instant::now() + ERROR_GRACE_PERIOD;
        loop {
            {
                let state = self.state.read().await;
                if state.error.is_set() || tokio::time::Instant::now() >= deadline {
                    return snapshot(&state, log_file);
                }
            }
            tokio::time::sleep(ERROR_GRACE_STEP).await;
        }
    }

    /// Stop tailing and, unless configured to wait for completion, kill the
    /// engine. Safe to call repeatedly and before `start`.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;

        if let Some(monitor) = inner.monitor.take() {
            monitor.stop().await;
        }

        if !self.config.wait_completion
            && let Some(process) = inner.process.take()
        {
            if let Err(e) = process.kill() {
                tracing::warn!(pid = ?process.pid(), error = %e, "failed to kill engine process");
            } else {
                tracing::info!(pid = ?process.pid(), "engine process killed");
            }
        }

        if inner.phase == Phase::Started {
            inner.phase = Phase::Closed;
        }
    }

    pub fn kill_application(&self, target: &ApplicationTarget) -> String {
        tracing::debug!(%target, module = %self.engine.module(), "kill application requested");
        self.engine.kill_application(target)
    }

    /// The command line, one `--flag` per line.
    pub fn describe(&self) -> String {
        match self.engine.commands() {
            Ok(commands) if !commands.is_empty() => format_commands(&commands),
            _ => format!("{} engine for {}", self.engine.module(), self.identity),
        }
    }
}

impl<E: Engine> fmt::Display for Supervisor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

fn snapshot(state: &MonitorState, log_file: String) -> EngineError {
    let recent = state.recent.to_vec();
    match &state.error {
        DetectedError::Detected { text, log_file: path } => EngineError::Detected {
            message: text.clone(),
            log_file: path.display().to_string(),
            recent,
        },
        DetectedError::Unset => EngineError::RootCauseNotFound { log_file, recent },
    }
}

pub fn format_commands(commands: &[String]) -> String {
    commands
        .iter()
        .map(|arg| {
            let quoted = shell_words::quote(arg);
            if arg.starts_with("--") {
                format!("\\\n\t{quoted}")
            } else {
                quoted.into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
