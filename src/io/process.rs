//! Process management layer
//!
//! Owns the game server child process and its lifecycle state. Other
//! components only ever see the process through `SupervisorStatus` snapshots
//! and a weak handle to its stdout.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::rcon::RemoteConsole;

// ============================================================================
// Process State Management
// ============================================================================

/// Buffered stdout of the running server, shared with the output reader
pub type OutputStream = tokio::sync::Mutex<BufReader<ChildStdout>>;

/// Live process and the resources spawned alongside it
struct RunningServer {
    pid: u32,
    child: Child,
    output: Arc<OutputStream>,
    stderr_task: JoinHandle<()>,
}

/// Internal lifecycle state
///
/// While stopping, the child itself is owned by the `stop` call; the state
/// keeps only the stdout handle so console output produced during shutdown is
/// still relayed.
enum SupervisorState {
    Absent,
    Starting,
    Running(RunningServer),
    Stopping { pid: u32, output: Arc<OutputStream> },
}

/// Snapshot of the lifecycle state for callers outside the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    /// No server process exists
    Absent,
    /// Spawn in progress
    Starting,
    /// Server is running
    Running { pid: u32 },
    /// Shutdown in progress
    Stopping { pid: u32 },
}

impl SupervisorStatus {
    /// Get the process ID if a process exists
    pub fn pid(&self) -> Option<u32> {
        match self {
            SupervisorStatus::Running { pid } | SupervisorStatus::Stopping { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the server is accepting lifecycle commands
    pub fn is_running(&self) -> bool {
        matches!(self, SupervisorStatus::Running { .. })
    }

    /// Check if a process with a readable stdout exists
    pub fn is_present(&self) -> bool {
        matches!(
            self,
            SupervisorStatus::Running { .. } | SupervisorStatus::Stopping { .. }
        )
    }
}

impl std::fmt::Display for SupervisorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorStatus::Absent => write!(f, "not started"),
            SupervisorStatus::Starting => write!(f, "starting"),
            SupervisorStatus::Running { pid } => write!(f, "running (PID {pid})"),
            SupervisorStatus::Stopping { pid } => write!(f, "stopping (PID {pid})"),
        }
    }
}

/// Read-only view of whether a server process is around, for periodic tasks
pub trait ServerPresence: Send + Sync {
    fn is_present(&self) -> bool;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Server is not started")]
    NotStarted,

    #[error("Server is already started")]
    AlreadyStarted,

    #[error("Failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Spawned process has no PID")]
    NoPid,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,

    #[error("Failed to terminate process {pid}: {source}")]
    Terminate {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Supervises the single game server process
pub struct ProcessSupervisor {
    config: ServerConfig,
    state: Mutex<SupervisorState>,
}

impl ProcessSupervisor {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SupervisorState::Absent),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        // State stays consistent across a panic: every transition is a single assignment
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get current lifecycle state
    pub fn status(&self) -> SupervisorStatus {
        match &*self.lock_state() {
            SupervisorState::Absent => SupervisorStatus::Absent,
            SupervisorState::Starting => SupervisorStatus::Starting,
            SupervisorState::Running(server) => SupervisorStatus::Running { pid: server.pid },
            SupervisorState::Stopping { pid, .. } => SupervisorStatus::Stopping { pid: *pid },
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.status().pid()
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    /// Weak handle to the server's stdout while a process exists
    ///
    /// The supervisor holds the only strong handle, so clearing the state
    /// detaches the reader without any coordination.
    pub fn output_stream(&self) -> Option<Weak<OutputStream>> {
        match &*self.lock_state() {
            SupervisorState::Running(server) => Some(Arc::downgrade(&server.output)),
            SupervisorState::Stopping { output, .. } => Some(Arc::downgrade(output)),
            SupervisorState::Absent | SupervisorState::Starting => None,
        }
    }

    /// Start the server process
    ///
    /// Returns as soon as the process is spawned; waiting for the server to
    /// become reachable is up to the caller.
    pub fn start(&self) -> Result<u32, ProcessError> {
        {
            let mut state = self.lock_state();
            if !matches!(*state, SupervisorState::Absent) {
                return Err(ProcessError::AlreadyStarted);
            }
            *state = SupervisorState::Starting;
        }

        match self.spawn_server() {
            Ok(server) => {
                let pid = server.pid;
                *self.lock_state() = SupervisorState::Running(server);
                info!("Server started with PID: {}", pid);
                Ok(pid)
            }
            Err(e) => {
                *self.lock_state() = SupervisorState::Absent;
                error!("Server failed to start: {}", e);
                Err(e)
            }
        }
    }

    fn spawn_server(&self) -> Result<RunningServer, ProcessError> {
        info!(
            "Starting server: {} (in {})",
            self.config.launch_command,
            self.config.working_directory.display()
        );

        let mut command_builder = shell_command(&self.config.launch_command);
        command_builder
            .current_dir(&self.config.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so termination reaches the JVM behind the shell
        #[cfg(unix)]
        command_builder.process_group(0);

        let mut child = command_builder.spawn().map_err(|source| ProcessError::Spawn {
            command: self.config.launch_command.clone(),
            source,
        })?;

        let pid = child.id().ok_or(ProcessError::NoPid)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        Ok(RunningServer {
            pid,
            child,
            output: Arc::new(tokio::sync::Mutex::new(BufReader::new(stdout))),
            stderr_task: spawn_stderr_drain(stderr, pid),
        })
    }

    /// Stop the server process
    ///
    /// Sends the graceful shutdown command first so the server can save, then
    /// terminates the process whether or not that command went through.
    pub async fn stop(&self, remote: &dyn RemoteConsole) -> Result<(), ProcessError> {
        let mut server = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, SupervisorState::Absent) {
                SupervisorState::Running(server) => {
                    *state = SupervisorState::Stopping {
                        pid: server.pid,
                        output: Arc::clone(&server.output),
                    };
                    server
                }
                other => {
                    *state = other;
                    return Err(ProcessError::NotStarted);
                }
            }
        };
        let pid = server.pid;

        info!("Stopping server with PID: {}", pid);

        match remote.send_command(&self.config.shutdown_command).await {
            Ok(response) => debug!("Shutdown command acknowledged: {:?}", response),
            Err(e) => warn!("Shutdown command failed, terminating anyway: {}", e),
        }

        let result = self.terminate(&mut server.child, pid).await;
        server.stderr_task.abort();

        *self.lock_state() = SupervisorState::Absent;
        remote.close().await;

        info!("Server PID {} stopped", pid);
        result
    }

    /// SIGTERM the process group, then SIGKILL if it outlives the timeout
    async fn terminate(&self, child: &mut Child, pid: u32) -> Result<(), ProcessError> {
        #[cfg(unix)]
        {
            if signal_group(pid, libc::SIGTERM) {
                info!("Sent SIGTERM to process group {}", pid);
            }
        }
        #[cfg(not(unix))]
        {
            child
                .start_kill()
                .map_err(|source| ProcessError::Terminate { pid, source })?;
        }

        match tokio::time::timeout(self.config.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Process PID {} exited with status: {}", pid, status);
                Ok(())
            }
            Ok(Err(source)) => Err(ProcessError::Terminate { pid, source }),
            Err(_) => {
                warn!(
                    "Process PID {} still alive after {:?}, killing",
                    pid, self.config.terminate_timeout
                );
                #[cfg(unix)]
                {
                    signal_group(pid, libc::SIGKILL);
                }
                child
                    .kill()
                    .await
                    .map_err(|source| ProcessError::Terminate { pid, source })
            }
        }
    }

    /// Clear the state if the server exited on its own
    ///
    /// Called by the output reader when stdout hits EOF.
    pub fn reap_exited(&self) -> Option<ExitStatus> {
        let mut state = self.lock_state();
        let SupervisorState::Running(server) = &mut *state else {
            return None;
        };

        match server.child.try_wait() {
            Ok(Some(status)) => {
                warn!(
                    "Server PID {} exited unexpectedly with status: {}",
                    server.pid, status
                );
                if let SupervisorState::Running(server) =
                    std::mem::replace(&mut *state, SupervisorState::Absent)
                {
                    server.stderr_task.abort();
                }
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Error checking server process status: {}", e);
                None
            }
        }
    }

    /// Synchronous force kill for Drop
    fn kill_sync(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        match state {
            SupervisorState::Running(server) => {
                info!("Synchronously force killing server PID: {}", server.pid);
                #[cfg(unix)]
                {
                    signal_group(server.pid, libc::SIGKILL);
                }
                let _ = server.child.start_kill();
                server.stderr_task.abort();
            }
            // The stop call owning the child was abandoned mid-way
            #[cfg(unix)]
            SupervisorState::Stopping { pid, .. } => {
                info!("Synchronously force killing stopping server PID: {}", pid);
                signal_group(*pid, libc::SIGKILL);
            }
            _ => {}
        }
        *state = SupervisorState::Absent;
    }
}

impl ServerPresence for ProcessSupervisor {
    fn is_present(&self) -> bool {
        self.status().is_present()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.kill_sync();
    }
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(not(unix))]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

/// Send a signal to the process group led by `pid`
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) with a negative pid only signals the group we created at spawn
    unsafe { libc::kill(-pgid, signal) == 0 }
}

/// Drain stderr into the log so a chatty server can never block on it
fn spawn_stderr_drain(stderr: tokio::process::ChildStderr, pid: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        trace!("ProcessSupervisor: Starting stderr drain for PID {}", pid);

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    trace!("ProcessSupervisor: stderr EOF reached");
                    break;
                }
                Ok(_) => {
                    let line_content = line.trim_end();
                    if !line_content.is_empty() {
                        debug!(pid, "server stderr: {}", line_content);
                    }
                }
                Err(e) => {
                    error!("Failed to read from stderr: {}", e);
                    break;
                }
            }
        }

        trace!("ProcessSupervisor: stderr drain finished");
    })
}
