//! Administrative command gateway
//!
//! Maps start/stop/command requests from an already-authorized caller onto the
//! process supervisor and the RCON client. Expected failures come back as
//! `GatewayError` kinds that render as the message shown to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, Level, info, info_span, warn};

use crate::config::RconConfig;
use crate::io::process::{ProcessError, ProcessSupervisor, SupervisorStatus};
use crate::log_timing;
use crate::rcon::{RconError, RemoteConsole};

/// Identity of whoever issued a request, as vouched for by the dispatch layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub name: String,
}

impl Caller {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Server is already started")]
    AlreadyStarted,

    #[error("Server is not started yet")]
    NotStarted,

    #[error("cmd is missing a required argument: cmd <command>")]
    MissingCommand,

    #[error("Server failed to start: {0}")]
    Startup(#[source] ProcessError),

    #[error("Server exited before the RCON client could connect")]
    ExitedDuringStartup,

    /// Server is running but the RCON handshake failed
    #[error("Server is running but the RCON client was unable to connect: {0}")]
    Handshake(#[source] RconError),

    #[error("RCON command failed: {0}")]
    Connection(#[source] RconError),

    #[error("Process failure: {0}")]
    Process(#[source] ProcessError),
}

impl GatewayError {
    /// Whether this is a routine outcome rather than a fault worth an error log
    pub fn is_expected(&self) -> bool {
        !matches!(self, GatewayError::Process(_))
    }
}

/// Connect timeouts for the two kinds of handshake the gateway performs
#[derive(Debug, Clone, Copy)]
struct ConnectTimeouts {
    startup: Duration,
    command: Duration,
}

pub struct CommandGateway {
    supervisor: Arc<ProcessSupervisor>,
    remote: Arc<dyn RemoteConsole>,
    timeouts: ConnectTimeouts,
}

impl CommandGateway {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        remote: Arc<dyn RemoteConsole>,
        rcon: &RconConfig,
    ) -> Self {
        Self {
            supervisor,
            remote,
            timeouts: ConnectTimeouts {
                startup: rcon.startup_connect_timeout,
                command: rcon.command_connect_timeout,
            },
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        self.supervisor.status()
    }

    pub async fn rcon_connected(&self) -> bool {
        self.remote.is_connected().await
    }

    /// Start the server, wait out the settle delay, then connect RCON
    ///
    /// A failed handshake is reported but leaves the server running.
    pub async fn start_server(&self, caller: &Caller) -> Result<String, GatewayError> {
        let span = info_span!("start_server", caller = %caller.name);
        async move {
            let started = Instant::now();
            let pid = self.supervisor.start().map_err(|e| match e {
                ProcessError::AlreadyStarted => GatewayError::AlreadyStarted,
                other => GatewayError::Startup(other),
            })?;

            let settle_delay = self.supervisor.config().settle_delay;
            info!(
                "Server is starting (PID {}), connecting RCON client in {:?}",
                pid, settle_delay
            );
            tokio::time::sleep(settle_delay).await;

            if !self.supervisor.is_running() {
                return Err(GatewayError::ExitedDuringStartup);
            }

            // A previous server instance may have died with the session still open
            self.remote.close().await;
            self.remote
                .connect(self.timeouts.startup)
                .await
                .map_err(GatewayError::Handshake)?;

            log_timing!(Level::DEBUG, "start_server", started.elapsed());
            Ok("Server started, RCON client is connected".to_string())
        }
        .instrument(span)
        .await
    }

    /// Ask the server to save and exit, then make sure it is gone
    pub async fn stop_server(&self, caller: &Caller) -> Result<String, GatewayError> {
        let span = info_span!("stop_server", caller = %caller.name);
        async move {
            if !self.supervisor.is_running() {
                return Err(GatewayError::NotStarted);
            }

            info!("Server is turning off");
            if let Err(e) = self.remote.connect(self.timeouts.command).await {
                warn!("RCON unavailable for graceful shutdown: {}", e);
            }

            match self.supervisor.stop(self.remote.as_ref()).await {
                Ok(()) => Ok("Server stopped".to_string()),
                // Another stop won the race
                Err(ProcessError::NotStarted) => Err(GatewayError::NotStarted),
                Err(e) => Err(GatewayError::Process(e)),
            }
        }
        .instrument(span)
        .await
    }

    /// Run a console command and return the first line of its response
    pub async fn relay_command(
        &self,
        caller: &Caller,
        command: &str,
    ) -> Result<Option<String>, GatewayError> {
        let span = info_span!("relay_command", caller = %caller.name);
        async move {
            let command = command.trim();
            if command.is_empty() {
                return Err(GatewayError::MissingCommand);
            }
            if !self.supervisor.is_running() {
                return Err(GatewayError::NotStarted);
            }

            info!("Relaying command: {}", command);
            self.remote
                .connect(self.timeouts.command)
                .await
                .map_err(GatewayError::Connection)?;
            let response = self
                .remote
                .send_command(command)
                .await
                .map_err(GatewayError::Connection)?;

            Ok(response
                .lines()
                .next()
                .map(str::trim_end)
                .filter(|line| !line.is_empty())
                .map(str::to_string))
        }
        .instrument(span)
        .await
    }
}
