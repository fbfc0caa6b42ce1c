//! Relay configuration
//!
//! Provides RelayConfig, assembled from environment variables with CLI
//! overrides layered on top, and validated into typed errors before any
//! component is built from it.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Shell command that launches the game server
pub const DEFAULT_LAUNCH_COMMAND: &str = "java -Xmx4096M -Xms4096M -jar server.jar nogui";

/// Console command sent over RCON to let the server persist state and exit
pub const DEFAULT_SHUTDOWN_COMMAND: &str = "stop";

/// Fixed wait between spawning the server and the first RCON handshake (15 seconds)
///
/// The server's own readiness line is not parsed; this is a heuristic upper
/// bound on how long a vanilla server takes to bind its RCON port.
pub const DEFAULT_SETTLE_DELAY_SECS: u64 = 15;

/// How long to wait for the process to exit after SIGTERM before SIGKILL
pub const DEFAULT_TERMINATE_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_RCON_HOST: &str = "127.0.0.1";

pub const DEFAULT_RCON_PORT: u16 = 25575;

/// Connect timeout for the handshake right after server start (25 seconds)
pub const DEFAULT_STARTUP_CONNECT_TIMEOUT_SECS: u64 = 25;

/// Connect timeout for the implicit reconnect before each command (10 seconds)
pub const DEFAULT_COMMAND_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Time allowed for a command response to arrive
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 10;

/// Period between relay flush cycles
pub const DEFAULT_FLUSH_PERIOD_MS: u64 = 1000;

/// Wall-clock bound of a single batch window
pub const DEFAULT_BATCH_WINDOW_SECS: u64 = 10;

/// Record bound of a single batch window
pub const DEFAULT_BATCH_MAX_RECORDS: usize = 13;

/// Short wait before each pop inside a batch window
pub const DEFAULT_BATCH_POLL_MS: u64 = 100;

/// Period of the output reader's poll cycle
pub const DEFAULT_READER_POLL_MS: u64 = 100;

/// Soft cap on records pending in the output queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

// ============================================================================
// Errors
// ============================================================================

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Missing required configuration value
    #[error("Missing required setting: {name}")]
    MissingField { name: String },

    /// Value present but unparseable
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },

    /// Working directory does not exist or is not a directory
    #[error("Server directory not found: {path}")]
    MissingDirectory { path: PathBuf },

    /// A bound that must be positive was zero
    #[error("{name} must be greater than zero")]
    ZeroBound { name: String },

    /// Only one of the two Discord settings was supplied
    #[error("Discord sink needs both DISCORD_BOT_TOKEN and DISCORD_CHANNEL_ID")]
    IncompleteDiscord,
}

impl ConfigError {
    pub fn missing_field(name: impl Into<String>) -> Self {
        Self::MissingField { name: name.into() }
    }

    pub fn zero_bound(name: impl Into<String>) -> Self {
        Self::ZeroBound { name: name.into() }
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Complete relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub rcon: RconConfig,
    pub batch: BatchConfig,
    pub reader: ReaderConfig,
    pub discord: DiscordConfig,
}

/// Game server process settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory the server is launched in
    pub working_directory: PathBuf,

    /// Shell command line that starts the server
    pub launch_command: String,

    /// RCON command that asks the server to save and exit
    pub shutdown_command: String,

    pub settle_delay: Duration,

    pub terminate_timeout: Duration,
}

/// RCON endpoint and timeouts
#[derive(Clone)]
pub struct RconConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub startup_connect_timeout: Duration,
    pub command_connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl std::fmt::Debug for RconConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RconConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .field("startup_connect_timeout", &self.startup_connect_timeout)
            .field("command_connect_timeout", &self.command_connect_timeout)
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

/// Batch window bounds for the output relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub flush_period: Duration,
    pub window_timeout: Duration,
    pub max_records: usize,
    pub poll_interval: Duration,
}

/// Output reader settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    pub poll_interval: Duration,
    pub queue_capacity: usize,
}

/// Discord output channel credentials
#[derive(Clone, Default)]
pub struct DiscordConfig {
    pub bot_token: Option<String>,
    pub channel_id: Option<u64>,
}

impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "<redacted>"))
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

impl DiscordConfig {
    /// Token and channel when both are configured
    pub fn credentials(&self) -> Option<(&str, u64)> {
        match (&self.bot_token, self.channel_id) {
            (Some(token), Some(channel_id)) => Some((token.as_str(), channel_id)),
            _ => None,
        }
    }
}

// ============================================================================
// Default Implementations
// ============================================================================

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from("."),
            launch_command: DEFAULT_LAUNCH_COMMAND.to_string(),
            shutdown_command: DEFAULT_SHUTDOWN_COMMAND.to_string(),
            settle_delay: Duration::from_secs(DEFAULT_SETTLE_DELAY_SECS),
            terminate_timeout: Duration::from_secs(DEFAULT_TERMINATE_TIMEOUT_SECS),
        }
    }
}

impl Default for RconConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_RCON_HOST.to_string(),
            port: DEFAULT_RCON_PORT,
            password: String::new(),
            startup_connect_timeout: Duration::from_secs(DEFAULT_STARTUP_CONNECT_TIMEOUT_SECS),
            command_connect_timeout: Duration::from_secs(DEFAULT_COMMAND_CONNECT_TIMEOUT_SECS),
            response_timeout: Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_period: Duration::from_millis(DEFAULT_FLUSH_PERIOD_MS),
            window_timeout: Duration::from_secs(DEFAULT_BATCH_WINDOW_SECS),
            max_records: DEFAULT_BATCH_MAX_RECORDS,
            poll_interval: Duration::from_millis(DEFAULT_BATCH_POLL_MS),
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_READER_POLL_MS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Values supplied on the command line; each one replaces its env counterpart
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub server_dir: Option<PathBuf>,
    pub launch_command: Option<String>,
    pub rcon_host: Option<String>,
    pub rcon_port: Option<u16>,
    pub settle_delay_secs: Option<u64>,
    pub channel_id: Option<u64>,
}

impl RelayConfig {
    /// Create RelayConfig from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup (the process environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut server = ServerConfig::default();
        if let Some(dir) = lookup("MC_SERVER_DIR") {
            server.working_directory = PathBuf::from(dir);
        }
        if let Some(command) = lookup("MC_LAUNCH_COMMAND") {
            server.launch_command = command;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "MC_SETTLE_DELAY_SECS")? {
            server.settle_delay = Duration::from_secs(secs);
        }

        let mut rcon = RconConfig::default();
        if let Some(host) = lookup("MC_RCON_HOST") {
            rcon.host = host;
        }
        if let Some(port) = parse_var::<u16, _>(&lookup, "MC_RCON_PORT")? {
            rcon.port = port;
        }
        if let Some(password) = lookup("MC_RCON_PASSWORD") {
            rcon.password = password;
        }

        let discord = DiscordConfig {
            bot_token: lookup("DISCORD_BOT_TOKEN").filter(|token| !token.is_empty()),
            channel_id: parse_var::<u64, _>(&lookup, "DISCORD_CHANNEL_ID")?,
        };

        Ok(Self {
            server,
            rcon,
            batch: BatchConfig::default(),
            reader: ReaderConfig::default(),
            discord,
        })
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(dir) = overrides.server_dir {
            self.server.working_directory = dir;
        }
        if let Some(command) = overrides.launch_command {
            self.server.launch_command = command;
        }
        if let Some(host) = overrides.rcon_host {
            self.rcon.host = host;
        }
        if let Some(port) = overrides.rcon_port {
            self.rcon.port = port;
        }
        if let Some(secs) = overrides.settle_delay_secs {
            self.server.settle_delay = Duration::from_secs(secs);
        }
        if let Some(channel_id) = overrides.channel_id {
            self.discord.channel_id = Some(channel_id);
        }
        self
    }

    /// Check the assembled configuration before anything is built from it
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rcon.password.is_empty() {
            return Err(ConfigError::missing_field("MC_RCON_PASSWORD"));
        }
        if self.rcon.port == 0 {
            return Err(ConfigError::zero_bound("MC_RCON_PORT"));
        }
        if self.server.launch_command.trim().is_empty() {
            return Err(ConfigError::missing_field("MC_LAUNCH_COMMAND"));
        }
        if !self.server.working_directory.is_dir() {
            return Err(ConfigError::MissingDirectory {
                path: self.server.working_directory.clone(),
            });
        }
        if self.batch.max_records == 0 {
            return Err(ConfigError::zero_bound("batch max records"));
        }
        if self.batch.flush_period.is_zero() {
            return Err(ConfigError::zero_bound("flush period"));
        }
        if self.batch.window_timeout.is_zero() {
            return Err(ConfigError::zero_bound("batch window timeout"));
        }
        if self.reader.queue_capacity == 0 {
            return Err(ConfigError::zero_bound("queue capacity"));
        }
        if self.discord.bot_token.is_some() != self.discord.channel_id.is_some() {
            return Err(ConfigError::IncompleteDiscord);
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value: raw,
            }),
    }
}
