//! Error types for the RCON client

use std::time::Duration;

/// Errors raised while talking to the server's remote console
#[derive(Debug, thiserror::Error)]
pub enum RconError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP connect or login did not finish in time
    #[error("Connection to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    /// Server rejected the password
    #[error("Authentication failed for {address}")]
    AuthenticationFailed { address: String },

    #[error("Not connected")]
    NotConnected,

    /// Server closed the socket mid-exchange
    #[error("Connection closed by server")]
    ConnectionClosed,

    #[error("No response within {0:?}")]
    ResponseTimeout(Duration),

    #[error("Command too long: {size} bytes (max: {max})")]
    CommandTooLong { size: usize, max: usize },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },
}

impl RconError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPacket(reason.into())
    }
}
