//! RCON client with reconnect-on-demand session handling

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{Level, debug, info, trace, warn};

use crate::config::RconConfig;
use crate::rcon::codec::{AUTH_FAILED_ID, MAX_COMMAND_LEN, RconCodec, RconPacket, packet_type};
use crate::rcon::error::RconError;
use crate::{log_rcon_message, log_timing};

/// Remote administration session as seen by the gateway and supervisor
#[async_trait]
pub trait RemoteConsole: Send + Sync {
    /// Establish the session; a no-op when already connected
    async fn connect(&self, timeout: Duration) -> Result<(), RconError>;

    /// Run one console command and return its textual response (may be empty)
    async fn send_command(&self, command: &str) -> Result<String, RconError>;

    /// Release the session; safe to call when already disconnected
    async fn close(&self);

    async fn is_connected(&self) -> bool;
}

/// Session state, owned and mutated only by RconClient
enum RemoteSession {
    Disconnected,
    Connected(Framed<TcpStream, RconCodec>),
}

/// RCON client for a single server endpoint
pub struct RconClient {
    address: String,
    password: String,
    response_timeout: Duration,
    session: Mutex<RemoteSession>,
    next_request_id: AtomicI32,
}

impl RconClient {
    pub fn new(config: &RconConfig) -> Self {
        Self {
            address: format!("{}:{}", config.host, config.port),
            password: config.password.clone(),
            response_timeout: config.response_timeout,
            session: Mutex::new(RemoteSession::Disconnected),
            next_request_id: AtomicI32::new(1),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn next_request_id(&self) -> i32 {
        // Ids stay positive so they never collide with the auth failure marker
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        if id <= 0 {
            self.next_request_id.store(2, Ordering::Relaxed);
            1
        } else {
            id
        }
    }

    /// Open the TCP connection and complete the login exchange
    async fn open_session(&self) -> Result<Framed<TcpStream, RconCodec>, RconError> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, RconCodec);

        let request_id = self.next_request_id();
        log_rcon_message!(Level::TRACE, "outgoing", request_id, "<login>");
        framed.send(RconPacket::auth(request_id, &self.password)).await?;

        loop {
            let packet = framed.next().await.ok_or(RconError::ConnectionClosed)??;
            log_rcon_message!(Level::TRACE, "incoming", packet.request_id, packet.body);

            if packet.kind != packet_type::AUTH_RESPONSE {
                // Some servers send an empty response value ahead of the login reply
                trace!("RconClient: skipping packet type {} during login", packet.kind);
                continue;
            }
            if packet.request_id == AUTH_FAILED_ID {
                return Err(RconError::AuthenticationFailed {
                    address: self.address.clone(),
                });
            }
            if packet.request_id == request_id {
                return Ok(framed);
            }
            trace!(
                "RconClient: ignoring login reply for request {}",
                packet.request_id
            );
        }
    }

    async fn exchange(
        framed: &mut Framed<TcpStream, RconCodec>,
        request_id: i32,
        command: &str,
    ) -> Result<String, RconError> {
        log_rcon_message!(Level::TRACE, "outgoing", request_id, command);
        framed.send(RconPacket::command(request_id, command)).await?;

        loop {
            let packet = framed.next().await.ok_or(RconError::ConnectionClosed)??;
            log_rcon_message!(Level::TRACE, "incoming", packet.request_id, packet.body);

            if packet.request_id == request_id && packet.kind == packet_type::RESPONSE_VALUE {
                return Ok(packet.body);
            }
            trace!(
                "RconClient: skipping stale packet id={} type={}",
                packet.request_id,
                packet.kind
            );
        }
    }
}

#[async_trait]
impl RemoteConsole for RconClient {
    async fn connect(&self, timeout: Duration) -> Result<(), RconError> {
        let mut session = self.session.lock().await;
        if matches!(*session, RemoteSession::Connected(_)) {
            trace!("RconClient: already connected to {}", self.address);
            return Ok(());
        }

        debug!("Connecting RCON client to {} (timeout {:?})", self.address, timeout);
        let started = Instant::now();

        let framed = match tokio::time::timeout(timeout, self.open_session()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RconError::ConnectTimeout {
                    address: self.address.clone(),
                    timeout,
                });
            }
        };

        *session = RemoteSession::Connected(framed);
        log_timing!(Level::DEBUG, "rcon_connect", started.elapsed());
        info!("RCON client connected to {}", self.address);
        Ok(())
    }

    async fn send_command(&self, command: &str) -> Result<String, RconError> {
        if command.len() > MAX_COMMAND_LEN {
            return Err(RconError::CommandTooLong {
                size: command.len(),
                max: MAX_COMMAND_LEN,
            });
        }

        let mut session = self.session.lock().await;

        // The session only goes back in once the exchange succeeded
        let mut framed = match std::mem::replace(&mut *session, RemoteSession::Disconnected) {
            RemoteSession::Connected(framed) => framed,
            RemoteSession::Disconnected => return Err(RconError::NotConnected),
        };

        let request_id = self.next_request_id();
        let result = tokio::time::timeout(
            self.response_timeout,
            Self::exchange(&mut framed, request_id, command),
        )
        .await;

        match result {
            Ok(Ok(response)) => {
                *session = RemoteSession::Connected(framed);
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!("RCON command failed, dropping session: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!(
                    "RCON command timed out after {:?}, dropping session",
                    self.response_timeout
                );
                Err(RconError::ResponseTimeout(self.response_timeout))
            }
        }
    }

    async fn close(&self) {
        let mut session = self.session.lock().await;
        if let RemoteSession::Connected(framed) =
            std::mem::replace(&mut *session, RemoteSession::Disconnected)
        {
            let mut stream = framed.into_inner();
            // Errors here only mean the server already went away
            let _ = stream.shutdown().await;
            info!("RCON client disconnected from {}", self.address);
        }
    }

    async fn is_connected(&self) -> bool {
        matches!(*self.session.lock().await, RemoteSession::Connected(_))
    }
}

// ============================================================================
// Mock Remote Console (for testing)
// ============================================================================

/// Scripted remote console that records every call
#[cfg(test)]
#[derive(Default)]
pub struct MockRemoteConsole {
    pub fail_connect: std::sync::atomic::AtomicBool,
    pub fail_commands: std::sync::atomic::AtomicBool,
    pub response: std::sync::Mutex<String>,
    pub connects: std::sync::Mutex<Vec<Duration>>,
    pub commands: std::sync::Mutex<Vec<String>>,
    pub closes: std::sync::atomic::AtomicUsize,
    connected: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MockRemoteConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_connect() -> Self {
        let mock = Self::default();
        mock.fail_connect.store(true, Ordering::SeqCst);
        mock
    }

    pub fn with_response(response: &str) -> Self {
        let mock = Self::default();
        *mock.response.lock().unwrap() = response.to_string();
        mock
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn sent_commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl RemoteConsole for MockRemoteConsole {
    async fn connect(&self, timeout: Duration) -> Result<(), RconError> {
        self.connects.lock().unwrap().push(timeout);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(RconError::ConnectTimeout {
                address: "mock:0".to_string(),
                timeout,
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_command(&self, command: &str) -> Result<String, RconError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RconError::NotConnected);
        }
        self.commands.lock().unwrap().push(command.to_string());
        if self.fail_commands.load(Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(RconError::ConnectionClosed);
        }
        Ok(self.response.lock().unwrap().clone())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
