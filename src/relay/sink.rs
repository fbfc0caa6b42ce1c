//! Output sinks for relayed console batches

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

/// Discord REST API root
pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

const DISCORD_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Destination for relayed console output
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Deliver one complete message; no acknowledgment beyond the attempt
    async fn deliver(&self, message: &str) -> Result<(), SinkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Discord API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Discord channel sink
// ============================================================================

#[derive(Debug, Serialize)]
struct AllowedMentions {
    parse: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    content: &'a str,
    /// Console output must never ping anyone
    allowed_mentions: AllowedMentions,
}

impl<'a> CreateMessageRequest<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            content,
            allowed_mentions: AllowedMentions { parse: Vec::new() },
        }
    }
}

/// Posts each batch as a message in one Discord channel
pub struct DiscordChannelSink {
    http_client: reqwest::Client,
    endpoint: String,
    bot_token: String,
}

impl DiscordChannelSink {
    pub fn new(bot_token: &str, channel_id: u64) -> Result<Self, SinkError> {
        Self::with_api_base(DISCORD_API_BASE, bot_token, channel_id)
    }

    /// Point the sink at a different API root
    pub fn with_api_base(api_base: &str, bot_token: &str, channel_id: u64) -> Result<Self, SinkError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DISCORD_REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http_client,
            endpoint: format!(
                "{}/channels/{}/messages",
                api_base.trim_end_matches('/'),
                channel_id
            ),
            bot_token: bot_token.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl OutputSink for DiscordChannelSink {
    async fn deliver(&self, message: &str) -> Result<(), SinkError> {
        debug!("Posting {} chars to Discord", message.len());

        let response = self
            .http_client
            .post(&self.endpoint)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(&CreateMessageRequest::new(message))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let summary: String = body.chars().take(200).collect();
            error!(status, body_summary = %summary, "Discord API error");
            return Err(SinkError::Api {
                status,
                message: summary,
            });
        }

        Ok(())
    }
}

// ============================================================================
// Stdout sink
// ============================================================================

/// Writes batches to the relay's own stdout when no chat channel is configured
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl OutputSink for StdoutSink {
    async fn deliver(&self, message: &str) -> Result<(), SinkError> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(message.as_bytes()).await?;
        if !message.ends_with('\n') {
            stdout.write_all(b"\n").await?;
        }
        stdout.flush().await?;
        Ok(())
    }
}

// ============================================================================
// Recording sink (for testing)
// ============================================================================

#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub messages: std::sync::Mutex<Vec<String>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl OutputSink for RecordingSink {
    async fn deliver(&self, message: &str) -> Result<(), SinkError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SinkError::Api {
                status: 500,
                message: "recording sink set to fail".to_string(),
            });
        }
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    /// Accept one HTTP request, reply with `status_line`, and hand back the raw request
    async fn one_shot_http_server(
        status_line: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];

            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}"
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (base, handle)
    }

    #[test]
    fn test_request_serialization_disables_mentions() {
        let json = serde_json::to_string(&CreateMessageRequest::new("hello @everyone")).unwrap();

        assert_eq!(
            json,
            r#"{"content":"hello @everyone","allowed_mentions":{"parse":[]}}"#
        );
    }

    #[test]
    fn test_endpoint_includes_channel() {
        let sink = DiscordChannelSink::with_api_base("https://example.test/api/", "t", 42).unwrap();
        assert_eq!(sink.endpoint(), "https://example.test/api/channels/42/messages");
    }

    #[tokio::test]
    async fn test_deliver_posts_message_with_bot_token() {
        let (base, server) = one_shot_http_server("HTTP/1.1 200 OK").await;
        let sink = DiscordChannelSink::with_api_base(&base, "secret-token", 1234).unwrap();

        sink.deliver("Server started\n").await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /channels/1234/messages"));
        assert!(request.to_lowercase().contains("authorization: bot secret-token"));
        assert!(request.contains(r#""content":"Server started\n""#));
    }

    #[tokio::test]
    async fn test_deliver_reports_api_errors() {
        let (base, server) = one_shot_http_server("HTTP/1.1 403 Forbidden").await;
        let sink = DiscordChannelSink::with_api_base(&base, "secret-token", 1234).unwrap();

        let result = sink.deliver("denied").await;

        assert!(matches!(result, Err(SinkError::Api { status: 403, .. })));
        server.await.unwrap();
    }
}
