//! Local operator console
//!
//! Reads one request per line from the relay's stdin and answers on stdout.
//! Everything typed here is trusted and runs as the `console` caller.
//!
//! Stdin is read on a plain OS thread. A blocking read parked there never
//! holds up runtime shutdown, so Ctrl-C exits even while the terminal is idle.

use std::io::{BufRead, BufReader, Read};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::gateway::{Caller, CommandGateway, GatewayError};
use crate::io::output::QueueStats;

/// Lines buffered between the stdin thread and the console loop
const LINE_BUFFER: usize = 16;

/// Caller name attached to requests typed at the local console
pub const CONSOLE_CALLER: &str = "console";

const HELP_TEXT: &str = "\
Commands:
  start        start the server and connect the RCON client
  stop         stop the server
  cmd <text>   run a server console command over RCON
  status       show the server state
  help         show this help
  quit         stop the server if running and exit";

/// A parsed console request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminRequest {
    Start,
    Stop,
    /// Server console command; may be empty, the gateway rejects that
    Command(String),
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown command `{0}`, type `help` for a list")]
pub struct UnknownRequest(pub String);

impl FromStr for AdminRequest {
    type Err = UnknownRequest;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_lowercase().as_str() {
            "start" => Ok(AdminRequest::Start),
            "stop" => Ok(AdminRequest::Stop),
            "cmd" => Ok(AdminRequest::Command(rest.to_string())),
            "status" => Ok(AdminRequest::Status),
            "help" | "?" => Ok(AdminRequest::Help),
            "quit" | "exit" => Ok(AdminRequest::Quit),
            _ => Err(UnknownRequest(verb.to_string())),
        }
    }
}

/// Read `input` line by line on a dedicated thread
///
/// The channel closes at end of input or on the first read error. The thread
/// is detached; it ends with the process if the read never returns.
pub fn spawn_line_reader<R>(input: R) -> mpsc::Receiver<String>
where
    R: Read + Send + 'static,
{
    let (sender, receiver) = mpsc::channel(LINE_BUFFER);

    let spawned = std::thread::Builder::new()
        .name("console-stdin".to_string())
        .spawn(move || {
            for line in BufReader::new(input).lines() {
                match line {
                    Ok(line) => {
                        if sender.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read console input: {}", e);
                        break;
                    }
                }
            }
            debug!("AdminConsole: input reader finished");
        });

    if let Err(e) = spawned {
        // Dropping the sender closes the channel, which reads as end of input
        error!("Failed to spawn console input thread: {}", e);
    }

    receiver
}

/// Line-oriented front end over the command gateway
pub struct AdminConsole {
    gateway: Arc<CommandGateway>,
    queue_stats: QueueStats,
    caller: Caller,
}

impl AdminConsole {
    pub fn new(gateway: Arc<CommandGateway>, queue_stats: QueueStats) -> Self {
        Self {
            gateway,
            queue_stats,
            caller: Caller::new(CONSOLE_CALLER),
        }
    }

    /// Serve requests until `quit` or end of input
    pub async fn run<W>(
        &self,
        mut lines: mpsc::Receiver<String>,
        mut output: W,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(line) = lines.recv().await {
            if line.trim().is_empty() {
                continue;
            }

            let reply = match line.parse::<AdminRequest>() {
                Ok(AdminRequest::Quit) => {
                    debug!("AdminConsole: quit requested");
                    break;
                }
                Ok(request) => self.handle(request).await,
                Err(e) => e.to_string(),
            };

            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }

        info!("Operator console closed");
        Ok(())
    }

    /// Execute one request and render the reply text
    pub async fn handle(&self, request: AdminRequest) -> String {
        match request {
            AdminRequest::Start => render(self.gateway.start_server(&self.caller).await),
            AdminRequest::Stop => render(self.gateway.stop_server(&self.caller).await),
            AdminRequest::Command(text) => {
                let result = self.gateway.relay_command(&self.caller, &text).await;
                render(result.map(|line| line.unwrap_or_else(|| "(no response)".to_string())))
            }
            AdminRequest::Status => self.status_line().await,
            AdminRequest::Help => HELP_TEXT.to_string(),
            AdminRequest::Quit => String::new(),
        }
    }

    async fn status_line(&self) -> String {
        let rcon = if self.gateway.rcon_connected().await {
            "connected"
        } else {
            "disconnected"
        };
        format!(
            "Server is {}; RCON {}; output queue {} pending, {} dropped",
            self.gateway.status(),
            rcon,
            self.queue_stats.pending(),
            self.queue_stats.dropped()
        )
    }
}

fn render(result: Result<String, GatewayError>) -> String {
    match result {
        Ok(reply) => reply,
        Err(e) => {
            if !e.is_expected() {
                error!("Request failed: {}", e);
            }
            e.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RconConfig, ServerConfig};
    use crate::io::output::output_queue;
    use crate::io::process::ProcessSupervisor;
    use crate::rcon::MockRemoteConsole;
    use std::time::Duration;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    const IDLE_STATUS: &str = "Server is not started; RCON disconnected; output queue 0 pending, 0 dropped";

    /// Reader whose `read` blocks until the paired sender is dropped
    struct BlockingInput(std::sync::mpsc::Receiver<()>);

    impl Read for BlockingInput {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    fn console_with(remote: Arc<MockRemoteConsole>, dir: &std::path::Path) -> AdminConsole {
        let supervisor = Arc::new(ProcessSupervisor::new(ServerConfig {
            working_directory: dir.to_path_buf(),
            launch_command: "sleep 30".to_string(),
            settle_delay: Duration::from_millis(10),
            terminate_timeout: Duration::from_secs(5),
            ..Default::default()
        }));
        let gateway = CommandGateway::new(supervisor, remote, &RconConfig::default());
        let (_writer, reader) = output_queue(16);
        AdminConsole::new(Arc::new(gateway), reader.stats())
    }

    fn parse(line: &str) -> Result<AdminRequest, UnknownRequest> {
        line.parse()
    }

    #[test]
    fn test_parse_requests() {
        assert_eq!(parse("start"), Ok(AdminRequest::Start));
        assert_eq!(parse("  STOP "), Ok(AdminRequest::Stop));
        assert_eq!(parse("status"), Ok(AdminRequest::Status));
        assert_eq!(parse("?"), Ok(AdminRequest::Help));
        assert_eq!(parse("exit"), Ok(AdminRequest::Quit));
        assert_eq!(
            parse("cmd say hello  world"),
            Ok(AdminRequest::Command("say hello  world".to_string()))
        );
        assert_eq!(parse("cmd"), Ok(AdminRequest::Command(String::new())));
    }

    #[test]
    fn test_parse_unknown_request() {
        let result = parse("restart now");

        assert_eq!(result, Err(UnknownRequest("restart".to_string())));
        assert!(result.unwrap_err().to_string().contains("help"));
    }

    #[tokio::test]
    async fn test_session_replies_until_quit() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MockRemoteConsole::new());
        let console = console_with(Arc::clone(&remote), dir.path());

        let input: &'static [u8] = b"status\ncmd list\n\nstop\nbogus\ncmd\nquit\nstart\n";
        let mut output = Vec::new();
        console.run(spawn_line_reader(input), &mut output).await.unwrap();

        let output = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines,
            vec![
                IDLE_STATUS,
                "Server is not started yet",
                "Server is not started yet",
                "Unknown command `bogus`, type `help` for a list",
                "cmd is missing a required argument: cmd <command>",
            ]
        );
        // Nothing after quit ran, and nothing tried to reach RCON
        assert_eq!(remote.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_start_command_and_stop_round() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MockRemoteConsole::with_response("There are 2 players online\n"));
        let console = console_with(Arc::clone(&remote), dir.path());

        let started = console.handle(AdminRequest::Start).await;
        let again = console.handle(AdminRequest::Start).await;
        let reply = console.handle(AdminRequest::Command("list".to_string())).await;
        let stopped = console.handle(AdminRequest::Stop).await;

        assert_eq!(started, "Server started, RCON client is connected");
        assert_eq!(again, "Server is already started");
        assert_eq!(reply, "There are 2 players online");
        assert_eq!(stopped, "Server stopped");
        assert_eq!(console.handle(AdminRequest::Status).await, IDLE_STATUS);
    }

    #[tokio::test]
    async fn test_status_reports_pid_rcon_and_queue() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MockRemoteConsole::new());
        let console = console_with(Arc::clone(&remote), dir.path());

        console.handle(AdminRequest::Start).await;
        let status = console.handle(AdminRequest::Status).await;
        console.handle(AdminRequest::Stop).await;

        assert!(status.starts_with("Server is running (PID "), "{status}");
        assert!(status.contains("RCON connected"), "{status}");
        assert!(status.ends_with("output queue 0 pending, 0 dropped"), "{status}");
    }

    #[tokio::test]
    async fn test_end_of_input_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let console = console_with(Arc::new(MockRemoteConsole::new()), dir.path());

        let input: &'static [u8] = b"help\n";
        let mut output = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            console.run(spawn_line_reader(input), &mut output),
        )
        .await
        .expect("console kept waiting after end of input")
        .unwrap();

        assert!(String::from_utf8(output).unwrap().starts_with("Commands:"));
    }

    #[test]
    fn test_blocked_input_does_not_hold_runtime_shutdown() {
        let (keep_blocked, blocked) = std::sync::mpsc::channel::<()>();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        runtime.block_on(async {
            let mut lines = spawn_line_reader(BlockingInput(blocked));
            let waited = tokio::time::timeout(Duration::from_millis(50), lines.recv()).await;
            assert!(waited.is_err(), "blocked input produced a line");
        });
        drop(runtime);

        assert!(started.elapsed() < Duration::from_secs(5));
        drop(keep_blocked);
    }

    #[tokio::test]
    async fn test_empty_response_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MockRemoteConsole::new());
        let console = console_with(remote, dir.path());

        console.handle(AdminRequest::Start).await;
        let reply = console.handle(AdminRequest::Command("save-all".to_string())).await;
        console.handle(AdminRequest::Stop).await;

        assert_eq!(reply, "(no response)");
    }

    #[tokio::test]
    async fn test_help_lists_every_command() {
        let dir = tempfile::tempdir().unwrap();
        let console = console_with(Arc::new(MockRemoteConsole::new()), dir.path());

        let help = console.handle(AdminRequest::Help).await;

        for verb in ["start", "stop", "cmd", "status", "help", "quit"] {
            assert!(help.contains(verb), "help is missing {verb}");
        }
    }
}
