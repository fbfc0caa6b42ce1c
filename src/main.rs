mod config;
mod console;
mod gateway;
mod io;
mod logging;
mod rcon;
mod relay;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use config::{ConfigOverrides, RelayConfig};
use console::AdminConsole;
use gateway::{Caller, CommandGateway};
use io::{OutputReader, ProcessSupervisor, output_queue};
use logging::{LogConfig, init_logging};
use rcon::{RconClient, RemoteConsole};
use relay::{DiscordChannelSink, OutputRelay, OutputSink, StdoutSink};

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::stdout;
use tracing::{info, warn};

/// CLI arguments for the console relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory the server is launched in (overrides MC_SERVER_DIR, defaults to current directory)
    #[arg(long, value_name = "DIR")]
    server_dir: Option<PathBuf>,

    /// Shell command that starts the server (overrides MC_LAUNCH_COMMAND)
    #[arg(long, value_name = "COMMAND")]
    launch_command: Option<String>,

    /// RCON host (overrides MC_RCON_HOST)
    #[arg(long, value_name = "HOST")]
    rcon_host: Option<String>,

    /// RCON port (overrides MC_RCON_PORT)
    #[arg(long, value_name = "PORT")]
    rcon_port: Option<u16>,

    /// Seconds to wait after start before connecting RCON (overrides MC_SETTLE_DELAY_SECS)
    #[arg(long, value_name = "SECS")]
    settle_delay: Option<u64>,

    /// Discord channel that receives console output (overrides DISCORD_CHANNEL_ID)
    #[arg(long, value_name = "ID")]
    channel_id: Option<u64>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides MC_RELAY_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

/// Pick the output sink: the Discord channel when fully configured, stdout otherwise
fn create_sink(config: &RelayConfig) -> Result<Arc<dyn OutputSink>, Box<dyn std::error::Error>> {
    match config.discord.credentials() {
        Some((token, channel_id)) => {
            let sink = DiscordChannelSink::new(token, channel_id)?;
            info!("Relaying console output to Discord channel {} ({})", channel_id, sink.endpoint());
            Ok(Arc::new(sink))
        }
        None => {
            info!("No Discord channel configured, relaying console output to stdout");
            Ok(Arc::new(StdoutSink))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(args.log_level, args.log_file);
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = RelayConfig::from_env()?.with_overrides(ConfigOverrides {
        server_dir: args.server_dir,
        launch_command: args.launch_command,
        rcon_host: args.rcon_host,
        rcon_port: args.rcon_port,
        settle_delay_secs: args.settle_delay,
        channel_id: args.channel_id,
    });
    config.validate()?;

    info!(
        "Starting console relay for {} (RCON at {}:{})",
        config.server.working_directory.display(),
        config.rcon.host,
        config.rcon.port
    );

    let supervisor = Arc::new(ProcessSupervisor::new(config.server.clone()));
    let rcon_client = RconClient::new(&config.rcon);
    info!("RCON client targets {}", rcon_client.address());
    let remote: Arc<dyn RemoteConsole> = Arc::new(rcon_client);
    let sink = create_sink(&config)?;

    let (writer, reader) = output_queue(config.reader.queue_capacity);
    let queue_stats = reader.stats();
    let output_reader = OutputReader::new(Arc::clone(&supervisor), writer, config.reader);
    let output_relay = OutputRelay::new(supervisor.clone(), reader, sink, config.batch);
    let reader_task = tokio::spawn(output_reader.run());
    let relay_task = tokio::spawn(output_relay.run());

    let gateway = Arc::new(CommandGateway::new(
        Arc::clone(&supervisor),
        Arc::clone(&remote),
        &config.rcon,
    ));
    let console = AdminConsole::new(Arc::clone(&gateway), queue_stats);

    info!("Console relay ready, type `help` for commands");

    let lines = console::spawn_line_reader(std::io::stdin());
    tokio::select! {
        result = console.run(lines, stdout()) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    if let Some(pid) = supervisor.pid() {
        info!("Stopping server PID {} before exit", pid);
        let caller = Caller::new(console::CONSOLE_CALLER);
        tokio::select! {
            result = gateway.stop_server(&caller) => {
                if let Err(e) = result {
                    warn!("Failed to stop server cleanly: {}", e);
                }
            }
            // Dropping the supervisor force kills whatever is left
            _ = tokio::signal::ctrl_c() => warn!("Interrupted again, abandoning graceful stop"),
        }
    }

    reader_task.abort();
    relay_task.abort();
    info!("Console relay shutdown");

    Ok(())
}
