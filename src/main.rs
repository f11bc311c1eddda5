use anyhow::Context;
use chanmux_server::ServerConfig;
use chanmux_telemetry::TelemetryConfig;
use clap::Parser;
use tracing::Level;

/// Echo server multiplexing JSON envelopes onto named channels.
#[derive(Debug, Parser)]
#[command(name = "chanmux", version)]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 picks a free port).
    #[arg(long, default_value_t = 9091)]
    port: u16,

    /// Channel to register and echo. Repeat for several.
    #[arg(long = "channel", default_values_t = vec!["dp".to_string()])]
    channels: Vec<String>,

    /// Buffered payloads per channel before the reader waits.
    #[arg(long, default_value_t = 20)]
    queue_capacity: usize,

    /// Buffered error reports per session.
    #[arg(long, default_value_t = 20)]
    error_capacity: usize,

    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            channels: self.channels.clone(),
            queue_capacity: self.queue_capacity,
            error_capacity: self.error_capacity,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    chanmux_telemetry::init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        json: cli.json_logs,
        ..Default::default()
    })?;

    tracing::info!(channels = ?cli.channels, "Starting chanmux echo server");

    let handle = chanmux_server::start(cli.server_config())
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "chanmux ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
