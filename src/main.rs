use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use nekotun::app::{latency_test, start_tunnel, SessionState};
use nekotun::common::{ByteCounters, ProxyError, DEFAULT_CONNECT_TIMEOUT};
use nekotun::config::{load_config, AppConfig};

#[derive(Parser)]
#[command(name = "nekotun", version, about = "TUN tunnel client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the tunnel on the TUN device
    Run {
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Measure TCP connect latency of every configured server
    Ping {
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// List configured servers
    Servers {
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

impl Command {
    fn config_path(&self) -> &str {
        match self {
            Command::Run { config } | Command::Ping { config } | Command::Servers { config } => config,
        }
    }
}

fn init_tracing(config: &AppConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.command.config_path())?;
    init_tracing(&config);

    match cli.command {
        Command::Run { .. } => run(&config).await,
        Command::Ping { .. } => {
            for result in latency_test::test_all(&config.servers, DEFAULT_CONNECT_TIMEOUT).await {
                match result.error {
                    None => println!("{:<24} {} ms", result.name, result.latency_ms),
                    Some(err) => println!("{:<24} failed: {}", result.name, err),
                }
            }
            Ok(())
        }
        Command::Servers { .. } => {
            for (index, server) in config.servers.iter().enumerate() {
                let marker = if index == config.active_index { "*" } else { " " };
                let note = if server.server_type.supports_tunnel() { "" } else { " (no tunnel support)" };
                println!(
                    "{} [{}] {:<24} {:<12} {}{}",
                    marker,
                    index,
                    server.display_name(),
                    server.server_type,
                    server.server_addr(),
                    note
                );
            }
            Ok(())
        }
    }
}

async fn run(config: &AppConfig) -> Result<()> {
    info!("nekotun starting...");
    let counters = ByteCounters::new();
    let session = match start_tunnel(config, counters.clone()) {
        Ok(session) => session,
        Err(e) => {
            error!(kind = ProxyError::classify(&e).as_str(), error = %e, "failed to start tunnel");
            return Err(e);
        }
    };

    let mut state = session.subscribe();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        }
        _ = state.wait_for(|s| *s == SessionState::Stopped) => {}
    }

    let result = session.stop().await;
    let totals = counters.snapshot();
    info!(sent = totals.sent, received = totals.received, "final traffic counters");
    result
}
