//! Reference echo server.
//!
//! Accepts clients, runs the login/register gate against an in-memory
//! account store, and sends every `Data` payload back to the client that
//! sent it. Configuration is loaded from `config.ron` and can be overridden
//! via CLI flags.
//!
//! Run with `cargo run -p gamenet-server -- --port 9000 --user alice:secret`.

mod options;

use std::sync::Arc;

use clap::Parser;
use gamenet_config::{CliArgs, Config};
use gamenet_net::{GameData, GameServer, MemoryAuthService, ServerEvent};
use tracing::{info, warn};

/// Command-line arguments for the echo server.
#[derive(Parser, Debug)]
#[command(name = "gamenet-server", about = "Echo server for the gamenet protocol")]
struct Cli {
    #[command(flatten)]
    common: CliArgs,

    /// Seed an account, as `name:password`. May be repeated.
    #[arg(long = "user", value_name = "NAME:PASSWORD")]
    users: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_dir = cli.common.config_dir();
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&cli.common);

    gamenet_log::init_logging(Some(&config.log));

    if let Err(e) = run(cli, config).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: Config) -> Result<(), String> {
    let options = options::server_options(&config.server)?;

    let mut auth = MemoryAuthService::new();
    for seed in &cli.users {
        let (name, password) = options::parse_seed_user(seed)?;
        auth = auth.with_user(&name, &password);
    }
    info!("Seeded {} account(s)", auth.user_count());

    let (server, mut events) =
        GameServer::new(options, Arc::new(auth)).map_err(|e| e.to_string())?;
    let addr = server.start().await.map_err(|e| e.to_string())?;
    info!("Echo server ready on {addr}");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(ServerEvent::ClientConnected(id)) => {
                    info!("{id} joined ({} online)", server.connection_count());
                }
                Some(ServerEvent::ClientDisconnected { id, reason }) => {
                    info!("{id} left: {reason}");
                }
                Some(ServerEvent::DataReceived { id, message_type, payload }) => {
                    if let Some(text) = GameData::decode(&payload).text() {
                        info!("{id} says {text:?}");
                    }
                    if let Err(e) = server.send(id, message_type, &payload).await {
                        warn!("Echo to {id} failed: {e}");
                    }
                }
                None => break,
            },
        }
    }

    server.stop().await;
    Ok(())
}
