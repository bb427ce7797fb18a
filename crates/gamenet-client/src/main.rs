//! Reference client.
//!
//! Connects (reconnecting on loss), logs in or registers first, sends one
//! chat line and prints whatever the server sends back until interrupted.
//!
//! Run with `cargo run -p gamenet-client -- --username alice --password secret`.

mod options;

use clap::Parser;
use gamenet_config::{CliArgs, Config};
use gamenet_net::{ClientEvent, GameData, MessageType, ReconnectingClient};
use tracing::{info, warn};

/// Command-line arguments for the reference client.
#[derive(Parser, Debug)]
#[command(name = "gamenet-client", about = "Reference client for the gamenet protocol")]
struct Cli {
    #[command(flatten)]
    common: CliArgs,

    /// Account name.
    #[arg(long)]
    username: String,

    /// Account password.
    #[arg(long)]
    password: String,

    /// Create the account before logging in.
    #[arg(long)]
    register: bool,

    /// Chat line sent after login.
    #[arg(long, default_value = "hello")]
    message: String,
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
    let options = options::client_options(&config.client)?;
    let policy = options::reconnect_config(&config.client);
    let reconnect_enabled = policy.enabled;

    let (client, mut events) = ReconnectingClient::new(options, policy);
    if let Err(e) = client.start().await {
        if !reconnect_enabled {
            return Err(e.to_string());
        }
        warn!("First connect failed: {e}");
    }

    let mut registered = !cli.register;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                let result = match event {
                    ClientEvent::Connected if registered => {
                        client.client().login(&cli.username, &cli.password).await
                    }
                    ClientEvent::Connected => {
                        client.client().register(&cli.username, &cli.password, "", "").await
                    }
                    ClientEvent::RegistrationComplete { message } => {
                        info!("Registered: {message}");
                        registered = true;
                        client.client().login(&cli.username, &cli.password).await
                    }
                    ClientEvent::RegistrationFail { message } => {
                        warn!("Registration refused: {message}, trying to log in anyway");
                        registered = true;
                        client.client().login(&cli.username, &cli.password).await
                    }
                    ClientEvent::AuthComplete { message } => {
                        info!("Logged in: {message}");
                        let chat = GameData::chat(&cli.message).encode();
                        client.client().send_data(MessageType::Data, &chat).await
                    }
                    ClientEvent::AuthFail { message } => {
                        return Err(format!("login refused: {message}"));
                    }
                    ClientEvent::DataReceived { message_type: MessageType::Data, payload } => {
                        let data = GameData::decode(&payload);
                        match data.text() {
                            Some(text) => info!("Server: {text}"),
                            None => info!("Server sent {:?} ({} bytes)", data.data_type, data.body.len()),
                        }
                        Ok(())
                    }
                    ClientEvent::DataReceived { message_type, .. } => {
                        tracing::trace!("Ignoring {message_type:?} frame");
                        Ok(())
                    }
                    ClientEvent::Disconnected { reason } => {
                        info!("Disconnected: {reason}");
                        Ok(())
                    }
                    ClientEvent::ConnectFail { reason, retrying: true } => {
                        warn!("Connect failed: {reason}, retrying");
                        Ok(())
                    }
                    ClientEvent::ConnectFail { reason, retrying: false } => {
                        return Err(format!("giving up: {reason}"));
                    }
                };
                if let Err(e) = result {
                    warn!("Send failed: {e}");
                }
            }
        }
    }

    client.stop().await;
    Ok(())
}
