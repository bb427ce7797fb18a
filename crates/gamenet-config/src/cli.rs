//! Command-line overrides shared by the server and client binaries.

use std::path::PathBuf;

use clap::Args;

use crate::Config;

/// Common command-line arguments.
///
/// CLI values override settings loaded from `config.ron`. Binaries embed
/// this with `#[command(flatten)]`.
#[derive(Args, Debug, Default, Clone, PartialEq)]
pub struct CliArgs {
    /// Server host to connect to (client).
    #[arg(long)]
    pub host: Option<String>,

    /// Interface to listen on (server).
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on or connect to.
    #[arg(long)]
    pub port: Option<u16>,

    /// Enable or disable TLS.
    #[arg(long)]
    pub tls: Option<bool>,

    /// PEM certificate chain (server).
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key (server).
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// PEM CA bundle to trust (client).
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Log filter (e.g. info, debug, "info,gamenet_net=trace").
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for the JSON log file.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// Directory to load `config.ron` from.
    pub fn config_dir(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_dir)
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref host) = args.host {
            self.client.host = host.clone();
        }
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
            self.client.port = port;
        }
        if let Some(tls) = args.tls {
            self.server.tls.enabled = tls;
            self.client.tls.enabled = tls;
        }
        if let Some(ref cert) = args.cert {
            self.server.tls.cert_path = Some(cert.clone());
        }
        if let Some(ref key) = args.key {
            self.server.tls.key_path = Some(key.clone());
        }
        if let Some(ref ca) = args.ca {
            self.client.tls.ca_path = Some(ca.clone());
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
        if let Some(ref dir) = args.log_dir {
            self.log.dir = Some(dir.clone());
        }
    }
}
