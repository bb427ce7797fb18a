//! Configuration for the gamenet server and client.
//!
//! Settings persist to disk as RON files and can be overridden from the
//! command line via clap. Missing fields fall back to defaults, so older
//! config files keep loading as sections are added.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    ClientConfig, ClientTlsConfig, Config, LogConfig, ReconnectSettings, ServerConfig,
    ServerTlsConfig,
};
pub use error::ConfigError;
