//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration shared by the server and client binaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Server settings.
    pub server: ServerConfig,
    /// Client settings.
    pub client: ClientConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to listen on.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// TLS settings.
    pub tls: ServerTlsConfig,
    /// Seconds between pings to each client.
    pub heartbeat_interval_secs: u64,
    /// Extra seconds of silence tolerated before a client is dropped.
    pub heartbeat_timeout_secs: u64,
    /// Seconds allowed for a TLS handshake.
    pub handshake_timeout_secs: u64,
    /// Seconds a half-received transfer may sit idle.
    pub reassembly_timeout_secs: u64,
}

/// Server TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerTlsConfig {
    /// Wrap connections in TLS.
    pub enabled: bool,
    /// PEM certificate chain.
    pub cert_path: Option<PathBuf>,
    /// PEM private key.
    pub key_path: Option<PathBuf>,
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// TLS settings.
    pub tls: ClientTlsConfig,
    /// Seconds between pings to the server.
    pub heartbeat_interval_secs: u64,
    /// Seconds allowed for connect plus TLS handshake.
    pub connect_timeout_secs: u64,
    /// Automatic reconnection.
    pub reconnect: ReconnectSettings,
}

/// Client TLS configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientTlsConfig {
    /// Wrap the connection in TLS.
    pub enabled: bool,
    /// Name expected on the server certificate.
    pub server_name: String,
    /// PEM file with the CA certificates to trust.
    pub ca_path: Option<PathBuf>,
    /// Skip certificate validation entirely. Local testing only.
    pub accept_invalid_certs_for_testing: bool,
}

/// Client reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Reconnect automatically.
    pub enabled: bool,
    /// Seconds to wait after losing a live connection.
    pub disconnect_delay_secs: u64,
    /// Seconds to wait after a failed connect.
    pub connect_fail_delay_secs: u64,
    /// Attempts before giving up.
    pub max_retries: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for the JSON log file. No file logging when unset.
    pub dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9000,
            max_connections: 256,
            tls: ServerTlsConfig::default(),
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 15,
            handshake_timeout_secs: 10,
            reassembly_timeout_secs: 60,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            tls: ClientTlsConfig::default(),
            heartbeat_interval_secs: 30,
            connect_timeout_secs: 10,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl Default for ClientTlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_name: "localhost".to_string(),
            ca_path: None,
            accept_invalid_certs_for_testing: false,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            disconnect_delay_secs: 5,
            connect_fail_delay_secs: 10,
            max_retries: 10,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info,rustls=warn".to_string(),
            dir: None,
        }
    }
}

// --- Duration accessors ---

impl ServerConfig {
    /// Ping interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Grace on top of the ping interval.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// TLS handshake limit.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Idle limit for partial transfers.
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }
}

impl ClientConfig {
    /// Ping interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Connect plus handshake limit.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ReconnectSettings {
    /// Delay after a dropped connection.
    pub fn disconnect_delay(&self) -> Duration {
        Duration::from_secs(self.disconnect_delay_secs)
    }

    /// Delay after a failed connect.
    pub fn connect_fail_delay(&self) -> Duration {
        Duration::from_secs(self.connect_fail_delay_secs)
    }
}

// --- Load / Save / Reload / Validate ---

impl Config {
    /// Platform config directory for this application, falling back to the
    /// working directory.
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gamenet")
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject settings the network layer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tls = &self.server.tls;
        if tls.enabled && (tls.cert_path.is_none() || tls.key_path.is_none()) {
            return Err(ConfigError::Invalid(
                "server TLS needs both cert_path and key_path".to_string(),
            ));
        }
        if self.server.heartbeat_interval_secs == 0 || self.client.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be at least one second".to_string(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be positive".to_string(),
            ));
        }
        let client_tls = &self.client.tls;
        if client_tls.enabled
            && !client_tls.accept_invalid_certs_for_testing
            && client_tls.ca_path.is_none()
        {
            return Err(ConfigError::Invalid(
                "client TLS needs ca_path unless accept_invalid_certs_for_testing is set"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("port: 9000"));
        assert!(ron_str.contains("\"localhost\""));
    }

    #[test]
    fn test_defaults_match_protocol_defaults() {
        let config = Config::default();
        assert_eq!(config.server.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.server.heartbeat_timeout(), Duration::from_secs(15));
        assert_eq!(config.client.reconnect.disconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.client.reconnect.connect_fail_delay(), Duration::from_secs(10));
        assert_eq!(config.client.reconnect.max_retries, 10);
        assert!(!config.client.tls.accept_invalid_certs_for_testing);
        assert_eq!(config.log.level, "info,rustls=warn");
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.server.tls.cert_path = Some(PathBuf::from("certs/server.pem"));
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(server: (port: 7000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.max_connections, 256);
        assert_eq!(config.client, ClientConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.client.host = "10.0.0.1".to_string();
        config.log.dir = Some(PathBuf::from("logs"));

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.server.port = 9100;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert_eq!(result.map(|c| c.server.port), Some(9100));
        assert!(config.reload(dir.path()).unwrap().is_some());
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.server.tls.enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.server.tls.cert_path = Some(PathBuf::from("cert.pem"));
        config.server.tls.key_path = Some(PathBuf::from("key.pem"));
        assert!(config.validate().is_ok());

        config.client.tls.enabled = true;
        assert!(config.validate().is_err());
        config.client.tls.accept_invalid_certs_for_testing = true;
        assert!(config.validate().is_ok());
    }
}
