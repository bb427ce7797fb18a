//! Mapping from persisted settings to the network layer's options.

use std::net::{IpAddr, SocketAddr};

use gamenet_config::ServerConfig;
use gamenet_net::{ServerOptions, ServerTls, SessionConfig};

/// Build [`ServerOptions`] from the `server` config section.
///
/// Fails when the bind address is not an IP literal or TLS is enabled
/// without both PEM paths.
pub fn server_options(config: &ServerConfig) -> Result<ServerOptions, String> {
    let ip: IpAddr = config
        .bind_address
        .parse()
        .map_err(|e| format!("invalid bind address {:?}: {e}", config.bind_address))?;

    let tls = if config.tls.enabled {
        match (&config.tls.cert_path, &config.tls.key_path) {
            (Some(cert), Some(key)) => ServerTls::Enabled {
                cert_file: cert.clone(),
                key_file: key.clone(),
            },
            _ => return Err("TLS enabled without cert_path and key_path".to_string()),
        }
    } else {
        ServerTls::Disabled
    };

    Ok(ServerOptions {
        bind_addr: SocketAddr::new(ip, config.port),
        max_connections: config.max_connections,
        tls,
        handshake_timeout: config.handshake_timeout(),
        session: SessionConfig {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            reassembly_timeout: config.reassembly_timeout(),
            ..SessionConfig::default()
        },
    })
}

/// Split a `name:password` seed account.
pub fn parse_seed_user(seed: &str) -> Result<(String, String), String> {
    match seed.split_once(':') {
        Some((name, password)) if !name.is_empty() && !password.is_empty() => {
            Ok((name.to_string(), password.to_string()))
        }
        _ => Err(format!("expected name:password, got {seed:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_defaults_map_onto_server_defaults() {
        let options = server_options(&ServerConfig::default()).unwrap();
        let expected = ServerOptions::default();
        assert_eq!(options.bind_addr, expected.bind_addr);
        assert_eq!(options.max_connections, expected.max_connections);
        assert_eq!(options.tls, ServerTls::Disabled);
        assert_eq!(options.session, expected.session);
        assert_eq!(options.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_ipv6_bind() {
        let config = ServerConfig {
            bind_address: "::1".to_string(),
            port: 7000,
            ..ServerConfig::default()
        };
        let options = server_options(&config).unwrap();
        assert_eq!(options.bind_addr.to_string(), "[::1]:7000");
    }

    #[test]
    fn test_host_name_rejected() {
        let config = ServerConfig {
            bind_address: "localhost".to_string(),
            ..ServerConfig::default()
        };
        assert!(server_options(&config).is_err());
    }

    #[test]
    fn test_tls_needs_both_paths() {
        let mut config = ServerConfig::default();
        config.tls.enabled = true;
        config.tls.cert_path = Some(PathBuf::from("server.pem"));
        assert!(server_options(&config).is_err());

        config.tls.key_path = Some(PathBuf::from("server.key"));
        let options = server_options(&config).unwrap();
        assert_eq!(
            options.tls,
            ServerTls::Enabled {
                cert_file: PathBuf::from("server.pem"),
                key_file: PathBuf::from("server.key"),
            }
        );
    }

    #[test]
    fn test_parse_seed_user() {
        assert_eq!(
            parse_seed_user("alice:secret:with:colons").unwrap(),
            ("alice".to_string(), "secret:with:colons".to_string())
        );
        assert!(parse_seed_user("alice").is_err());
        assert!(parse_seed_user(":pw").is_err());
        assert!(parse_seed_user("alice:").is_err());
    }
}
