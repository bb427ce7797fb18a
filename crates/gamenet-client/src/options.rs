//! Mapping from persisted settings to the client's options.

use gamenet_config::ClientConfig;
use gamenet_net::{ClientOptions, ClientTls, ReconnectConfig};

/// Build [`ClientOptions`] from the `client` config section.
pub fn client_options(config: &ClientConfig) -> Result<ClientOptions, String> {
    let tls = &config.tls;
    let tls = if !tls.enabled {
        ClientTls::Disabled
    } else if tls.accept_invalid_certs_for_testing {
        ClientTls::DangerousAcceptAnyCertificate {
            server_name: tls.server_name.clone(),
        }
    } else if tls.ca_path.is_some() {
        ClientTls::Verified {
            server_name: tls.server_name.clone(),
            ca_file: tls.ca_path.clone(),
        }
    } else {
        return Err("TLS enabled without ca_path".to_string());
    };

    Ok(ClientOptions {
        host: config.host.clone(),
        port: config.port,
        tls,
        heartbeat_interval: config.heartbeat_interval(),
        connect_timeout: config.connect_timeout(),
        ..ClientOptions::default()
    })
}

/// Build the reconnect policy from the `client.reconnect` section.
pub fn reconnect_config(config: &ClientConfig) -> ReconnectConfig {
    let reconnect = &config.reconnect;
    ReconnectConfig {
        enabled: reconnect.enabled,
        disconnect_delay: reconnect.disconnect_delay(),
        connect_fail_delay: reconnect.connect_fail_delay(),
        max_retries: reconnect.max_retries,
    }
}
