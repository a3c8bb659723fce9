//! Configuration module for Socksroute
//!
//! This module provides configuration types and parsing for the endpoint.

mod server;
mod stack;
mod transport;

pub use server::{Config, SocksConfig};
pub use stack::{LinkConfig, StackConfig};
pub use transport::DirectConfig;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config
        .validate()
        .map_err(crate::error::Error::Config)
        .with_context(|| "Invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_minimal_config() {
        let config_str = r#"
[stack]
self_ip = "10.0.0.2"

[stack.link]
peer_addr = "192.0.2.1:4500"
"#;

        let config = parse_config(config_str).unwrap();
        assert_eq!(config.socks.listen_addr, "127.0.0.1:1080");
        assert_eq!(config.stack.self_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.stack.nic_id, 1);
        assert_eq!(config.stack.link.peer_addr, "192.0.2.1:4500");
        assert!(config.direct.nodelay);
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
[socks]
listen_addr = "0.0.0.0:1081"
auth_required = true
username = "user"
password = "pass"
allow_udp = false
dns_resolve = false
request_timeout = 15
udp_idle_timeout = 30

[stack]
self_ip = "172.16.0.9"
nic_id = 3
prefix_len = 16
mtu = 1280
connect_timeout = 5

[stack.link]
local_addr = "0.0.0.0:4501"
peer_addr = "192.0.2.1:4500"

[direct]
nodelay = false
keepalive_secs = 60
keepalive_interval = 15
"#;

        let config = parse_config(config_str).unwrap();
        assert_eq!(config.socks.listen_addr, "0.0.0.0:1081");
        assert!(config.socks.auth_required);
        assert_eq!(config.socks.username, Some("user".to_string()));
        assert!(!config.socks.allow_udp);
        assert!(!config.socks.dns_resolve);
        assert_eq!(config.socks.request_timeout, 15);
        assert_eq!(config.socks.udp_idle_timeout, 30);
        assert_eq!(config.stack.nic_id, 3);
        assert_eq!(config.stack.prefix_len, 16);
        assert_eq!(config.stack.mtu, 1280);
        assert_eq!(config.stack.link.local_addr, "0.0.0.0:4501");
        assert!(!config.direct.nodelay);
        assert_eq!(config.direct.keepalive_secs, 60);
    }

    #[test]
    fn test_parse_config_rejects_missing_credentials() {
        let config_str = r#"
[socks]
auth_required = true

[stack]
self_ip = "10.0.0.2"

[stack.link]
peer_addr = "192.0.2.1:4500"
"#;

        let err = parse_config(config_str).unwrap_err();
        assert!(format!("{:#}", err).contains("credentials"));
    }

    #[test]
    fn test_parse_config_rejects_bad_self_ip() {
        let config_str = r#"
[stack]
self_ip = "not-an-ip"

[stack.link]
peer_addr = "192.0.2.1:4500"
"#;

        assert!(parse_config(config_str).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[stack]\nself_ip = \"10.8.0.2\"\n\n[stack.link]\npeer_addr = \"127.0.0.1:4500\""
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.stack.self_ip, Ipv4Addr::new(10, 8, 0, 2));
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("/nonexistent/socksroute.toml");
        assert!(result.is_err());
    }
}
