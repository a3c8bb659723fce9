//! Endpoint configuration types
//!
//! Defines the root configuration and the SOCKS5 endpoint settings.

use super::{DirectConfig, StackConfig};
use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// SOCKS5 endpoint configuration
    #[serde(default)]
    pub socks: SocksConfig,

    /// Virtual stack configuration
    pub stack: StackConfig,

    /// Socket options for direct dials
    #[serde(default)]
    pub direct: DirectConfig,
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> Result<(), String> {
        self.socks.validate()?;
        self.stack.validate()?;
        Ok(())
    }
}

/// Default SOCKS5 listen address
fn default_listen_addr() -> String {
    "127.0.0.1:1080".to_string()
}

/// Default DNS resolve setting
fn default_dns_resolve() -> bool {
    true
}

/// Default UDP setting
fn default_allow_udp() -> bool {
    true
}

/// Default request timeout in seconds
fn default_request_timeout() -> u64 {
    10
}

/// Default idle time in seconds before a UDP flow is closed
fn default_udp_idle_timeout() -> u64 {
    120
}

/// SOCKS5 server configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SocksConfig {
    /// Local TCP address the endpoint listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Enable/disable authentication
    #[serde(default)]
    pub auth_required: bool,

    /// Username for SOCKS5 auth
    #[serde(default)]
    pub username: Option<String>,

    /// Password for SOCKS5 auth
    #[serde(default)]
    pub password: Option<String>,

    /// Allow UDP associate command
    #[serde(default = "default_allow_udp")]
    pub allow_udp: bool,

    /// Resolve domain names before handing targets to the dialer
    #[serde(default = "default_dns_resolve")]
    pub dns_resolve: bool,

    /// Dial timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Seconds a UDP ASSOCIATE flow may stay silent before it is closed
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout: u64,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth_required: false,
            username: None,
            password: None,
            allow_udp: default_allow_udp(),
            dns_resolve: default_dns_resolve(),
            request_timeout: default_request_timeout(),
            udp_idle_timeout: default_udp_idle_timeout(),
        }
    }
}

impl SocksConfig {
    /// Check if authentication credentials are configured
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_required && !self.has_credentials() {
            return Err("Authentication required but no credentials configured".to_string());
        }
        if self.request_timeout == 0 {
            return Err("request_timeout must be greater than zero".to_string());
        }
        if self.udp_idle_timeout == 0 {
            return Err("udp_idle_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}
