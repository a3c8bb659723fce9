//! Virtual stack configuration
//!
//! Defines the address, interface and packet link settings of the
//! userspace IP stack that proxied connections are dialled through.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Default NIC id (the first NIC created in the stack)
fn default_nic_id() -> u32 {
    1
}

/// Default prefix length of the self address
fn default_prefix_len() -> u8 {
    24
}

/// Default MTU of the virtual interface
fn default_mtu() -> usize {
    1400
}

/// Default virtual TCP handshake timeout in seconds
fn default_connect_timeout() -> u64 {
    10
}

/// Default local address of the packet link socket
fn default_link_local_addr() -> String {
    "0.0.0.0:0".to_string()
}

/// Virtual stack configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StackConfig {
    /// Address of this process inside the virtual network
    pub self_ip: Ipv4Addr,

    /// NIC id every virtual endpoint is bound to
    #[serde(default = "default_nic_id")]
    pub nic_id: u32,

    /// Prefix length of `self_ip`
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Virtual TCP handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Packet link carrying raw IP packets to and from the tunnel
    pub link: LinkConfig,
}

impl StackConfig {
    /// Create a stack configuration with defaults for everything but the
    /// self address and the link
    pub fn new(self_ip: Ipv4Addr, link: LinkConfig) -> Self {
        StackConfig {
            self_ip,
            nic_id: default_nic_id(),
            prefix_len: default_prefix_len(),
            mtu: default_mtu(),
            connect_timeout: default_connect_timeout(),
            link,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.nic_id == 0 {
            return Err("nic_id must be non-zero".to_string());
        }
        if self.prefix_len > 32 {
            return Err(format!("Invalid prefix length: {}", self.prefix_len));
        }
        if !(576..=65535).contains(&self.mtu) {
            return Err(format!("MTU out of range [576, 65535]: {}", self.mtu));
        }
        if self.self_ip.is_unspecified() {
            return Err("self_ip must not be 0.0.0.0".to_string());
        }
        Ok(())
    }
}

/// UDP packet link: one raw IP packet per datagram
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LinkConfig {
    /// Local UDP address to bind
    #[serde(default = "default_link_local_addr")]
    pub local_addr: String,

    /// Tunnel peer address
    pub peer_addr: String,
}
