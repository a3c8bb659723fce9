//! # Socksroute - SOCKS5 endpoint with a routing dialer
//!
//! Socksroute serves SOCKS5 clients and decides, per request, whether the
//! destination is dialled through the host network stack or through a
//! userspace TCP/IP stack bound to a fixed virtual address.
//!
//! ## Routing
//!
//! - Literal IPv4 host over `tcp` or `udp`: proxied through the virtual stack
//! - IPv6 targets, domain names and every other network: direct
//! - A target with an unparseable port: rejected before any dial
//!
//! ## Usage
//!
//! ```rust,ignore
//! use socksroute::config::load_config;
//! use socksroute::dialer::{DirectDialer, RoutingDialer};
//! use socksroute::netstack::{NicId, PacketLink, SmolStack};
//! use socksroute::socks::Socks5Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let link = PacketLink::udp(&config.stack.link).await?;
//!     let stack = SmolStack::start(&config.stack, link)?;
//!     let dialer = RoutingDialer::new(
//!         Arc::new(stack),
//!         config.stack.self_ip,
//!         NicId(config.stack.nic_id),
//!         DirectDialer::default(),
//!     );
//!     let server = Socks5Server::new(config.socks.clone(), Arc::new(dialer));
//!     server.listen_and_serve(&config.socks.listen_addr).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 Client -> Socks5Server -> RoutingDialer -+-> host stack -> Target
//!                                                 +-> SmolStack -> PacketLink -> Tunnel
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod dialer;
pub mod error;
pub mod netstack;
pub mod socks;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use dialer::{Dialer, DirectDialer, Network, RoutingDialer};
pub use error::{DialError, Error, Socks5Error, StackError};
pub use socks::Socks5Server;

/// Version of the Socksroute library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
