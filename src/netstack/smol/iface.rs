//! smoltcp interface and socket bookkeeping.
//!
//! [`StackCore`] owns the smoltcp [`Interface`], its [`SocketSet`] and the
//! [`PacketDevice`]. It is driven exclusively by the event loop task, so
//! nothing here is shared or locked.

use super::device::PacketDevice;
use crate::config::StackConfig;
use crate::error::StackError;
use bytes::Bytes;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tracing::{debug, trace};

/// TCP socket receive buffer size.
const TCP_RX_BUF_SIZE: usize = 65536;

/// TCP socket transmit buffer size.
const TCP_TX_BUF_SIZE: usize = 65536;

/// UDP payload buffer size per direction.
const UDP_BUF_SIZE: usize = 65536;

/// UDP packet slots per direction.
const UDP_PACKET_SLOTS: usize = 64;

/// First ephemeral port.
const EPHEMERAL_PORT_START: u16 = 49152;

/// Last ephemeral port.
const EPHEMERAL_PORT_END: u16 = 65535;

/// The smoltcp side of the virtual stack.
pub struct StackCore {
    iface: Interface,
    sockets: SocketSet<'static>,
    device: PacketDevice,
    self_ip: Ipv4Addr,
    next_port: u16,
    tcp_ports: HashSet<u16>,
    udp_ports: HashSet<u16>,
    /// Local port held by each live socket.
    bound: HashMap<SocketHandle, u16>,
}

impl StackCore {
    /// Build the interface with `self_ip/prefix_len` and a default route
    /// so destinations outside the subnet are still emitted on the link.
    pub fn new(config: &StackConfig) -> Result<Self, StackError> {
        let mut device = PacketDevice::new(config.mtu);

        let iface_config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(iface_config, &mut device, Instant::now());

        let cidr = IpCidr::new(IpAddress::Ipv4(config.self_ip), config.prefix_len);
        iface.update_ip_addrs(|addrs| {
            addrs.push(cidr).ok();
        });
        iface
            .routes_mut()
            .add_default_ipv4_route(config.self_ip)
            .map_err(|e| StackError::Socket(format!("failed to add default route: {:?}", e)))?;

        debug!(
            "Virtual stack created: ip={}/{}, mtu={}",
            config.self_ip, config.prefix_len, config.mtu
        );

        Ok(Self {
            iface,
            sockets: SocketSet::new(Vec::new()),
            device,
            self_ip: config.self_ip,
            next_port: EPHEMERAL_PORT_START,
            tcp_ports: HashSet::new(),
            udp_ports: HashSet::new(),
            bound: HashMap::new(),
        })
    }

    /// Address assigned to the interface.
    pub fn self_ip(&self) -> Ipv4Addr {
        self.self_ip
    }

    /// Number of sockets currently in the set.
    pub fn socket_count(&self) -> usize {
        self.bound.len()
    }

    /// Create a TCP socket bound to `local` and start the handshake with
    /// `remote`. A local port of 0 picks an ephemeral port.
    pub fn connect_tcp(
        &mut self,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Result<(SocketHandle, u16), StackError> {
        let port = claim_port(
            &mut self.tcp_ports,
            &mut self.next_port,
            local.port(),
            "tcp",
        )?;

        let rx = tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUF_SIZE]);
        let tx = tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUF_SIZE]);
        let mut socket = tcp::Socket::new(rx, tx);

        let local_endpoint = IpListenEndpoint {
            addr: Some(IpAddress::Ipv4(*local.ip())),
            port,
        };
        let remote_endpoint = (IpAddress::Ipv4(*remote.ip()), remote.port());

        if let Err(e) = socket.connect(self.iface.context(), remote_endpoint, local_endpoint) {
            self.tcp_ports.remove(&port);
            return Err(StackError::Socket(format!(
                "smoltcp connect to {} failed: {:?}",
                remote, e
            )));
        }

        let handle = self.sockets.add(socket);
        self.bound.insert(handle, port);
        debug!(
            "Virtual TCP: connecting {}:{} -> {} (handle={:?})",
            local.ip(),
            port,
            remote,
            handle
        );
        Ok((handle, port))
    }

    /// Create a UDP socket bound to `local`. A port of 0 picks an
    /// ephemeral port.
    pub fn bind_udp(&mut self, local: SocketAddrV4) -> Result<(SocketHandle, u16), StackError> {
        let port = claim_port(
            &mut self.udp_ports,
            &mut self.next_port,
            local.port(),
            "udp",
        )?;

        let rx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0u8; UDP_BUF_SIZE],
        );
        let tx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0u8; UDP_BUF_SIZE],
        );
        let mut socket = udp::Socket::new(rx, tx);

        let endpoint = IpListenEndpoint {
            addr: Some(IpAddress::Ipv4(*local.ip())),
            port,
        };
        if let Err(e) = socket.bind(endpoint) {
            self.udp_ports.remove(&port);
            return Err(StackError::Socket(format!(
                "smoltcp udp bind {}:{} failed: {:?}",
                local.ip(),
                port,
                e
            )));
        }

        let handle = self.sockets.add(socket);
        self.bound.insert(handle, port);
        debug!(
            "Virtual UDP: bound {}:{} (handle={:?})",
            local.ip(),
            port,
            handle
        );
        Ok((handle, port))
    }

    /// Process packets between the device and the sockets.
    pub fn poll(&mut self) {
        let _ = self
            .iface
            .poll(Instant::now(), &mut self.device, &mut self.sockets);
    }

    /// Time until smoltcp next needs a poll, `None` if it has no timers.
    pub fn poll_delay(&mut self) -> Option<Duration> {
        self.iface
            .poll_delay(Instant::now(), &self.sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
    }

    /// Queue an inbound IP packet for the next poll.
    pub fn inject_packet(&mut self, packet: Bytes) {
        self.device.inject_rx(packet);
    }

    /// Take every IP packet produced since the last drain.
    pub fn drain_tx_packets(&mut self) -> Vec<Bytes> {
        self.device.drain_tx().collect()
    }

    /// Whether the three-way handshake has completed.
    pub fn is_tcp_connected(&self, handle: SocketHandle) -> bool {
        self.sockets.get::<tcp::Socket<'_>>(handle).state() == tcp::State::Established
    }

    /// Whether the socket is closed or on its way out.
    pub fn is_tcp_closed(&self, handle: SocketHandle) -> bool {
        matches!(
            self.sockets.get::<tcp::Socket<'_>>(handle).state(),
            tcp::State::Closed | tcp::State::TimeWait
        )
    }

    /// Whether the peer has finished sending and everything was read.
    pub fn tcp_recv_finished(&self, handle: SocketHandle) -> bool {
        let socket = self.sockets.get::<tcp::Socket<'_>>(handle);
        !socket.may_recv()
            && socket.recv_queue() == 0
            && !matches!(socket.state(), tcp::State::SynSent | tcp::State::Listen)
    }

    /// Write into the socket's send buffer; returns bytes accepted.
    pub fn tcp_send(&mut self, handle: SocketHandle, data: &[u8]) -> Result<usize, StackError> {
        let socket = self.sockets.get_mut::<tcp::Socket<'_>>(handle);
        if !socket.may_send() {
            return Err(StackError::Socket(format!(
                "TCP socket not ready to send (state={})",
                state_name(socket.state())
            )));
        }
        let n = socket
            .send_slice(data)
            .map_err(|e| StackError::Socket(format!("smoltcp send_slice failed: {:?}", e)))?;
        trace!("tcp_send: {} bytes to {:?}", n, handle);
        Ok(n)
    }

    /// Read from the socket's receive buffer; returns bytes read.
    pub fn tcp_recv(&mut self, handle: SocketHandle, buf: &mut [u8]) -> usize {
        let socket = self.sockets.get_mut::<tcp::Socket<'_>>(handle);
        if !socket.can_recv() {
            return 0;
        }
        match socket.recv_slice(buf) {
            Ok(n) => {
                trace!("tcp_recv: {} bytes from {:?}", n, handle);
                n
            }
            Err(e) => {
                trace!("tcp_recv error for {:?}: {:?}", handle, e);
                0
            }
        }
    }

    /// Graceful close (FIN).
    pub fn close_tcp(&mut self, handle: SocketHandle) {
        let socket = self.sockets.get_mut::<tcp::Socket<'_>>(handle);
        debug!(
            "Closing virtual TCP socket {:?} (state={})",
            handle,
            state_name(socket.state())
        );
        socket.close();
    }

    /// Abortive close (RST on the next poll).
    pub fn abort_tcp(&mut self, handle: SocketHandle) {
        debug!("Aborting virtual TCP socket {:?}", handle);
        self.sockets.get_mut::<tcp::Socket<'_>>(handle).abort();
    }

    /// Remove a TCP socket and release its port.
    pub fn remove_tcp(&mut self, handle: SocketHandle) {
        self.sockets.remove(handle);
        if let Some(port) = self.bound.remove(&handle) {
            self.tcp_ports.remove(&port);
        }
    }

    /// Current state of a TCP socket, for logs and errors.
    pub fn tcp_state_str(&self, handle: SocketHandle) -> &'static str {
        state_name(self.sockets.get::<tcp::Socket<'_>>(handle).state())
    }

    /// Queue one datagram to `remote`. `Ok(false)` means the send buffer
    /// is full and the datagram should be retried later.
    pub fn udp_send(
        &mut self,
        handle: SocketHandle,
        data: &[u8],
        remote: SocketAddrV4,
    ) -> Result<bool, StackError> {
        let socket = self.sockets.get_mut::<udp::Socket<'_>>(handle);
        let endpoint = IpEndpoint::new(IpAddress::Ipv4(*remote.ip()), remote.port());
        match socket.send_slice(data, endpoint) {
            Ok(()) => Ok(true),
            Err(udp::SendError::BufferFull) => Ok(false),
            Err(e) => Err(StackError::Socket(format!(
                "smoltcp udp send to {} failed: {:?}",
                remote, e
            ))),
        }
    }

    /// Pop one received datagram and its source.
    pub fn udp_recv(&mut self, handle: SocketHandle) -> Option<(Bytes, SocketAddr)> {
        let socket = self.sockets.get_mut::<udp::Socket<'_>>(handle);
        let (data, meta) = socket.recv().ok()?;
        let from = match meta.endpoint.addr {
            IpAddress::Ipv4(ip) => SocketAddr::from((ip, meta.endpoint.port)),
        };
        Some((Bytes::copy_from_slice(data), from))
    }

    /// Close and remove a UDP socket, releasing its port.
    pub fn remove_udp(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<udp::Socket<'_>>(handle).close();
        self.sockets.remove(handle);
        if let Some(port) = self.bound.remove(&handle) {
            self.udp_ports.remove(&port);
            debug!("Virtual UDP socket {:?} on port {} removed", handle, port);
        }
    }
}

/// Reserve `requested`, or the next free ephemeral port when it is 0.
fn claim_port(
    used: &mut HashSet<u16>,
    next_port: &mut u16,
    requested: u16,
    proto: &str,
) -> Result<u16, StackError> {
    if requested != 0 {
        if !used.insert(requested) {
            return Err(StackError::Socket(format!(
                "{} port {} already in use",
                proto, requested
            )));
        }
        return Ok(requested);
    }

    let range = usize::from(EPHEMERAL_PORT_END - EPHEMERAL_PORT_START) + 1;
    for _ in 0..range {
        let port = *next_port;
        *next_port = if port == EPHEMERAL_PORT_END {
            EPHEMERAL_PORT_START
        } else {
            port + 1
        };
        if used.insert(port) {
            return Ok(port);
        }
    }
    Err(StackError::Socket(format!(
        "no free ephemeral {} port",
        proto
    )))
}

fn state_name(state: tcp::State) -> &'static str {
    match state {
        tcp::State::Closed => "Closed",
        tcp::State::Listen => "Listen",
        tcp::State::SynSent => "SynSent",
        tcp::State::SynReceived => "SynReceived",
        tcp::State::Established => "Established",
        tcp::State::FinWait1 => "FinWait1",
        tcp::State::FinWait2 => "FinWait2",
        tcp::State::CloseWait => "CloseWait",
        tcp::State::Closing => "Closing",
        tcp::State::LastAck => "LastAck",
        tcp::State::TimeWait => "TimeWait",
    }
}

impl std::fmt::Debug for StackCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackCore")
            .field("self_ip", &self.self_ip)
            .field("next_port", &self.next_port)
            .field("sockets", &self.socket_count())
            .field("device", &self.device)
            .finish()
    }
}
