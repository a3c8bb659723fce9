//! Event loop driving the virtual stack.
//!
//! One task owns the [`StackCore`] and the [`PacketLink`]. It wakes on an
//! inbound packet, a dial request, socket activity (via a shared
//! [`Notify`]) or the smoltcp poll deadline, then runs one pipeline step:
//! move queued writes into sockets, poll, flush packets to the link,
//! deliver received data, settle pending handshakes and reap dead sockets.

use super::datagram::{DatagramChannels, VirtualUdpSocket};
use super::iface::StackCore;
use super::stream::{StreamChannels, StreamMessage, VirtualTcpStream};
use crate::error::StackError;
use crate::netstack::PacketLink;
use bytes::Bytes;
use smoltcp::iface::SocketHandle;
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

/// Maximum number of concurrent virtual sockets.
pub const MAX_SOCKETS: usize = 1024;

/// Size of the dial request channel.
pub const REQUEST_CHANNEL_SIZE: usize = 64;

/// Upper bound on the sleep between two polls.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Size of the buffer for reading from smoltcp TCP sockets.
const RECV_BUF_SIZE: usize = 16 * 1024;

/// A request served by the event loop.
#[derive(Debug)]
pub enum StackRequest {
    /// Open a TCP connection from `local` to `remote`.
    DialTcp {
        local: SocketAddrV4,
        remote: SocketAddrV4,
        response: oneshot::Sender<Result<VirtualTcpStream, StackError>>,
    },
    /// Bind a UDP socket to `local` and connect it to `remote`.
    DialUdp {
        local: SocketAddrV4,
        remote: SocketAddrV4,
        response: oneshot::Sender<Result<VirtualUdpSocket, StackError>>,
    },
}

/// A TCP socket waiting for its handshake.
struct PendingConnect {
    handle: SocketHandle,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    response: oneshot::Sender<Result<VirtualTcpStream, StackError>>,
    deadline: Instant,
}

/// An established TCP socket and its stream channels.
struct TcpEntry {
    channels: StreamChannels,
    pending_write: Option<Bytes>,
    closing: bool,
    detached: bool,
    eof_sent: bool,
}

/// A bound UDP socket and its channels.
struct UdpEntry {
    channels: DatagramChannels,
    remote: SocketAddrV4,
    pending_send: Option<Bytes>,
    detached: bool,
}

/// State owned by the event loop task.
pub struct EventLoop {
    stack: StackCore,
    link: PacketLink,
    requests: mpsc::Receiver<StackRequest>,
    wake: Arc<Notify>,
    connect_timeout: Duration,
    pending: Vec<PendingConnect>,
    tcp: HashMap<SocketHandle, TcpEntry>,
    udp: HashMap<SocketHandle, UdpEntry>,
    reap: Vec<SocketHandle>,
    accepting: bool,
}

impl EventLoop {
    pub fn new(
        stack: StackCore,
        link: PacketLink,
        requests: mpsc::Receiver<StackRequest>,
        wake: Arc<Notify>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            stack,
            link,
            requests,
            wake,
            connect_timeout,
            pending: Vec::new(),
            tcp: HashMap::new(),
            udp: HashMap::new(),
            reap: Vec::new(),
            accepting: true,
        }
    }

    /// Run until the packet link closes, or until every handle is gone
    /// and no socket is left.
    pub async fn run(mut self) {
        let mut recv_buf = vec![0u8; RECV_BUF_SIZE];
        info!("Virtual stack event loop started on {}", self.stack.self_ip());

        loop {
            if !self.step(&mut recv_buf).await {
                info!("Packet link closed, stopping virtual stack");
                break;
            }
            if !self.accepting && self.is_idle() {
                debug!("Virtual stack released and idle, stopping event loop");
                break;
            }

            let delay = self
                .stack
                .poll_delay()
                .unwrap_or(MAX_POLL_INTERVAL)
                .min(MAX_POLL_INTERVAL);
            let wake = self.wake.clone();

            tokio::select! {
                packet = self.link.inbound.recv() => match packet {
                    Some(packet) => {
                        self.stack.inject_packet(packet);
                        while let Ok(packet) = self.link.inbound.try_recv() {
                            self.stack.inject_packet(packet);
                        }
                    }
                    None => {
                        info!("Packet link closed, stopping virtual stack");
                        break;
                    }
                },
                request = self.requests.recv(), if self.accepting => match request {
                    Some(request) => self.handle_request(request),
                    None => self.accepting = false,
                },
                _ = wake.notified() => {}
                _ = time::sleep(delay) => {}
            }
        }

        self.shutdown();
    }

    /// One pass of the packet pipeline. Returns false once the link's
    /// outbound side is gone.
    async fn step(&mut self, recv_buf: &mut [u8]) -> bool {
        self.pump_writes();
        self.stack.poll();
        if !self.flush_link().await {
            return false;
        }

        self.deliver_reads(recv_buf);
        self.check_pending_connects();
        self.cleanup();

        // acks, window updates, FINs and RSTs produced above
        self.stack.poll();
        let flushed = self.flush_link().await;
        for handle in self.reap.drain(..) {
            self.stack.remove_tcp(handle);
        }
        flushed
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.tcp.is_empty() && self.udp.is_empty()
    }

    fn handle_request(&mut self, request: StackRequest) {
        if self.stack.socket_count() >= MAX_SOCKETS {
            let err = StackError::TooManySockets(MAX_SOCKETS);
            match request {
                StackRequest::DialTcp { response, .. } => {
                    let _ = response.send(Err(err));
                }
                StackRequest::DialUdp { response, .. } => {
                    let _ = response.send(Err(err));
                }
            }
            return;
        }

        match request {
            StackRequest::DialTcp {
                local,
                remote,
                response,
            } => match self.stack.connect_tcp(local, remote) {
                Ok((handle, port)) => {
                    self.pending.push(PendingConnect {
                        handle,
                        local: SocketAddrV4::new(*local.ip(), port),
                        remote,
                        response,
                        deadline: Instant::now() + self.connect_timeout,
                    });
                }
                Err(e) => {
                    let _ = response.send(Err(e));
                }
            },
            StackRequest::DialUdp {
                local,
                remote,
                response,
            } => match self.stack.bind_udp(local) {
                Ok((handle, port)) => {
                    let local = SocketAddr::V4(SocketAddrV4::new(*local.ip(), port));
                    let (socket, channels) =
                        VirtualUdpSocket::new_pair(local, SocketAddr::V4(remote), self.wake.clone());
                    if response.send(Ok(socket)).is_err() {
                        debug!("UDP dial to {} abandoned by caller", remote);
                        self.stack.remove_udp(handle);
                        return;
                    }
                    debug!("Virtual UDP: {} -> {} ready", local, remote);
                    self.udp.insert(
                        handle,
                        UdpEntry {
                            channels,
                            remote,
                            pending_send: None,
                            detached: false,
                        },
                    );
                }
                Err(e) => {
                    let _ = response.send(Err(e));
                }
            },
        }
    }

    /// Move queued writes into smoltcp send buffers, stopping per socket
    /// as soon as its buffer is full.
    fn pump_writes(&mut self) {
        for (&handle, entry) in self.tcp.iter_mut() {
            loop {
                if entry.pending_write.is_none() {
                    match entry.channels.outbound_rx.try_recv() {
                        Ok(StreamMessage::Data(data)) => entry.pending_write = Some(data),
                        Ok(StreamMessage::Close) => {
                            if !entry.closing {
                                self.stack.close_tcp(handle);
                                entry.closing = true;
                            }
                            continue;
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            if !entry.closing {
                                self.stack.close_tcp(handle);
                                entry.closing = true;
                            }
                            entry.detached = true;
                            break;
                        }
                    }
                }

                let Some(data) = entry.pending_write.as_mut() else {
                    continue;
                };
                match self.stack.tcp_send(handle, data) {
                    Ok(n) if n == data.len() => entry.pending_write = None,
                    Ok(n) => {
                        let _ = data.split_to(n);
                        break;
                    }
                    Err(e) => {
                        trace!("Dropping write for {:?}: {}", handle, e);
                        entry.pending_write = None;
                    }
                }
            }
        }

        for (&handle, entry) in self.udp.iter_mut() {
            loop {
                if entry.pending_send.is_none() {
                    match entry.channels.outbound_rx.try_recv() {
                        Ok(data) => entry.pending_send = Some(data),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            entry.detached = true;
                            break;
                        }
                    }
                }

                let Some(data) = entry.pending_send.as_ref() else {
                    continue;
                };
                match self.stack.udp_send(handle, data, entry.remote) {
                    Ok(true) => entry.pending_send = None,
                    Ok(false) => break,
                    Err(e) => {
                        warn!("Dropping datagram to {}: {}", entry.remote, e);
                        entry.pending_send = None;
                    }
                }
            }
        }
    }

    /// Hand packets produced by smoltcp to the link.
    async fn flush_link(&mut self) -> bool {
        for packet in self.stack.drain_tx_packets() {
            if self.link.outbound.send(packet).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Move received data out of smoltcp, only as far as each socket's
    /// channel has room.
    fn deliver_reads(&mut self, recv_buf: &mut [u8]) {
        for (&handle, entry) in self.tcp.iter_mut() {
            if entry.detached {
                // nobody reads any more; keep the window open so the
                // peer can finish
                while self.stack.tcp_recv(handle, recv_buf) > 0 {}
                continue;
            }
            while entry.channels.inbound_tx.capacity() > 0 {
                let n = self.stack.tcp_recv(handle, recv_buf);
                if n == 0 {
                    break;
                }
                let data = Bytes::copy_from_slice(&recv_buf[..n]);
                if entry.channels.inbound_tx.try_send(data).is_err() {
                    break;
                }
            }
            if !entry.eof_sent
                && entry.channels.inbound_tx.capacity() > 0
                && self.stack.tcp_recv_finished(handle)
            {
                let _ = entry.channels.inbound_tx.try_send(Bytes::new());
                entry.eof_sent = true;
            }
        }

        for (&handle, entry) in self.udp.iter_mut() {
            if entry.detached {
                continue;
            }
            while entry.channels.inbound_tx.capacity() > 0 {
                let Some((data, from)) = self.stack.udp_recv(handle) else {
                    break;
                };
                if from != SocketAddr::V4(entry.remote) {
                    trace!("Dropping datagram from {} (connected to {})", from, entry.remote);
                    continue;
                }
                if entry.channels.inbound_tx.try_send(data).is_err() {
                    break;
                }
            }
        }
    }

    /// Resolve handshakes that completed, failed, timed out or were
    /// abandoned by their caller.
    fn check_pending_connects(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.pending.len() {
            let pending = &self.pending[i];
            let outcome = if pending.response.is_closed() {
                Some(Err(StackError::Cancelled))
            } else if self.stack.is_tcp_connected(pending.handle) {
                Some(Ok(()))
            } else if self.stack.is_tcp_closed(pending.handle) {
                Some(Err(StackError::ConnectFailed {
                    addr: pending.remote.to_string(),
                    state: self.stack.tcp_state_str(pending.handle),
                }))
            } else if now >= pending.deadline {
                Some(Err(StackError::ConnectTimeout(pending.remote.to_string())))
            } else {
                None
            };

            let Some(outcome) = outcome else {
                i += 1;
                continue;
            };
            let pending = self.pending.swap_remove(i);

            match outcome {
                Ok(()) => {
                    let (stream, channels) = VirtualTcpStream::new_pair(
                        SocketAddr::V4(pending.local),
                        SocketAddr::V4(pending.remote),
                        self.wake.clone(),
                    );
                    debug!(
                        "Virtual TCP connected: {} -> {} (handle={:?})",
                        pending.local, pending.remote, pending.handle
                    );
                    self.tcp.insert(
                        pending.handle,
                        TcpEntry {
                            channels,
                            pending_write: None,
                            closing: false,
                            detached: false,
                            eof_sent: false,
                        },
                    );
                    // a dropped receiver returns the stream, whose drop
                    // closes the socket on the next pass
                    let _ = pending.response.send(Ok(stream));
                }
                Err(e) => {
                    match &e {
                        StackError::Cancelled => {
                            debug!("Virtual TCP dial to {} abandoned", pending.remote)
                        }
                        _ => warn!("Virtual TCP connect failed: {}", e),
                    }
                    self.stack.abort_tcp(pending.handle);
                    self.reap.push(pending.handle);
                    let _ = pending.response.send(Err(e));
                }
            }
        }
    }

    /// Drop sockets whose lifecycle is over.
    fn cleanup(&mut self) {
        let stack = &mut self.stack;

        self.tcp.retain(|&handle, entry| {
            let done = stack.is_tcp_closed(handle) && (entry.eof_sent || entry.detached);
            if done {
                debug!("Cleaning up closed virtual stream {:?}", handle);
                stack.remove_tcp(handle);
            }
            !done
        });

        self.udp.retain(|&handle, entry| {
            if entry.detached {
                stack.remove_udp(handle);
            }
            !entry.detached
        });
    }

    /// Abort everything still open when the loop exits.
    fn shutdown(&mut self) {
        for pending in self.pending.drain(..) {
            self.stack.abort_tcp(pending.handle);
            let _ = pending.response.send(Err(StackError::Shutdown));
        }
        for (handle, _) in self.tcp.drain() {
            self.stack.abort_tcp(handle);
        }
        self.udp.clear();
        debug!("Virtual stack event loop stopped");
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("stack", &self.stack)
            .field("pending", &self.pending.len())
            .field("tcp", &self.tcp.len())
            .field("udp", &self.udp.len())
            .finish()
    }
}
