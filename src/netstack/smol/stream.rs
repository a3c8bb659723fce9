//! Async byte stream over a virtual TCP socket.
//!
//! [`VirtualTcpStream`] implements `AsyncRead + AsyncWrite` so it can be
//! boxed as a [`StreamDyn`](crate::transport::StreamDyn) and relayed like
//! any host `TcpStream`. Data moves through channels owned by the event
//! loop; writes are bounded by the outbound channel, reads by the inbound
//! one.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::PollSender;

/// Channel capacity in each direction.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Largest chunk handed to the event loop by one write.
const MAX_WRITE_CHUNK: usize = 16 * 1024;

/// Messages sent from a [`VirtualTcpStream`] to the event loop.
#[derive(Debug)]
pub enum StreamMessage {
    /// Application data for the socket's send buffer.
    Data(Bytes),
    /// Half-close: send FIN once queued data is out.
    Close,
}

/// Event-loop ends of a stream's channels.
#[derive(Debug)]
pub struct StreamChannels {
    /// Received data to the stream; an empty `Bytes` marks EOF.
    pub inbound_tx: mpsc::Sender<Bytes>,
    /// Writes from the stream.
    pub outbound_rx: mpsc::Receiver<StreamMessage>,
}

/// A connected TCP stream inside the virtual stack.
pub struct VirtualTcpStream {
    outbound: PollSender<StreamMessage>,
    inbound: mpsc::Receiver<Bytes>,
    read_buf: BytesMut,
    eof: bool,
    shutdown: bool,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    wake: Arc<Notify>,
}

impl VirtualTcpStream {
    /// Create a stream and the channel ends the event loop keeps.
    pub fn new_pair(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        wake: Arc<Notify>,
    ) -> (Self, StreamChannels) {
        let (inbound_tx, inbound) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let stream = VirtualTcpStream {
            outbound: PollSender::new(outbound_tx),
            inbound,
            read_buf: BytesMut::new(),
            eof: false,
            shutdown: false,
            local_addr,
            peer_addr,
            wake,
        };
        let channels = StreamChannels {
            inbound_tx,
            outbound_rx,
        };
        (stream, channels)
    }

    /// Local address inside the virtual stack.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "virtual stack closed the stream")
}

impl AsyncRead for VirtualTcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf.split_to(n));
            return Poll::Ready(Ok(()));
        }
        if self.eof {
            return Poll::Ready(Ok(()));
        }

        match ready!(self.inbound.poll_recv(cx)) {
            Some(data) if !data.is_empty() => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf.extend_from_slice(&data[n..]);
                }
                // a slot was freed, let the loop refill it
                self.wake.notify_one();
                Poll::Ready(Ok(()))
            }
            _ => {
                self.eof = true;
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl AsyncWrite for VirtualTcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shutdown {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(self.outbound.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        let n = buf.len().min(MAX_WRITE_CHUNK);
        self.outbound
            .send_item(StreamMessage::Data(Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| broken_pipe())?;
        self.wake.notify_one();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shutdown {
            return Poll::Ready(Ok(()));
        }
        ready!(self.outbound.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        self.outbound
            .send_item(StreamMessage::Close)
            .map_err(|_| broken_pipe())?;
        self.shutdown = true;
        self.wake.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for VirtualTcpStream {
    fn drop(&mut self) {
        self.outbound.close();
        self.wake.notify_one();
    }
}

impl fmt::Debug for VirtualTcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTcpStream")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("buffered", &self.read_buf.len())
            .field("shutdown", &self.shutdown)
            .finish()
    }
}
