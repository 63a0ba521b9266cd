//! Byte transport to the gateway
//!
//! The session only needs an append-only byte source and sink. Reads never
//! block: an empty read means nothing has arrived yet. Connecting never
//! blocks either: a connect may come back [`ConnectStatus::Pending`] and is
//! then finished through [`Transport::poll_connect`].

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 4096;

/// Outcome of starting a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    /// Still in flight; see [`Transport::poll_connect`]
    Pending,
}

pub trait Transport: Send {
    fn connect(&mut self) -> io::Result<ConnectStatus>;

    /// Result of a pending connect once it has finished, `None` while it is
    /// still in flight or when nothing is pending
    fn poll_connect(&mut self) -> Option<io::Result<()>>;

    /// Close the connection, abandoning a pending connect
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Everything received since the last call; empty when nothing arrived.
    /// An error means the connection is gone.
    fn read(&mut self) -> io::Result<Vec<u8>>;

    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

fn not_connected() -> io::Error {
    io::Error::new(ErrorKind::NotConnected, "transport not connected")
}

type ConnectResult = io::Result<(SocketAddr, TcpStream)>;

/// Non-blocking TCP connection. Resolving and connecting run on a short-lived
/// `gateway-connect` thread so the caller's loop keeps ticking.
pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    pending: Option<Receiver<ConnectResult>>,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            stream: None,
            pending: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn is_connecting(&self) -> bool {
        self.pending.is_some()
    }
}

fn open_stream(address: &str, timeout: Duration) -> ConnectResult {
    let addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "address did not resolve"))?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    Ok((addr, stream))
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> io::Result<ConnectStatus> {
        self.disconnect();

        let (tx, rx) = bounded(1);
        let address = self.address.clone();
        let timeout = self.connect_timeout;
        std::thread::Builder::new()
            .name("gateway-connect".to_string())
            .spawn(move || {
                // Nobody is waiting any more if the connect was abandoned
                let _ = tx.send(open_stream(&address, timeout));
            })?;

        debug!(address = %self.address, timeout_ms = timeout.as_millis() as u64, "Connecting to gateway");
        self.pending = Some(rx);
        Ok(ConnectStatus::Pending)
    }

    fn poll_connect(&mut self) -> Option<io::Result<()>> {
        let result = match self.pending.as_ref()?.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => Err(io::Error::new(
                ErrorKind::Other,
                "connect thread exited without a result",
            )),
        };
        self.pending = None;

        Some(result.map(|(addr, stream)| {
            info!(%addr, "Connected to gateway");
            self.stream = Some(stream);
        }))
    }

    fn disconnect(&mut self) {
        if self.pending.take().is_some() {
            debug!(address = %self.address, "Abandoned pending connect");
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            info!(address = %self.address, "Disconnected from gateway");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn read(&mut self) -> io::Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        let mut received = Vec::new();
        let mut buf = [0u8; READ_CHUNK];

        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.stream = None;
                    return Err(io::Error::new(ErrorKind::UnexpectedEof, "gateway closed connection"));
                }
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stream = None;
                    return Err(e);
                }
            }
        }

        Ok(received)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        let deadline = Instant::now() + WRITE_TIMEOUT;
        let mut remaining = bytes;

        while !remaining.is_empty() {
            match stream.write(remaining) {
                Ok(0) => {
                    self.stream = None;
                    return Err(io::Error::new(ErrorKind::WriteZero, "gateway closed connection"));
                }
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(ErrorKind::TimedOut, "write timed out"));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stream = None;
                    return Err(e);
                }
            }
        }

        debug!(bytes = bytes.len(), "Wrote to gateway");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryLink {
    connected: bool,
    /// A connect is waiting for the peer to accept
    connecting: bool,
    hold: bool,
    /// Gateway hung up; surfaced on the next read or write
    peer_closed: bool,
    refuse: bool,
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    connects: u32,
}

impl MemoryLink {
    fn check_open(&mut self) -> io::Result<()> {
        if !self.connected {
            return Err(not_connected());
        }
        if self.peer_closed {
            self.connected = false;
            self.inbound.clear();
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "peer hung up"));
        }
        Ok(())
    }
}

/// In-process transport. The paired [`MemoryPeer`] plays the gateway.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    link: Arc<Mutex<MemoryLink>>,
}

/// Gateway side of a [`MemoryTransport`]
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    link: Arc<Mutex<MemoryLink>>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryPeer) {
        let transport = Self::default();
        let peer = MemoryPeer {
            link: transport.link.clone(),
        };
        (transport, peer)
    }
}

impl MemoryLink {
    fn establish(&mut self) -> io::Result<()> {
        if self.refuse {
            return Err(io::Error::new(ErrorKind::ConnectionRefused, "peer refused"));
        }
        self.connected = true;
        self.peer_closed = false;
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn connect(&mut self) -> io::Result<ConnectStatus> {
        let mut link = self.link.lock();
        link.connects += 1;
        link.connected = false;
        if link.hold {
            link.connecting = true;
            return Ok(ConnectStatus::Pending);
        }
        link.establish().map(|()| ConnectStatus::Connected)
    }

    fn poll_connect(&mut self) -> Option<io::Result<()>> {
        let mut link = self.link.lock();
        if !link.connecting || link.hold {
            return None;
        }
        link.connecting = false;
        Some(link.establish())
    }

    fn disconnect(&mut self) {
        let mut link = self.link.lock();
        link.connected = false;
        link.connecting = false;
    }

    fn is_connected(&self) -> bool {
        self.link.lock().connected
    }

    fn read(&mut self) -> io::Result<Vec<u8>> {
        let mut link = self.link.lock();
        link.check_open()?;
        Ok(link.inbound.drain(..).collect())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut link = self.link.lock();
        link.check_open()?;
        link.outbound.extend_from_slice(bytes);
        Ok(())
    }
}

impl MemoryPeer {
    /// Queue bytes for the transport's next read
    pub fn send(&self, bytes: &[u8]) {
        self.link.lock().inbound.extend(bytes.iter().copied());
    }

    /// Take everything the transport wrote
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.link.lock().outbound)
    }

    /// Drop the connection from the gateway side
    pub fn hang_up(&self) {
        self.link.lock().peer_closed = true;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.link.lock().refuse = refuse;
    }

    /// Leave connects pending until released
    pub fn hold_connections(&self, hold: bool) {
        self.link.lock().hold = hold;
    }

    /// A connect is waiting on [`hold_connections`](Self::hold_connections)
    pub fn has_pending_connect(&self) -> bool {
        self.link.lock().connecting
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().connected
    }

    pub fn connect_attempts(&self) -> u32 {
        self.link.lock().connects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn finish_connect(transport: &mut TcpTransport) -> io::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(result) = transport.poll_connect() {
                return result;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("connect did not finish");
    }

    #[test]
    fn test_memory_pair() {
        let (mut transport, peer) = MemoryTransport::pair();
        assert!(transport.read().is_err());

        assert_eq!(transport.connect().unwrap(), ConnectStatus::Connected);
        assert!(transport.poll_connect().is_none());
        peer.send(b"abc");
        assert_eq!(transport.read().unwrap(), b"abc");
        assert!(transport.read().unwrap().is_empty());

        transport.write(b"xyz").unwrap();
        assert_eq!(peer.take_written(), b"xyz");

        peer.hang_up();
        assert!(transport.write(b"!").is_err());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_refused_connection() {
        let (mut transport, peer) = MemoryTransport::pair();
        peer.refuse_connections(true);
        assert!(transport.connect().is_err());
        assert!(!transport.is_connected());
        assert_eq!(peer.connect_attempts(), 1);
    }

    #[test]
    fn test_held_connection_completes_on_release() {
        let (mut transport, peer) = MemoryTransport::pair();
        peer.hold_connections(true);
        assert_eq!(transport.connect().unwrap(), ConnectStatus::Pending);
        assert!(transport.poll_connect().is_none());
        assert!(!transport.is_connected());

        peer.hold_connections(false);
        assert!(transport.poll_connect().unwrap().is_ok());
        assert!(transport.is_connected());
        assert!(transport.poll_connect().is_none());
    }

    #[test]
    fn test_disconnect_abandons_held_connection() {
        let (mut transport, peer) = MemoryTransport::pair();
        peer.hold_connections(true);
        transport.connect().unwrap();
        transport.disconnect();
        assert!(!peer.has_pending_connect());

        peer.hold_connections(false);
        assert!(transport.poll_connect().is_none());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_tcp_connect_returns_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut transport = TcpTransport::new(addr.to_string(), Duration::from_millis(750));
        assert_eq!(transport.connect_timeout(), Duration::from_millis(750));
        assert_eq!(transport.connect().unwrap(), ConnectStatus::Pending);
        assert!(transport.is_connecting());
        assert!(!transport.is_connected());

        finish_connect(&mut transport).unwrap();
        assert!(transport.is_connected());
        assert!(!transport.is_connecting());
    }

    #[test]
    fn test_tcp_refused_reported_through_poll() {
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let mut transport = TcpTransport::new(addr.to_string(), Duration::from_secs(1));
        assert_eq!(transport.connect().unwrap(), ConnectStatus::Pending);
        assert!(finish_connect(&mut transport).is_err());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_tcp_disconnect_abandons_pending_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut transport =
            TcpTransport::new(listener.local_addr().unwrap().to_string(), Duration::from_secs(1));
        transport.connect().unwrap();
        transport.disconnect();

        assert!(!transport.is_connecting());
        assert!(transport.poll_connect().is_none());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut transport = TcpTransport::new(addr.to_string(), Duration::from_secs(1));
        transport.connect().unwrap();
        finish_connect(&mut transport).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        transport.write(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut received = Vec::new();
        while received.len() < 4 && Instant::now() < deadline {
            received.extend(transport.read().unwrap());
        }
        assert_eq!(received, b"pong");

        drop(server);
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut closed = false;
        while !closed && Instant::now() < deadline {
            closed = transport.read().is_err();
        }
        assert!(closed);
        assert!(!transport.is_connected());
    }
}
