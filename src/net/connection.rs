//! Per-socket state
//!
//! A `Connection` is owned by exactly one place at a time: the processor
//! driving it, or the pool holding it idle. Moving it between the two is
//! how ownership of the socket changes hands.

use crate::http::tls::TlsSession;
use crate::http::{MessageBuffer, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::time::Instant;
use url::Url;

/// Where outbound connections go; also the pooling key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: u16,
    secure: bool,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Destination {
            host: host.into(),
            port,
            secure,
        }
    }

    /// Build from an `http` or `https` URL
    pub fn from_url(url: &Url) -> io::Result<Self> {
        let secure = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported scheme: {}", other),
                ))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URL has no host"))?;
        let default_port = if secure {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        };
        Ok(Destination::new(
            host.trim_start_matches('[').trim_end_matches(']'),
            url.port().unwrap_or(default_port),
            secure,
        ))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Value for the `Host` header
    pub fn authority(&self) -> String {
        let default_port = if self.secure {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    fn resolve(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("cannot resolve {}", self.host),
                )
            })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{}://{}", scheme, self.authority())
    }
}

/// Life cycle of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Outbound connect still in progress
    Connecting,
    Handshaking,
    Ready,
    /// No more input is accepted; queued output is drained, then closed
    Closing,
}

/// Byte stream under a connection
pub enum Transport {
    Plain(TcpStream),
    Tls(TlsSession),
    Closed,
}

impl Transport {
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        match self {
            Transport::Plain(stream) => Some(stream),
            Transport::Tls(session) => session.get_mut(),
            Transport::Closed => None,
        }
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        match self {
            Transport::Plain(stream) => Some(stream),
            Transport::Tls(session) => session.get_ref(),
            Transport::Closed => None,
        }
    }

    fn shutdown(&mut self) {
        match std::mem::replace(self, Transport::Closed) {
            Transport::Plain(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Transport::Tls(mut session) => session.close(),
            Transport::Closed => {}
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls(session) => session.read(buf),
            Transport::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls(session) => session.write(buf),
            Transport::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Tls(session) => session.flush(),
            Transport::Closed => Ok(()),
        }
    }
}

/// A chunk of queued output
#[derive(Debug)]
pub struct Segment {
    pub data: Bytes,
    /// Close the connection once this segment is written
    pub close: bool,
}

/// Result of draining the write queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything queued was written
    Drained,
    /// The socket stopped accepting bytes
    Blocked,
    /// A segment asked for the connection to be closed
    Close,
}

/// A socket plus everything the engine tracks about it
pub struct Connection {
    token: Token,
    pub(crate) transport: Transport,
    pub(crate) state: SocketState,
    destination: Option<Destination>,
    peer: Option<SocketAddr>,
    last_access: Instant,
    pub(crate) read_buffer: Option<MessageBuffer>,
    pub(crate) writes: VecDeque<Segment>,
    interest: Option<Interest>,
}

impl Connection {
    /// Start a non-blocking connect to `destination`
    ///
    /// The connect completes asynchronously; the socket reports
    /// writable once it is established.
    pub fn connect(token: Token, destination: &Destination) -> io::Result<Self> {
        let addr = destination.resolve()?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let stream = TcpStream::from_std(socket.into());
        tracing::trace!(token = token.0, %destination, "connecting");

        Ok(Connection {
            token,
            transport: Transport::Plain(stream),
            state: SocketState::Connecting,
            destination: Some(destination.clone()),
            peer: Some(addr),
            last_access: Instant::now(),
            read_buffer: None,
            writes: VecDeque::new(),
            interest: None,
        })
    }

    /// Wrap an accepted socket
    pub fn accepted(token: Token, stream: TcpStream, peer: SocketAddr) -> Self {
        Connection {
            token,
            transport: Transport::Plain(stream),
            state: SocketState::Ready,
            destination: None,
            peer: Some(peer),
            last_access: Instant::now(),
            read_buffer: None,
            writes: VecDeque::new(),
            interest: None,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn is_registered(&self) -> bool {
        self.interest.is_some()
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Check whether an outbound connect has finished
    ///
    /// Returns `Ok(false)` while it is still in progress.
    pub(crate) fn finish_connect(&mut self) -> io::Result<bool> {
        let Some(stream) = self.transport.stream() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(addr) => {
                self.peer = Some(addr);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Register or update interest, skipping the syscall if unchanged
    pub(crate) fn set_interest(&mut self, registry: &Registry, interest: Interest) -> io::Result<()> {
        if self.interest == Some(interest) {
            return Ok(());
        }
        let token = self.token;
        let registered = self.interest.is_some();
        let stream = self
            .transport
            .stream_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if registered {
            registry.reregister(stream, token, interest)?;
        } else {
            registry.register(stream, token, interest)?;
        }
        self.interest = Some(interest);
        Ok(())
    }

    /// Remove the socket from the poller
    pub(crate) fn deregister(&mut self, registry: &Registry) {
        if self.interest.take().is_some() {
            if let Some(stream) = self.transport.stream_mut() {
                if let Err(e) = registry.deregister(stream) {
                    tracing::debug!(token = self.token.0, error = %e, "deregister failed");
                }
            }
        }
    }

    /// The interest the current state calls for
    pub(crate) fn desired_interest(&self) -> Interest {
        match self.state {
            SocketState::Connecting => Interest::WRITABLE,
            SocketState::Handshaking => match &self.transport {
                Transport::Tls(session)
                    if session.state() == crate::http::tls::HandshakeState::NeedWrite =>
                {
                    Interest::WRITABLE
                }
                _ => Interest::READABLE,
            },
            SocketState::Ready | SocketState::Closing => {
                if self.writes.is_empty() {
                    Interest::READABLE
                } else {
                    Interest::READABLE | Interest::WRITABLE
                }
            }
        }
    }

    /// Write as much queued output as the socket takes
    pub(crate) fn flush(&mut self) -> io::Result<Flush> {
        while let Some(segment) = self.writes.front_mut() {
            if !segment.data.is_empty() {
                match self.transport.write(&segment.data) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => {
                        segment.data.advance(n);
                        self.last_access = Instant::now();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            if segment.data.is_empty() {
                let close = segment.close;
                self.writes.pop_front();
                if close {
                    return Ok(Flush::Close);
                }
            }
        }
        Ok(Flush::Drained)
    }

    /// Probe an idle socket for peer closure without blocking
    ///
    /// End of stream, an error, or unexpected data all mean the socket
    /// can no longer be reused.
    pub fn probe_closed(&self) -> bool {
        let Some(stream) = self.transport.stream() else {
            return true;
        };
        let mut buf = [0u8; 1];
        match stream.peek(&mut buf) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
            Err(_) => true,
        }
    }

    /// Deregister and shut the socket down
    pub fn close(&mut self, registry: &Registry) {
        self.deregister(registry);
        self.transport.shutdown();
        self.writes.clear();
        self.read_buffer = None;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token.0)
            .field("state", &self.state)
            .field("destination", &self.destination)
            .field("peer", &self.peer)
            .field("queued", &self.writes.len())
            .finish()
    }
}
