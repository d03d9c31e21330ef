//! Per-role socket engine
//!
//! A `Processor` drives the sockets of one client or one server. All of
//! its socket I/O happens on the reactor thread: other threads hand it
//! work as `Change`s (adopt a connection, queue bytes, close) and wake
//! the reactor. The differences between client and server live entirely
//! in the `Role` hooks.

use super::connection::{Flush, Segment, Transport};
use super::reactor::Endpoint;
use super::{Connection, Error, Reactor, Result, SocketState, Timer};
use crate::http::tls::{HandshakeState, TlsContext, TlsError};
use crate::http::MessageBuffer;
use bytes::Bytes;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const READ_CHUNK: usize = 16 * 1024;
const LISTEN_BACKLOG: i32 = 1024;

/// What the processor does with a socket after an error hook ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Close right away, discarding queued output
    Now,
    /// Stop reading; close once queued output (including anything the
    /// hook queued) has a segment that asks for closure
    AfterWrites,
}

/// Role-specific behaviour plugged into a `Processor`
///
/// Hooks run on the reactor thread. They must not block; anything slow
/// belongs on a worker. Except for `new_read_buffer`, no processor lock
/// is held while a hook runs.
pub trait Role: Send + Sync + Sized + 'static {
    /// Fresh parser for the next message on `token`
    ///
    /// Called with the processor's connection table locked, so it must
    /// not call back into the processor.
    fn new_read_buffer(&self, token: Token) -> MessageBuffer;

    /// A server socket was accepted
    fn on_accept(&self, _processor: &Arc<Processor<Self>>, _token: Token, _peer: SocketAddr) {}

    /// A complete message arrived
    fn on_message(&self, processor: &Arc<Processor<Self>>, token: Token, message: MessageBuffer);

    /// Something went wrong on `token`, or on no socket in particular
    ///
    /// A socket whose TLS handshake timed out is closed right away
    /// whatever this returns: nothing can be written on it yet.
    fn on_error(
        &self,
        processor: &Arc<Processor<Self>>,
        token: Option<Token>,
        error: Error,
    ) -> Teardown;

    /// The message being read on `token` could not be framed
    ///
    /// `partial` holds whatever was parsed before the failure, such as
    /// the start line. By default this is an ordinary error.
    fn on_rejected(
        &self,
        processor: &Arc<Processor<Self>>,
        token: Token,
        error: Error,
        partial: Option<MessageBuffer>,
    ) -> Teardown {
        let _ = partial;
        self.on_error(processor, Some(token), error)
    }

    /// The peer finished sending on `token`
    ///
    /// Return true to close once the output queued so far is written.
    /// A role that still owes output returns false and closes the
    /// socket itself when done.
    fn on_end_of_stream(&self, _processor: &Arc<Processor<Self>>, _token: Token) -> bool {
        true
    }

    /// The socket was closed and forgotten by the processor
    fn on_closed(&self, processor: &Arc<Processor<Self>>, token: Token);
}

/// Knobs that do not vary by role
#[derive(Debug, Clone, Default)]
pub struct ProcessorOptions {
    pub name: String,
    pub tls: Option<TlsContext>,
    pub idle_timeout: Option<Duration>,
    /// Accepted sockets beyond this many are closed straight away
    pub max_connections: Option<usize>,
}

enum Change {
    Adopt {
        conn: Connection,
        write: Option<Bytes>,
    },
    Write {
        token: Token,
        data: Bytes,
        close: bool,
    },
    Close(Token),
    IdleCheck(Token),
    HandshakeCheck(Token),
}

#[derive(Default)]
struct Outcome {
    messages: Vec<MessageBuffer>,
    error: Option<Error>,
    /// The buffer that failed to frame, when `error` is a framing error
    partial: Option<MessageBuffer>,
    end_of_stream: bool,
    close: bool,
}

/// Socket engine for one role
pub struct Processor<R: Role> {
    id: usize,
    name: String,
    me: Weak<Self>,
    reactor: Reactor,
    timer: Timer,
    role: R,
    tls: Option<TlsContext>,
    idle_timeout: Option<Duration>,
    max_connections: Option<usize>,
    connections: Mutex<HashMap<Token, Connection>>,
    listener: Mutex<Option<(Token, TcpListener)>>,
    changes: Mutex<Vec<Change>>,
    /// Set once the reactor has retired this processor; guarded by `changes`
    retired: AtomicBool,
}

impl<R: Role> Processor<R> {
    /// Create a processor and add it to the reactor's active set
    pub fn new(reactor: &Reactor, timer: &Timer, role: R, options: ProcessorOptions) -> Arc<Self> {
        let processor = Arc::new_cyclic(|me| Processor {
            id: reactor.next_endpoint_id(),
            name: options.name,
            me: me.clone(),
            reactor: reactor.clone(),
            timer: timer.clone(),
            role,
            tls: options.tls,
            idle_timeout: options.idle_timeout,
            max_connections: options.max_connections,
            connections: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            changes: Mutex::new(Vec::new()),
            retired: AtomicBool::new(false),
        });
        reactor.register(processor.clone());
        processor
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Number of sockets currently driven by this processor
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn owner_handle(&self) -> Weak<dyn Endpoint> {
        self.me.clone()
    }

    /// Bind a listening socket and start accepting on it
    pub fn listen(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let mut listener = TcpListener::from_std(socket.into());
        let local = listener.local_addr()?;
        let token = self.reactor.next_token();
        self.reactor
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        self.reactor.set_owner(token, self.owner_handle());
        *self.listener.lock() = Some((token, listener));

        tracing::info!(processor = %self.name, %local, "listening");
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .as_ref()
            .and_then(|(_, l)| l.local_addr().ok())
    }

    /// Take over a connection, optionally queueing bytes to send on it
    ///
    /// A processor that has been shut down refuses the connection and
    /// hands it back.
    pub fn adopt(&self, conn: Connection, write: Option<Bytes>) -> std::result::Result<(), Connection> {
        match self.enqueue(Change::Adopt { conn, write }) {
            Some(Change::Adopt { conn, .. }) => Err(conn),
            _ => Ok(()),
        }
    }

    /// Whether the processor has been shut down
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Queue bytes for `token`; with `close`, the socket is closed once
    /// they are written
    pub fn queue_write(&self, token: Token, data: Bytes, close: bool) {
        self.push_change(Change::Write { token, data, close });
    }

    /// Close `token` from any thread
    pub fn request_close(&self, token: Token) {
        self.push_change(Change::Close(token));
    }

    fn push_change(&self, change: Change) {
        if self.enqueue(change).is_some() {
            tracing::trace!(processor = %self.name, "processor retired; change dropped");
        }
    }

    /// Queue a change for the reactor thread; a retired processor
    /// returns it unapplied
    fn enqueue(&self, change: Change) -> Option<Change> {
        {
            let mut changes = self.changes.lock();
            if self.retired.load(Ordering::SeqCst) {
                return Some(change);
            }
            changes.push(change);
        }
        self.reactor.wakeup();
        None
    }

    /// Hand a connection back without closing it
    ///
    /// The socket stays registered; whoever receives it decides what to
    /// watch for next.
    pub fn disown(&self, token: Token) -> Option<Connection> {
        let mut conn = self.connections.lock().remove(&token)?;
        self.reactor.clear_owner(token);
        conn.read_buffer = None;
        Some(conn)
    }

    /// Close a socket and notify the role
    pub fn close(self: &Arc<Self>, token: Token) {
        let conn = self.connections.lock().remove(&token);
        if let Some(mut conn) = conn {
            tracing::trace!(processor = %self.name, token = token.0, "closing connection");
            conn.close(self.reactor.registry());
            self.reactor.clear_owner(token);
            self.role.on_closed(self, token);
        }
    }

    /// Remove this processor from the reactor, closing all its sockets
    pub fn shutdown(&self) {
        self.reactor.deregister(self.id);
    }

    fn accept_all(self: &Arc<Self>) {
        loop {
            let accepted = {
                let guard = self.listener.lock();
                let Some((_, listener)) = guard.as_ref() else {
                    return;
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, peer)) => self.accept_one(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(processor = %self.name, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn accept_one(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Some(max) = self.max_connections {
            if self.connections.lock().len() >= max {
                tracing::debug!(processor = %self.name, %peer, max, "connection limit reached; refusing");
                return;
            }
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "cannot set TCP_NODELAY");
        }

        let token = self.reactor.next_token();
        let mut conn = Connection::accepted(token, stream, peer);
        if let Some(tls) = self.tls.clone() {
            if let Err(e) = self.start_tls(&tls, &mut conn, None) {
                tracing::debug!(%peer, error = %e, "TLS accept failed");
                conn.close(self.reactor.registry());
                return;
            }
        }
        let interest = conn.desired_interest();
        if let Err(e) = conn.set_interest(self.reactor.registry(), interest) {
            tracing::warn!(%peer, error = %e, "cannot register accepted socket");
            return;
        }

        tracing::debug!(processor = %self.name, token = token.0, %peer, "accepted");
        self.role.on_accept(self, token, peer);
        self.reactor.set_owner(token, self.owner_handle());
        self.connections.lock().insert(token, conn);
        if let Some(idle) = self.idle_timeout {
            self.schedule_check(idle, Change::IdleCheck(token));
        }
    }

    fn start_tls(
        &self,
        tls: &TlsContext,
        conn: &mut Connection,
        servername: Option<&str>,
    ) -> std::result::Result<(), TlsError> {
        let Transport::Plain(stream) = std::mem::replace(&mut conn.transport, Transport::Closed) else {
            return Err(TlsError::InvalidConfig("socket is not plaintext".to_string()));
        };
        let session = tls.start(stream, servername)?;
        conn.transport = Transport::Tls(session);
        conn.state = SocketState::Handshaking;
        self.schedule_check(tls.handshake_timeout(), Change::HandshakeCheck(conn.token()));
        Ok(())
    }

    fn schedule_check(&self, delay: Duration, change: Change) {
        let me = self.me.clone();
        self.timer.schedule(delay, move || {
            if let Some(processor) = me.upgrade() {
                processor.push_change(change);
            }
        });
    }

    /// Service one socket and act on the outcome
    fn drive(self: &Arc<Self>, token: Token, readable: bool, writable: bool) {
        let outcome = {
            let mut connections = self.connections.lock();
            let Some(conn) = connections.get_mut(&token) else {
                return;
            };
            self.service(conn, readable, writable)
        };
        self.settle(token, outcome);
    }

    fn service(&self, conn: &mut Connection, mut readable: bool, mut writable: bool) -> Outcome {
        let mut out = Outcome::default();

        if conn.state == SocketState::Connecting {
            match conn.finish_connect() {
                Ok(false) => return out,
                Ok(true) => {
                    tracing::trace!(token = conn.token().0, "connected");
                    conn.state = SocketState::Ready;
                    let secure = conn.destination().map(|d| d.is_secure()).unwrap_or(false);
                    if secure {
                        let host = conn.destination().map(|d| d.host().to_string());
                        let result = match self.tls.clone() {
                            Some(tls) => self.start_tls(&tls, conn, host.as_deref()),
                            None => Err(TlsError::InvalidConfig(
                                "https destination without TLS settings".to_string(),
                            )),
                        };
                        if let Err(e) = result {
                            out.error = Some(e.into());
                            return out;
                        }
                    }
                    readable = true;
                    writable = true;
                }
                Err(e) => {
                    out.error = Some(e.into());
                    return out;
                }
            }
        }

        if conn.state == SocketState::Handshaking {
            let progress = match &mut conn.transport {
                Transport::Tls(session) => session.handshake(),
                _ => Ok(HandshakeState::Established),
            };
            match progress {
                Ok(HandshakeState::Established) => {
                    tracing::trace!(token = conn.token().0, "TLS established");
                    conn.state = SocketState::Ready;
                    conn.touch();
                    readable = true;
                    writable = true;
                }
                Ok(_) => {
                    self.refresh_interest(conn, &mut out);
                    return out;
                }
                Err(e) => {
                    out.error = Some(e.into());
                    return out;
                }
            }
        }

        if readable && matches!(conn.state, SocketState::Ready | SocketState::Closing) {
            self.read_into(conn, &mut out);
        }
        if out.error.is_none() && (writable || conn.has_pending_writes()) {
            match conn.flush() {
                Ok(Flush::Close) => out.close = true,
                Ok(_) => {}
                Err(e) => out.error = Some(e.into()),
            }
        }
        if out.error.is_none() && !out.close {
            self.refresh_interest(conn, &mut out);
        }
        out
    }

    fn refresh_interest(&self, conn: &mut Connection, out: &mut Outcome) {
        let interest = conn.desired_interest();
        if let Err(e) = conn.set_interest(self.reactor.registry(), interest) {
            out.error = Some(e.into());
        }
    }

    fn read_into(&self, conn: &mut Connection, out: &mut Outcome) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match conn.transport.read(&mut buf) {
                Ok(0) => {
                    tracing::trace!(token = conn.token().0, "end of stream");
                    if conn.state == SocketState::Closing {
                        return;
                    }
                    conn.state = SocketState::Closing;
                    out.end_of_stream = true;
                    return;
                }
                Ok(n) => {
                    conn.touch();
                    // Input after a close decision is drained and dropped
                    if conn.state != SocketState::Ready {
                        continue;
                    }
                    if let Err(e) = self.feed(conn, &buf[..n], &mut out.messages) {
                        conn.state = SocketState::Closing;
                        out.partial = conn.read_buffer.take();
                        out.error = Some(e);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    out.error = Some(e.into());
                    return;
                }
            }
        }
    }

    fn feed(&self, conn: &mut Connection, mut data: &[u8], messages: &mut Vec<MessageBuffer>) -> Result<()> {
        let token = conn.token();
        while !data.is_empty() && conn.state == SocketState::Ready {
            let buffer = conn
                .read_buffer
                .get_or_insert_with(|| self.role.new_read_buffer(token));
            let used = buffer.feed(data)?;
            data = &data[used..];

            if buffer.is_complete() {
                if let Some(message) = conn.read_buffer.take() {
                    if message.must_close() {
                        conn.state = SocketState::Closing;
                    }
                    messages.push(message);
                }
            } else if used == 0 {
                break;
            }
        }
        Ok(())
    }

    fn settle(self: &Arc<Self>, token: Token, outcome: Outcome) {
        for message in outcome.messages {
            self.role.on_message(self, token, message);
        }
        if let Some(error) = outcome.error {
            tracing::debug!(processor = %self.name, token = token.0, %error, "socket error");
            let teardown = if matches!(error, Error::Http(_)) {
                self.role.on_rejected(self, token, error, outcome.partial)
            } else {
                self.role.on_error(self, Some(token), error)
            };
            match teardown {
                Teardown::Now => self.close(token),
                Teardown::AfterWrites => {}
            }
        } else if outcome.close {
            self.close(token);
        } else if outcome.end_of_stream && self.role.on_end_of_stream(self, token) {
            self.close_after_writes(token);
        }
    }

    /// Queue a close behind the output already handed to `token`,
    /// including writes hooks queued during this turn
    fn close_after_writes(&self, token: Token) {
        self.push_change(Change::Write {
            token,
            data: Bytes::new(),
            close: true,
        });
    }

    fn apply(self: &Arc<Self>, change: Change) {
        match change {
            Change::Adopt { mut conn, write } => {
                let token = conn.token();
                if let Some(data) = write {
                    conn.writes.push_back(Segment { data, close: false });
                }
                conn.read_buffer = None;
                let interest = conn.desired_interest();
                if let Err(e) = conn.set_interest(self.reactor.registry(), interest) {
                    self.reactor.clear_owner(token);
                    self.connections.lock().insert(token, conn);
                    self.settle(
                        token,
                        Outcome {
                            error: Some(e.into()),
                            ..Outcome::default()
                        },
                    );
                    return;
                }
                let ready = conn.state == SocketState::Ready;
                self.reactor.set_owner(token, self.owner_handle());
                self.connections.lock().insert(token, conn);
                if ready {
                    self.drive(token, false, true);
                }
            }
            Change::Write { token, data, close } => {
                let queued = match self.connections.lock().get_mut(&token) {
                    Some(conn) => {
                        conn.writes.push_back(Segment { data, close });
                        true
                    }
                    None => false,
                };
                if queued {
                    self.drive(token, false, true);
                } else {
                    tracing::debug!(processor = %self.name, token = token.0, "dropping output for closed socket");
                }
            }
            Change::Close(token) => self.close(token),
            Change::IdleCheck(token) => {
                let Some(idle) = self.idle_timeout else {
                    return;
                };
                let elapsed = match self.connections.lock().get(&token) {
                    Some(conn) => conn.last_access().elapsed(),
                    None => return,
                };
                if elapsed >= idle {
                    tracing::debug!(processor = %self.name, token = token.0, "idle timeout");
                    self.close(token);
                } else {
                    self.schedule_check(idle - elapsed, Change::IdleCheck(token));
                }
            }
            Change::HandshakeCheck(token) => {
                let stalled = self
                    .connections
                    .lock()
                    .get(&token)
                    .map(|c| c.state() == SocketState::Handshaking)
                    .unwrap_or(false);
                if stalled {
                    let timeout = self
                        .tls
                        .as_ref()
                        .map(|t| t.handshake_timeout())
                        .unwrap_or_default();
                    let error = Error::Tls(TlsError::HandshakeTimeout(timeout));
                    // No plaintext can be written before the handshake ends
                    let teardown = self.role.on_error(self, Some(token), error);
                    tracing::trace!(token = token.0, ?teardown, "handshake stalled; closing");
                    self.close(token);
                }
            }
        }
    }
}

impl<R: Role> Endpoint for Processor<R> {
    fn id(&self) -> usize {
        self.id
    }

    fn apply_pending_changes(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        loop {
            let changes = std::mem::take(&mut *self.changes.lock());
            if changes.is_empty() {
                return;
            }
            for change in changes {
                this.apply(change);
            }
        }
    }

    fn handle_event(&self, event: &Event) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let token = event.token();
        let is_listener = matches!(*self.listener.lock(), Some((t, _)) if t == token);
        if is_listener {
            this.accept_all();
            return;
        }

        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        let writable = event.is_writable() || event.is_write_closed() || event.is_error();
        this.drive(token, readable, writable);
    }

    fn handle_failure(&self, token: Option<Token>, error: Error) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        self.role.on_error(&this, token, error);
        if let Some(token) = token {
            this.close(token);
        }
    }

    fn close_all(&self) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let abandoned = {
            let mut changes = self.changes.lock();
            self.retired.store(true, Ordering::SeqCst);
            std::mem::take(&mut *changes)
        };
        if let Some((token, mut listener)) = self.listener.lock().take() {
            let _ = self.reactor.registry().deregister(&mut listener);
            self.reactor.clear_owner(token);
        }
        // Connections handed over but never applied are closed like the rest
        {
            let mut connections = self.connections.lock();
            for change in abandoned {
                if let Change::Adopt { conn, .. } = change {
                    connections.insert(conn.token(), conn);
                }
            }
        }
        let tokens: Vec<Token> = self.connections.lock().keys().copied().collect();
        for token in tokens {
            this.close(token);
        }
        tracing::debug!(processor = %self.name, "closed all connections");
    }
}

impl<R: Role> std::fmt::Debug for Processor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("connections", &self.connection_count())
            .field("secure", &self.is_secure())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Status;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every request with its own body
    struct Echo {
        errors: AtomicUsize,
        closed: AtomicUsize,
        /// Ask for `AfterWrites` on every error
        linger: bool,
    }

    impl Role for Echo {
        fn new_read_buffer(&self, _token: Token) -> MessageBuffer {
            MessageBuffer::request()
        }

        fn on_message(&self, processor: &Arc<Processor<Self>>, token: Token, message: MessageBuffer) {
            let close = message.must_close();
            let body = Bytes::copy_from_slice(message.body());
            let mut response = crate::http::HttpResponse::new(Status::OK);
            response.set_body(body);
            processor.queue_write(token, Bytes::from(response.to_wire()), close);
        }

        fn on_error(&self, processor: &Arc<Processor<Self>>, token: Option<Token>, error: Error) -> Teardown {
            self.errors.fetch_add(1, Ordering::SeqCst);
            if self.linger {
                return Teardown::AfterWrites;
            }
            if let (Some(token), Some(status)) = (token, error.http_status()) {
                let response = crate::http::HttpResponse::new(status);
                processor.queue_write(token, Bytes::from(response.to_wire()), true);
                return Teardown::AfterWrites;
            }
            Teardown::Now
        }

        fn on_closed(&self, _processor: &Arc<Processor<Self>>, _token: Token) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn echo_server(options: ProcessorOptions) -> (Reactor, Timer, Arc<Processor<Echo>>, SocketAddr) {
        start_echo(options, false)
    }

    fn start_echo(options: ProcessorOptions, linger: bool) -> (Reactor, Timer, Arc<Processor<Echo>>, SocketAddr) {
        let reactor = Reactor::start().unwrap();
        let timer = Timer::start().unwrap();
        let role = Echo {
            errors: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            linger,
        };
        let processor = Processor::new(&reactor, &timer, role, options);
        let addr = processor.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        (reactor, timer, processor, addr)
    }

    fn read_until_closed(stream: &mut std::net::TcpStream) -> String {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out);
        String::from_utf8_lossy(&out).to_string()
    }

    #[test]
    fn test_echo_and_close() {
        let (reactor, timer, processor, addr) = echo_server(ProcessorOptions::default());
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nConnection: close\r\nContent-Length: 4\r\n\r\nping")
            .unwrap();

        let reply = read_until_closed(&mut client);
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
        assert!(reply.ends_with("\r\n\r\nping"));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while processor.role().closed.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(processor.role().closed.load(Ordering::SeqCst), 1);

        processor.shutdown();
        reactor.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_framing_error_answered_then_closed() {
        let (reactor, timer, processor, addr) = echo_server(ProcessorOptions::default());
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"PUT / HTTP/1.1\r\n\r\n").unwrap();

        let reply = read_until_closed(&mut client);
        assert!(reply.starts_with("HTTP/1.1 501 Not Implemented\r\n"), "{}", reply);
        assert_eq!(processor.role().errors.load(Ordering::SeqCst), 1);

        processor.shutdown();
        reactor.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_idle_timeout_closes_socket() {
        let options = ProcessorOptions {
            idle_timeout: Some(Duration::from_millis(50)),
            ..ProcessorOptions::default()
        };
        let (reactor, timer, processor, addr) = echo_server(options);
        let mut client = std::net::TcpStream::connect(addr).unwrap();

        let reply = read_until_closed(&mut client);
        assert!(reply.is_empty());
        assert_eq!(processor.connection_count(), 0);

        processor.shutdown();
        reactor.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_connection_cap_refuses_extra_sockets() {
        let options = ProcessorOptions {
            max_connections: Some(1),
            ..ProcessorOptions::default()
        };
        let (reactor, timer, processor, addr) = echo_server(options);
        let _first = std::net::TcpStream::connect(addr).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while processor.connection_count() < 1 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut second = std::net::TcpStream::connect(addr).unwrap();
        assert!(read_until_closed(&mut second).is_empty());
        assert_eq!(processor.connection_count(), 1);

        processor.shutdown();
        assert_eq!(processor.connection_count(), 0);
        reactor.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_end_of_stream_closes_after_replies() {
        let (reactor, timer, processor, addr) = echo_server(ProcessorOptions::default());
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\nhi")
            .unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let reply = read_until_closed(&mut client);
        assert!(reply.ends_with("\r\n\r\nhi"), "{}", reply);

        processor.shutdown();
        reactor.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_stalled_handshake_closes_even_when_role_lingers() {
        let tls = crate::http::tls::TlsSettings::new()
            .handshake_timeout(Duration::from_millis(50))
            .server_context()
            .unwrap();
        let options = ProcessorOptions {
            tls: Some(tls),
            ..ProcessorOptions::default()
        };
        let (reactor, timer, processor, addr) = start_echo(options, true);
        let mut client = std::net::TcpStream::connect(addr).unwrap();

        assert!(read_until_closed(&mut client).is_empty());
        assert_eq!(processor.role().errors.load(Ordering::SeqCst), 1);
        assert_eq!(processor.connection_count(), 0);

        processor.shutdown();
        reactor.shutdown();
        timer.shutdown();
    }

    #[test]
    fn test_retired_processor_refuses_connections() {
        let (reactor, timer, processor, _addr) = echo_server(ProcessorOptions::default());
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = crate::net::ConnectionPool::new(
            reactor.clone(),
            crate::net::PoolLimit::Unbounded,
            None,
            None,
        );
        let url = url::Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let destination = crate::net::Destination::from_url(&url).unwrap();

        processor.shutdown();
        assert!(processor.is_retired());
        let conn = pool.acquire(&destination, processor.id()).unwrap();
        let token = conn.token();
        let mut conn = processor.adopt(conn, None).unwrap_err();
        assert_eq!(conn.token(), token);
        conn.close(reactor.registry());
        pool.discard(token);
        assert_eq!(pool.checked_out(&destination), 0);

        reactor.shutdown();
        timer.shutdown();
    }
}
