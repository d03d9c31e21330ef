//! RPC server on the shared engine
//!
//! Complete requests are numbered on the reactor thread, dispatched to
//! the registered handlers on a worker, and written back through the
//! socket's `ResponseCoordinator` so that pipelined requests are
//! answered in order.
//!
//! # Examples
//!
//! ```no_run
//! use rpcwire::config::Config;
//! use rpcwire::server::{HttpServer, Reply, RequestContext};
//!
//! let server = HttpServer::bind("127.0.0.1:8080", Config::default())?;
//! server.register_handler(|ctx: &RequestContext| -> rpcwire::http::Result<Option<Reply>> {
//!     if ctx.path() != "/RPC2" {
//!         return Ok(None);
//!     }
//!     Ok(Some(Reply::ok("text/xml", ctx.request().body().clone())))
//! });
//! # Ok::<(), rpcwire::Error>(())
//! ```

pub mod coordinator;

pub use coordinator::{ResponseCoordinator, ResponseSink};

use crate::config::Config;
use crate::http::{
    self, names, AcceptedEncodings, Encoding, EncodingMap, HttpRequest, HttpResponse, MessageBuffer,
    Status, Version, IDENTITY,
};
use crate::net::{
    Error, Processor, ProcessorOptions, Reactor, Result, Role, Teardown, Timer, WorkerPool,
};
use bytes::Bytes;
use mio::Token;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A handler's answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    status: Status,
    content_type: String,
    body: Bytes,
}

impl Reply {
    pub fn new(status: Status, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Reply {
            status,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn ok(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Reply::new(Status::OK, content_type, body)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Everything a handler may look at
#[derive(Debug)]
pub struct RequestContext {
    request: HttpRequest,
    path: String,
    peer: SocketAddr,
    accepted_encodings: Option<AcceptedEncodings>,
    secure: bool,
}

impl RequestContext {
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Normalized request path, without the query
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// `None` when the request had no `Accept-Encoding` header
    pub fn accepted_encodings(&self) -> Option<&AcceptedEncodings> {
        self.accepted_encodings.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

/// Produces a reply, or declines with `Ok(None)` so the next handler
/// is tried
///
/// An error is answered with its own status if it carries one, 500
/// otherwise.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, ctx: &RequestContext) -> http::Result<Option<Reply>>;
}

impl<F> RequestHandler for F
where
    F: Fn(&RequestContext) -> http::Result<Option<Reply>> + Send + Sync,
{
    fn handle(&self, ctx: &RequestContext) -> http::Result<Option<Reply>> {
        self(ctx)
    }
}

struct ServerShared {
    handlers: RwLock<Vec<Arc<dyn RequestHandler>>>,
    encodings: RwLock<Arc<EncodingMap>>,
    workers: WorkerPool,
    compress: bool,
    secure: bool,
    server_name: String,
    max_header_size: usize,
}

#[derive(Clone)]
struct Session {
    coordinator: Arc<ResponseCoordinator>,
    peer: SocketAddr,
}

struct ServerRole {
    shared: Arc<ServerShared>,
    sessions: Mutex<HashMap<Token, Session>>,
}

impl Role for ServerRole {
    fn new_read_buffer(&self, _token: Token) -> MessageBuffer {
        MessageBuffer::request()
            .with_encodings(self.shared.encodings.read().clone())
            .with_max_header_size(self.shared.max_header_size)
    }

    fn on_accept(&self, processor: &Arc<Processor<Self>>, token: Token, peer: SocketAddr) {
        let sink: Weak<dyn ResponseSink> = Arc::downgrade(processor) as Weak<dyn ResponseSink>;
        let session = Session {
            coordinator: Arc::new(ResponseCoordinator::new(token, sink)),
            peer,
        };
        self.sessions.lock().insert(token, session);
    }

    fn on_message(&self, _processor: &Arc<Processor<Self>>, token: Token, message: MessageBuffer) {
        let Some(session) = self.sessions.lock().get(&token).cloned() else {
            tracing::debug!(token = token.0, "request on unknown socket dropped");
            return;
        };
        let seq = session.coordinator.next_sequence();
        let version = message
            .start_line()
            .map(|line| line.version())
            .unwrap_or_default();
        let shared = self.shared.clone();
        self.shared.workers.execute(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| respond(&shared, message, session.peer)));
            let (data, close) = outcome.unwrap_or_else(|_| {
                tracing::error!(token = token.0, seq, "request processing panicked");
                error_response(&shared, Status::INTERNAL_SERVER_ERROR, version)
            });
            session.coordinator.complete(seq, data, close);
        });
    }

    fn on_error(
        &self,
        _processor: &Arc<Processor<Self>>,
        token: Option<Token>,
        error: Error,
    ) -> Teardown {
        let Some(token) = token else {
            tracing::warn!(%error, "server processor failure");
            return Teardown::Now;
        };
        self.reject(token, error, Version::default())
    }

    fn on_rejected(
        &self,
        _processor: &Arc<Processor<Self>>,
        token: Token,
        error: Error,
        partial: Option<MessageBuffer>,
    ) -> Teardown {
        let version = partial
            .as_ref()
            .and_then(|buffer| buffer.start_line())
            .map(|line| line.version())
            .unwrap_or_default();
        self.reject(token, error, version)
    }

    fn on_end_of_stream(&self, _processor: &Arc<Processor<Self>>, token: Token) -> bool {
        let Some(session) = self.sessions.lock().get(&token).cloned() else {
            return true;
        };
        tracing::trace!(token = token.0, "peer finished sending");
        session.coordinator.finish();
        false
    }

    fn on_closed(&self, _processor: &Arc<Processor<Self>>, token: Token) {
        if let Some(session) = self.sessions.lock().remove(&token) {
            session.coordinator.close();
        }
    }
}

impl ServerRole {
    /// Answer a failed socket with its error status, if it has one
    fn reject(&self, token: Token, error: Error, version: Version) -> Teardown {
        let Some(status) = error.http_status() else {
            tracing::debug!(token = token.0, %error, "server socket failed");
            return Teardown::Now;
        };
        let Some(session) = self.sessions.lock().get(&token).cloned() else {
            return Teardown::Now;
        };

        tracing::debug!(token = token.0, status = status.code(), %error, "rejecting request");
        let seq = session.coordinator.next_sequence();
        let (data, close) = error_response(&self.shared, status, version);
        session.coordinator.complete(seq, data, close);
        Teardown::AfterWrites
    }
}

impl ResponseSink for Processor<ServerRole> {
    fn emit(&self, token: Token, data: Bytes, close: bool) {
        self.queue_write(token, data, close);
    }
}

/// Build the wire response for one complete request
fn respond(shared: &ServerShared, message: MessageBuffer, peer: SocketAddr) -> (Bytes, bool) {
    let version = message
        .start_line()
        .map(|s| s.version())
        .unwrap_or_default();
    if !message.is_complete() {
        return error_response(shared, Status::BAD_REQUEST, version);
    }
    let keep_alive = message.keep_alive();
    let accepted = message.accepted_encodings().cloned();

    let request = match message.into_request() {
        Ok(request) => request,
        Err(e) => {
            let status = e.status().unwrap_or(Status::BAD_REQUEST);
            return error_response(shared, status, version);
        }
    };
    let ctx = RequestContext {
        path: normalize_path(request.uri()),
        request,
        peer,
        accepted_encodings: accepted,
        secure: shared.secure,
    };

    let reply = match dispatch(shared, &ctx) {
        Ok(reply) => reply,
        Err(status) => return error_response(shared, status, version),
    };

    let mut response = HttpResponse::builder()
        .version(version)
        .status(reply.status)
        .header(names::CONTENT_TYPE, reply.content_type)
        .body(reply.body)
        .build();
    response.headers_mut().set(names::SERVER, shared.server_name.as_str());

    if shared.compress {
        let encodings = shared.encodings.read().clone();
        if let Some(encoding) = select_encoding(ctx.accepted_encodings(), &encodings) {
            if let Err(e) = response.encode_with(encoding.as_ref()) {
                tracing::warn!(encoding = encoding.name(), error = %e, "response encoding failed");
            }
        }
    }

    if !keep_alive {
        response.headers_mut().set(names::CONNECTION, "close");
    } else if version == Version::Http10 {
        response.headers_mut().set(names::CONNECTION, "keep-alive");
    }
    tracing::trace!(path = %ctx.path, status = reply.status.code(), "request handled");
    (Bytes::from(response.to_wire()), !keep_alive)
}

/// Ask each handler in turn; `Err` carries the status to answer with
fn dispatch(shared: &ServerShared, ctx: &RequestContext) -> std::result::Result<Reply, Status> {
    let handlers = shared.handlers.read().clone();
    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler.handle(ctx))) {
            Ok(Ok(Some(reply))) => return Ok(reply),
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => {
                tracing::debug!(path = %ctx.path, error = %e, "handler failed");
                return Err(e.status().unwrap_or(Status::INTERNAL_SERVER_ERROR));
            }
            Err(_) => {
                tracing::error!(path = %ctx.path, "handler panicked");
                return Err(Status::INTERNAL_SERVER_ERROR);
            }
        }
    }
    Err(Status::NOT_FOUND)
}

/// `"<code> <reason>"` as text/plain, closing the connection
fn error_response(shared: &ServerShared, status: Status, version: Version) -> (Bytes, bool) {
    let response = HttpResponse::builder()
        .version(version)
        .status(status)
        .header(names::CONTENT_TYPE, "text/plain")
        .header(names::SERVER, shared.server_name.as_str())
        .header(names::CONNECTION, "close")
        .body(status.to_string())
        .build();
    (Bytes::from(response.to_wire()), true)
}

/// First ranked encoding the server knows
///
/// Stops at `identity`; entries weighted zero are refused by the peer.
fn select_encoding(
    accepted: Option<&AcceptedEncodings>,
    known: &EncodingMap,
) -> Option<Arc<dyn Encoding>> {
    for (name, weight) in accepted?.iter() {
        if weight == Some(0.0) {
            continue;
        }
        if name.eq_ignore_ascii_case(IDENTITY) {
            return None;
        }
        if let Some(encoding) = known.get(name) {
            if encoding.is_identity() {
                return None;
            }
            return Some(encoding);
        }
    }
    None
}

/// Collapse `//`, drop `.` segments, resolve `..`, and strip the query
fn normalize_path(target: &str) -> String {
    let path = target.split(['?', '#']).next().unwrap_or("");
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() || (path.ends_with('/') && !segments.is_empty()) {
        normalized.push('/');
    }
    normalized
}

/// HTTP server accepting RPC requests
pub struct HttpServer {
    shared: Arc<ServerShared>,
    processor: Arc<Processor<ServerRole>>,
    reactor: Reactor,
    timer: Timer,
    owns_reactor: bool,
    local_addr: SocketAddr,
    closed: AtomicBool,
}

impl HttpServer {
    /// Listen on `addr` with a reactor of its own
    pub fn bind(addr: impl ToSocketAddrs, config: Config) -> Result<Self> {
        let reactor = Reactor::start()?;
        let timer = Timer::start()?;
        match Self::bind_with(addr, &reactor, &timer, config) {
            Ok(mut server) => {
                server.owns_reactor = true;
                Ok(server)
            }
            Err(e) => {
                reactor.shutdown();
                timer.shutdown();
                Err(e)
            }
        }
    }

    /// Listen on `addr`, sharing an existing reactor and timer
    pub fn bind_with(
        addr: impl ToSocketAddrs,
        reactor: &Reactor,
        timer: &Timer,
        config: Config,
    ) -> Result<Self> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "no address to bind"))
        })?;
        let tls = config
            .tls
            .as_ref()
            .map(|settings| settings.server_context())
            .transpose()?;

        let shared = Arc::new(ServerShared {
            handlers: RwLock::new(Vec::new()),
            encodings: RwLock::new(Arc::new(EncodingMap::new())),
            workers: WorkerPool::new("rpcwire-server", config.worker_threads)?,
            compress: config.compress_responses,
            secure: tls.is_some(),
            server_name: config.server_name.clone(),
            max_header_size: config.max_header_size,
        });
        let role = ServerRole {
            shared: shared.clone(),
            sessions: Mutex::new(HashMap::new()),
        };
        let options = ProcessorOptions {
            name: format!("server {}", addr),
            tls,
            idle_timeout: config.idle_timeout,
            max_connections: config.max_connections,
        };
        let processor = Processor::new(reactor, timer, role, options);
        let local_addr = match processor.listen(addr) {
            Ok(local) => local,
            Err(e) => {
                processor.shutdown();
                shared.workers.shutdown();
                return Err(e.into());
            }
        };

        Ok(HttpServer {
            shared,
            processor,
            reactor: reactor.clone(),
            timer: timer.clone(),
            owns_reactor: false,
            local_addr,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_secure(&self) -> bool {
        self.shared.secure
    }

    /// Add a handler after those already registered
    pub fn register_handler(&self, handler: impl RequestHandler + 'static) {
        self.shared.handlers.write().push(Arc::new(handler));
    }

    /// Make `encoding` available for request decoding and, with
    /// response compression on, for responses
    pub fn register_encoding(&self, encoding: Arc<dyn Encoding>) {
        let mut guard = self.shared.encodings.write();
        let mut map = EncodingMap::clone(&guard);
        map.insert(encoding);
        *guard = Arc::new(map);
    }

    pub fn set_worker_threads(&self, threads: usize) -> Result<()> {
        self.shared.workers.resize(threads)?;
        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.shared.workers.size()
    }

    pub fn connection_count(&self) -> usize {
        self.processor.connection_count()
    }

    /// Stop listening and close every connection
    ///
    /// Handlers still running finish, but their responses are dropped.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.processor.shutdown();
        self.shared.workers.shutdown();
        if self.owns_reactor {
            self.reactor.shutdown();
            self.timer.shutdown();
        }
        tracing::info!(addr = %self.local_addr, "server stopped");
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &self.local_addr)
            .field("secure", &self.shared.secure)
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::encoding::testing::Reverse;

    fn shared(compress: bool) -> ServerShared {
        ServerShared {
            handlers: RwLock::new(Vec::new()),
            encodings: RwLock::new(Arc::new(EncodingMap::new())),
            workers: WorkerPool::new("server-test", 1).unwrap(),
            compress,
            secure: false,
            server_name: "test".to_string(),
            max_header_size: http::DEFAULT_MAX_HEADER_SIZE,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn request(raw: &[u8]) -> MessageBuffer {
        let mut buffer = MessageBuffer::request();
        buffer.feed(raw).unwrap();
        assert!(buffer.is_complete());
        buffer
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/RPC2"), "/RPC2");
        assert_eq!(normalize_path("//a///b"), "/a/b");
        assert_eq!(normalize_path("/a/./b/../c"), "/a/c");
        assert_eq!(normalize_path("/../.."), "/");
        assert_eq!(normalize_path("/a/b/"), "/a/b/");
        assert_eq!(normalize_path("/a?x=/.."), "/a");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn test_select_encoding() {
        let mut known = EncodingMap::new();
        known.insert(Arc::new(Reverse("deflate")));
        let ranked = |v: &str| AcceptedEncodings::parse(v).unwrap();

        let picked = select_encoding(Some(&ranked("gzip, deflate;q=0.5")), &known);
        assert_eq!(picked.map(|e| e.name().to_string()), Some("deflate".to_string()));

        // identity ranks first here, so no transform applies
        assert!(select_encoding(Some(&ranked("deflate;q=0.5, identity")), &known).is_none());
        assert!(select_encoding(Some(&ranked("deflate;q=0")), &known).is_none());
        assert!(select_encoding(Some(&ranked("")), &known).is_none());
        assert!(select_encoding(None, &known).is_none());
    }

    #[test]
    fn test_respond_falls_through_to_404() {
        let shared = shared(false);
        shared
            .handlers
            .write()
            .push(Arc::new(|_: &RequestContext| -> http::Result<Option<Reply>> { Ok(None) }));
        let (data, close) = respond(
            &shared,
            request(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n"),
            peer(),
        );
        let text = String::from_utf8_lossy(&data);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", text);
        assert!(text.ends_with("404 Not Found"));
        assert!(close);
        shared.workers.shutdown();
    }

    #[test]
    fn test_respond_first_handler_wins() {
        let shared = shared(false);
        shared.handlers.write().push(Arc::new(|ctx: &RequestContext| -> http::Result<Option<Reply>> {
            Ok((ctx.path() == "/a").then(|| Reply::ok("text/plain", "first")))
        }));
        shared.handlers.write().push(Arc::new(|_: &RequestContext| -> http::Result<Option<Reply>> {
            Ok(Some(Reply::ok("text/plain", "second")))
        }));

        let (data, close) = respond(
            &shared,
            request(b"GET /x/../a HTTP/1.1\r\nHost: x\r\n\r\n"),
            peer(),
        );
        let text = String::from_utf8_lossy(&data);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Server: test\r\n"));
        assert!(text.ends_with("\r\n\r\nfirst"));
        assert!(!close);

        let (data, _) = respond(&shared, request(b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n"), peer());
        assert!(String::from_utf8_lossy(&data).ends_with("second"));
        shared.workers.shutdown();
    }

    #[test]
    fn test_respond_handler_error_and_panic() {
        let shared = shared(false);
        shared.handlers.write().push(Arc::new(|ctx: &RequestContext| -> http::Result<Option<Reply>> {
            if ctx.path() == "/panic" {
                panic!("handler bug");
            }
            Err(http::Error::Io(io::Error::new(io::ErrorKind::Other, "boom")))
        }));

        for path in ["/panic", "/fail"] {
            let raw = format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", path);
            let (data, close) = respond(&shared, request(raw.as_bytes()), peer());
            let text = String::from_utf8_lossy(&data);
            assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{}", text);
            assert!(text.contains("Connection: close\r\n"));
            assert!(close);
        }
        shared.workers.shutdown();
    }

    #[test]
    fn test_respond_http10_keep_alive() {
        let shared = shared(false);
        shared.handlers.write().push(Arc::new(|_: &RequestContext| -> http::Result<Option<Reply>> {
            Ok(Some(Reply::ok("text/plain", "ok")))
        }));

        let (data, close) = respond(&shared, request(b"GET / HTTP/1.0\r\n\r\n"), peer());
        assert!(String::from_utf8_lossy(&data).starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(String::from_utf8_lossy(&data).contains("Connection: close\r\n"));
        assert!(close);

        let (data, close) = respond(
            &shared,
            request(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n"),
            peer(),
        );
        assert!(String::from_utf8_lossy(&data).contains("Connection: keep-alive\r\n"));
        assert!(!close);
        shared.workers.shutdown();
    }

    #[test]
    fn test_respond_compresses_when_enabled() {
        let shared = shared(true);
        let mut known = EncodingMap::new();
        known.insert(Arc::new(Reverse("rev")));
        *shared.encodings.write() = Arc::new(known);
        shared.handlers.write().push(Arc::new(|_: &RequestContext| -> http::Result<Option<Reply>> {
            Ok(Some(Reply::ok("text/plain", "abc")))
        }));

        let (data, _) = respond(
            &shared,
            request(b"GET / HTTP/1.1\r\nHost: x\r\nAccept-Encoding: rev\r\n\r\n"),
            peer(),
        );
        let text = String::from_utf8_lossy(&data);
        assert!(text.contains("Content-Encoding: rev\r\n"), "{}", text);
        assert!(text.ends_with("\r\n\r\ncba"));

        let (data, _) = respond(&shared, request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"), peer());
        let text = String::from_utf8_lossy(&data);
        assert!(!text.contains("Content-Encoding"));
        assert!(text.ends_with("\r\n\r\nabc"));
        shared.workers.shutdown();
    }
}
