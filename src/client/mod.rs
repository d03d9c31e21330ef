//! RPC client over pooled HTTP connections
//!
//! Every call checks a connection out of the pool, hands it to the
//! client's processor along with the encoded request, and waits on a
//! `Notifier`. The response is validated on a worker thread; the
//! connection goes back to the pool as soon as the response is parsed.
//!
//! # Examples
//!
//! ```no_run
//! use rpcwire::client::{HttpClient, Request};
//! use rpcwire::config::Config;
//!
//! let client = HttpClient::new("http://127.0.0.1:8080/RPC2", Config::default())?;
//! let response = client.execute(
//!     Request::post("/RPC2", "<methodCall/>").content_type("text/xml"),
//! )?;
//! println!("{}", String::from_utf8_lossy(response.body()));
//! # Ok::<(), rpcwire::Error>(())
//! ```

mod notifier;

pub use notifier::{Notifier, NotifierState, ResponseHandler};

use crate::config::Config;
use crate::http::{
    self, names, Encoding, EncodingMap, Headers, HttpRequest, HttpResponse, MessageBuffer, Method,
    Status,
};
use crate::net::{
    ConnectionPool, Error, Processor, ProcessorOptions, Reactor, Result, Role, Teardown, Timer,
    TimerHandle, WorkerPool,
};
use bytes::Bytes;
use mio::Token;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub use crate::net::Destination;

/// One call as the consumer describes it
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    content: Bytes,
    content_type: Option<String>,
    headers: Headers,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Request {
            method,
            path: path.into(),
            content: Bytes::new(),
            content_type: None,
            headers: Headers::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Request::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Request::new(Method::Post, path).content(content)
    }

    pub fn content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = content.into();
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add an extra header; framing headers are always set by the client
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Recognizes application-level faults in a successful HTTP response
///
/// The payload codec implements this; a detected fault is reported as
/// `Error::RemoteFault` instead of a response.
pub trait FaultDetector: Send + Sync {
    fn detect(&self, response: &HttpResponse) -> Option<(i32, String)>;
}

impl<F> FaultDetector for F
where
    F: Fn(&HttpResponse) -> Option<(i32, String)> + Send + Sync,
{
    fn detect(&self, response: &HttpResponse) -> Option<(i32, String)> {
        self(response)
    }
}

struct Resources {
    reactor: Reactor,
    timer: Timer,
    workers: WorkerPool,
    pool: Arc<ConnectionPool>,
    stopped: AtomicBool,
}

/// Reactor, timer, workers, and connection pool shared by clients
#[derive(Clone)]
pub struct SharedResources {
    inner: Arc<Resources>,
}

impl SharedResources {
    /// Start a reactor, timer, and worker pool, with a pool configured
    /// from `config`
    pub fn new(config: &Config) -> Result<Self> {
        let reactor = Reactor::start()?;
        let timer = Timer::start()?;
        let workers = WorkerPool::new("rpcwire-client", config.worker_threads)?;
        let pool = Arc::new(ConnectionPool::new(
            reactor.clone(),
            config.pool_limit,
            config.pool_timeout,
            config.idle_timeout,
        ));
        reactor.register_pool(&pool);
        Ok(SharedResources {
            inner: Arc::new(Resources {
                reactor,
                timer,
                workers,
                pool,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub fn timer(&self) -> &Timer {
        &self.inner.timer
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.inner.workers
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    /// Stop everything; clients using these resources stop working
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.pool.clear();
        self.inner.reactor.shutdown();
        self.inner.timer.shutdown();
        self.inner.workers.shutdown();
    }
}

impl std::fmt::Debug for SharedResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedResources")
            .field("reactor", &self.inner.reactor)
            .field("pool", &self.inner.pool)
            .field("workers", &self.inner.workers.size())
            .finish()
    }
}

struct Pending {
    id: u64,
    notifier: Arc<Notifier>,
    deadline: Option<TimerHandle>,
}

impl Pending {
    fn cancel_deadline(&self) {
        if let Some(deadline) = &self.deadline {
            deadline.cancel();
        }
    }
}

/// Client half of the engine: at most one pending request per socket
struct ClientRole {
    pool: Arc<ConnectionPool>,
    workers: WorkerPool,
    encodings: RwLock<Arc<EncodingMap>>,
    max_header_size: usize,
    fault_detector: RwLock<Option<Arc<dyn FaultDetector>>>,
    pending: Mutex<HashMap<Token, Pending>>,
}

impl ClientRole {
    fn take_pending(&self, token: Token) -> Option<Pending> {
        let pending = self.pending.lock().remove(&token)?;
        pending.cancel_deadline();
        Some(pending)
    }

    /// Request deadline fired
    fn expire(&self, processor: &Processor<ClientRole>, token: Token, id: u64, timeout: Duration) {
        let pending = {
            let mut map = self.pending.lock();
            match map.get(&token) {
                Some(p) if p.id == id => map.remove(&token),
                _ => None,
            }
        };
        if let Some(pending) = pending {
            tracing::debug!(token = token.0, ?timeout, "request timed out");
            processor.request_close(token);
            pending.notifier.fail(Error::RequestTimeout(timeout));
        }
    }
}

impl Role for ClientRole {
    fn new_read_buffer(&self, _token: Token) -> MessageBuffer {
        MessageBuffer::response()
            .with_encodings(self.encodings.read().clone())
            .with_max_header_size(self.max_header_size)
    }

    fn on_message(&self, processor: &Arc<Processor<Self>>, token: Token, message: MessageBuffer) {
        let Some(pending) = self.take_pending(token) else {
            tracing::debug!(token = token.0, "response without a pending request");
            processor.close(token);
            return;
        };

        let reusable = message.keep_alive();
        if let Some(conn) = processor.disown(token) {
            self.pool.release(conn, reusable);
        }

        let detector = self.fault_detector.read().clone();
        self.workers.execute(move || {
            let outcome = validate(message, detector.as_deref());
            pending.notifier.resolve(outcome);
        });
    }

    fn on_error(
        &self,
        processor: &Arc<Processor<Self>>,
        token: Option<Token>,
        error: Error,
    ) -> Teardown {
        match token {
            Some(token) => match self.take_pending(token) {
                Some(pending) => {
                    pending.notifier.fail(error);
                }
                None => tracing::debug!(token = token.0, %error, "error on idle client socket"),
            },
            None => {
                let failed: Vec<(Token, Pending)> = self.pending.lock().drain().collect();
                let message = error.to_string();
                tracing::warn!(error = %message, pending = failed.len(), "failing all pending requests");
                for (token, pending) in failed {
                    pending.cancel_deadline();
                    processor.request_close(token);
                    pending.notifier.fail(Error::Processing(message.clone()));
                }
            }
        }
        Teardown::Now
    }

    fn on_closed(&self, _processor: &Arc<Processor<Self>>, token: Token) {
        if let Some(pending) = self.take_pending(token) {
            pending.notifier.fail(Error::ConnectionClosed);
        }
        self.pool.discard(token);
    }
}

/// Turn a parsed response into the caller's outcome
fn validate(message: MessageBuffer, detector: Option<&dyn FaultDetector>) -> Result<HttpResponse> {
    if !message.is_complete() {
        return Err(Error::Processing("incomplete response".to_string()));
    }
    let response = message.into_response()?;
    if response.status() != Status::OK {
        return Err(Error::Status {
            status: response.status(),
            body: response.body().clone(),
        });
    }
    if let Some((code, message)) = detector.and_then(|d| d.detect(&response)) {
        return Err(Error::RemoteFault { code, message });
    }
    Ok(response)
}

/// HTTP client bound to one destination
pub struct HttpClient {
    url: Url,
    destination: Destination,
    config: Config,
    resources: SharedResources,
    owns_resources: bool,
    processor: Arc<Processor<ClientRole>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpClient {
    /// Create a client with its own reactor, workers, and pool
    pub fn new(url: &str, config: Config) -> Result<Self> {
        let resources = SharedResources::new(&config)?;
        let mut client = Self::with_resources(url, &resources, config)?;
        client.owns_resources = true;
        Ok(client)
    }

    /// Create a client on resources shared with other clients
    pub fn with_resources(url: &str, resources: &SharedResources, config: Config) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let destination = Destination::from_url(&url)?;

        let tls = match (&config.tls, destination.is_secure()) {
            (Some(settings), _) => Some(settings.client_context()?),
            (None, true) => Some(http::tls::TlsSettings::default().client_context()?),
            (None, false) => None,
        };

        let role = ClientRole {
            pool: resources.pool().clone(),
            workers: resources.workers().clone(),
            encodings: RwLock::new(Arc::new(EncodingMap::new())),
            max_header_size: config.max_header_size,
            fault_detector: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
        };
        let options = ProcessorOptions {
            name: format!("client {}", destination),
            tls,
            idle_timeout: None,
            max_connections: None,
        };
        let processor = Processor::new(resources.reactor(), resources.timer(), role, options);

        tracing::debug!(%destination, "client created");
        Ok(HttpClient {
            url,
            destination,
            config,
            resources: resources.clone(),
            owns_resources: false,
            processor,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn resources(&self) -> &SharedResources {
        &self.resources
    }

    /// Make `encoding` available for request and response bodies
    pub fn register_encoding(&self, encoding: Arc<dyn Encoding>) {
        let mut guard = self.processor.role().encodings.write();
        let mut map = EncodingMap::clone(&guard);
        map.insert(encoding);
        *guard = Arc::new(map);
    }

    pub fn set_fault_detector(&self, detector: impl FaultDetector + 'static) {
        *self.processor.role().fault_detector.write() = Some(Arc::new(detector));
    }

    pub fn set_worker_threads(&self, threads: usize) -> Result<()> {
        self.resources.workers().resize(threads)?;
        Ok(())
    }

    /// Requests sent and not yet resolved
    pub fn pending_requests(&self) -> usize {
        self.processor.role().pending.lock().len()
    }

    /// Send a request and block for its outcome
    pub fn execute(&self, request: Request) -> Result<HttpResponse> {
        let notifier = Notifier::blocking();
        self.dispatch(request, notifier.clone());
        notifier.wait()
    }

    /// POST `content` to the client's URL path
    pub fn post(&self, content: impl Into<Bytes>, content_type: &str) -> Result<HttpResponse> {
        self.execute(Request::post(self.url.path(), content).content_type(content_type))
    }

    /// Send a request; `handler` receives the outcome on a worker thread
    ///
    /// Blocks only while waiting for a pooled connection.
    pub fn execute_async(&self, request: Request, handler: impl ResponseHandler) {
        let notifier = Notifier::callback(handler, self.resources.workers().clone());
        self.dispatch(request, notifier);
    }

    fn dispatch(&self, request: Request, notifier: Arc<Notifier>) {
        if self.closed.load(Ordering::SeqCst) {
            notifier.fail(Error::ConnectionClosed);
            return;
        }
        let wire = match self.encode(request) {
            Ok(wire) => wire,
            Err(e) => {
                notifier.fail(e);
                return;
            }
        };
        let conn = match self
            .resources
            .pool()
            .acquire(&self.destination, self.processor.id())
        {
            Ok(conn) => conn,
            Err(e) => {
                notifier.fail(e);
                return;
            }
        };

        let token = conn.token();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let role = self.processor.role();
        role.pending.lock().insert(
            token,
            Pending {
                id,
                notifier,
                deadline: None,
            },
        );

        if let Some(timeout) = self.config.request_timeout {
            let processor = Arc::downgrade(&self.processor);
            let handle = self.resources.timer().schedule(timeout, move || {
                if let Some(processor) = processor.upgrade() {
                    processor.role().expire(&processor, token, id, timeout);
                }
            });
            match role.pending.lock().get_mut(&token) {
                Some(pending) if pending.id == id => pending.deadline = Some(handle),
                _ => {
                    handle.cancel();
                }
            }
        }

        tracing::trace!(token = token.0, request = id, destination = %self.destination, "sending request");
        if let Err(mut conn) = self.processor.adopt(conn, Some(wire)) {
            // Closed concurrently: the processor will never drive this socket
            conn.close(self.resources.reactor().registry());
            self.resources.pool().discard(token);
            if let Some(pending) = role.take_pending(token) {
                pending.notifier.fail(Error::ConnectionClosed);
            }
        }
    }

    fn encode(&self, request: Request) -> Result<Bytes> {
        let encodings = self.processor.role().encodings.read().clone();
        let mut message = HttpRequest::new(request.method, request.path);
        let headers = message.headers_mut();
        for (name, value) in request.headers.iter() {
            headers.append(name, value);
        }
        headers.set(names::HOST, self.destination.authority());
        headers.set(names::USER_AGENT, self.config.user_agent.as_str());
        if let Some(content_type) = request.content_type {
            headers.set(names::CONTENT_TYPE, content_type);
        }
        if !encodings.is_empty() {
            let mut offered: Vec<String> = encodings.names().map(str::to_string).collect();
            offered.sort();
            headers.set(names::ACCEPT_ENCODING, offered.join(", "));
        }
        message.set_body(request.content);

        if let Some(name) = &self.config.request_encoding {
            let encoding = encodings
                .get(name)
                .ok_or_else(|| http::Error::UnsupportedEncoding(name.clone()))?;
            message.encode_with(encoding.as_ref())?;
        }
        Ok(Bytes::from(message.to_wire()))
    }

    /// Close every connection this client is using
    ///
    /// Pending requests fail with `ConnectionClosed`. Owned resources
    /// are shut down as well.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.processor.shutdown();
        if self.owns_resources {
            self.resources.shutdown();
        }
        tracing::debug!(destination = %self.destination, "client closed");
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("url", &self.url.as_str())
            .field("pending", &self.pending_requests())
            .field("owns_resources", &self.owns_resources)
            .finish()
    }
}
