//! The I/O multiplexer
//!
//! One thread owns the `mio::Poll`. Every cycle it lets each active
//! endpoint apply its queued changes, waits for readiness, and routes
//! each event to the endpoint that owns the token. Events on tokens no
//! endpoint owns belong to idle pooled connections and are checked for
//! peer closure.

use super::{ConnectionPool, Error};
use crossbeam_channel::{bounded, Sender};
use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

const WAKE_TOKEN: Token = Token(0);

/// Something that owns sockets registered with the reactor
pub trait Endpoint: Send + Sync {
    fn id(&self) -> usize;

    /// Apply registrations and writes queued by other threads
    fn apply_pending_changes(&self);

    /// Service a readiness event on a socket this endpoint owns
    fn handle_event(&self, event: &Event);

    /// Report a failure; `None` when no single socket is to blame
    fn handle_failure(&self, token: Option<Token>, error: Error);

    /// Close every socket this endpoint owns
    fn close_all(&self);
}

struct Shared {
    registry: Registry,
    waker: Waker,
    endpoints: Mutex<Vec<Arc<dyn Endpoint>>>,
    owners: Mutex<HashMap<Token, Weak<dyn Endpoint>>>,
    retiring: Mutex<Vec<(Arc<dyn Endpoint>, Sender<()>)>>,
    pools: Mutex<Vec<Weak<ConnectionPool>>>,
    next_token: AtomicUsize,
    next_endpoint: AtomicUsize,
    shutdown: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

/// Handle to the reactor thread; clones share it
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

impl Reactor {
    /// Create the poller and start the reactor thread
    pub fn start() -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let shared = Arc::new(Shared {
            registry,
            waker,
            endpoints: Mutex::new(Vec::new()),
            owners: Mutex::new(HashMap::new()),
            retiring: Mutex::new(Vec::new()),
            pools: Mutex::new(Vec::new()),
            next_token: AtomicUsize::new(1),
            next_endpoint: AtomicUsize::new(1),
            shutdown: AtomicBool::new(false),
            thread: Mutex::new(None),
            thread_id: Mutex::new(None),
        });

        let looping = shared.clone();
        let handle = thread::Builder::new()
            .name("rpcwire-reactor".to_string())
            .spawn(move || run(looping, poll))?;
        *shared.thread_id.lock() = Some(handle.thread().id());
        *shared.thread.lock() = Some(handle);

        Ok(Reactor { shared })
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Allocate a token no other socket uses
    pub fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_endpoint_id(&self) -> usize {
        self.shared.next_endpoint.fetch_add(1, Ordering::Relaxed)
    }

    /// Force the loop to re-check pending changes
    pub fn wakeup(&self) {
        if let Err(e) = self.shared.waker.wake() {
            tracing::warn!(error = %e, "reactor wakeup failed");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.load(Ordering::SeqCst)
    }

    fn on_reactor_thread(&self) -> bool {
        *self.shared.thread_id.lock() == Some(thread::current().id())
    }

    /// Add an endpoint to the active set
    pub fn register(&self, endpoint: Arc<dyn Endpoint>) {
        self.shared.endpoints.lock().push(endpoint);
        self.wakeup();
    }

    /// Route events for `token` to `owner`
    pub fn set_owner(&self, token: Token, owner: Weak<dyn Endpoint>) {
        self.shared.owners.lock().insert(token, owner);
    }

    pub fn clear_owner(&self, token: Token) {
        self.shared.owners.lock().remove(&token);
    }

    /// Let idle connections of `pool` receive closure notifications
    pub fn register_pool(&self, pool: &Arc<ConnectionPool>) {
        let mut pools = self.shared.pools.lock();
        pools.retain(|p| p.strong_count() > 0);
        pools.push(Arc::downgrade(pool));
    }

    /// Remove an endpoint and close every socket it owns
    ///
    /// The endpoint's pending changes are flushed first. Returns once
    /// the reactor has done this, unless called from the reactor thread
    /// itself, in which case it happens immediately.
    pub fn deregister(&self, endpoint_id: usize) {
        let endpoint = {
            let mut endpoints = self.shared.endpoints.lock();
            let pos = endpoints.iter().position(|e| e.id() == endpoint_id);
            pos.map(|pos| endpoints.remove(pos))
        };
        let Some(endpoint) = endpoint else {
            return;
        };

        if self.on_reactor_thread() || !self.is_running() {
            retire(&endpoint);
            return;
        }

        let (done_tx, done_rx) = bounded(1);
        self.shared.retiring.lock().push((endpoint, done_tx));
        self.wakeup();
        if done_rx.recv_timeout(Duration::from_secs(5)).is_err() {
            tracing::warn!(endpoint = endpoint_id, "reactor did not retire endpoint in time");
        }
    }

    /// Stop the loop and close every remaining socket
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wakeup();
        if self.on_reactor_thread() {
            return;
        }
        if let Some(handle) = self.shared.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("reactor thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("endpoints", &self.shared.endpoints.lock().len())
            .field("owned_sockets", &self.shared.owners.lock().len())
            .field("running", &self.is_running())
            .finish()
    }
}

fn retire(endpoint: &Arc<dyn Endpoint>) {
    guarded("retire", || {
        endpoint.apply_pending_changes();
        endpoint.close_all();
    });
}

fn guarded(what: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            tracing::error!(what, "panic inside reactor loop");
            false
        }
    }
}

fn run(shared: Arc<Shared>, mut poll: Poll) {
    let mut events = Events::with_capacity(1024);
    tracing::debug!("reactor started");

    while !shared.shutdown.load(Ordering::SeqCst) {
        let retiring: Vec<_> = shared.retiring.lock().drain(..).collect();
        for (endpoint, done) in retiring {
            retire(&endpoint);
            let _ = done.send(());
        }

        let endpoints: Vec<Arc<dyn Endpoint>> = shared.endpoints.lock().clone();
        for endpoint in &endpoints {
            guarded("apply_pending_changes", || endpoint.apply_pending_changes());
        }

        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %e, "poll failed");
            let message = e.to_string();
            for endpoint in &endpoints {
                guarded("handle_failure", || {
                    endpoint.handle_failure(None, Error::Processing(message.clone()))
                });
            }
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }

            let owner = shared.owners.lock().get(&token).and_then(Weak::upgrade);
            match owner {
                Some(endpoint) => {
                    if !guarded("handle_event", || endpoint.handle_event(event)) {
                        guarded("handle_failure", || {
                            endpoint.handle_failure(
                                Some(token),
                                Error::Processing("panic while servicing socket".to_string()),
                            )
                        });
                    }
                }
                None => {
                    let pools: Vec<_> = shared.pools.lock().iter().filter_map(Weak::upgrade).collect();
                    let known = pools.iter().any(|pool| pool.check_for_closure(token));
                    if !known {
                        tracing::trace!(token = token.0, "event for unknown token");
                    }
                }
            }
        }
    }

    let retiring: Vec<_> = shared.retiring.lock().drain(..).collect();
    for (endpoint, done) in retiring {
        retire(&endpoint);
        let _ = done.send(());
    }
    let endpoints: Vec<_> = shared.endpoints.lock().drain(..).collect();
    for endpoint in &endpoints {
        retire(endpoint);
    }
    shared.owners.lock().clear();
    tracing::debug!("reactor stopped");
}
