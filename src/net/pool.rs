//! Outbound connection pool
//!
//! Connections are checked out per destination. With a limit in place,
//! callers beyond it queue in FIFO order and are served by hand-off: a
//! released connection (or the capacity freed by a discarded one) is
//! placed directly in the first waiter's slot. Slots are filled and
//! inspected under the pool lock, so a waiter that times out either
//! finds its grant and keeps it, or leaves the queue before anything is
//! granted to it.

use super::{Connection, Destination, Error, Reactor, Result};
use mio::{Interest, Token};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Cap on concurrently checked-out connections per destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolLimit {
    #[default]
    Unbounded,
    AtMost(usize),
}

impl PoolLimit {
    fn allows(&self, checked_out: usize) -> bool {
        match self {
            PoolLimit::Unbounded => true,
            PoolLimit::AtMost(n) => checked_out < *n,
        }
    }
}

impl From<usize> for PoolLimit {
    /// Zero means no limit
    fn from(n: usize) -> Self {
        if n == 0 {
            PoolLimit::Unbounded
        } else {
            PoolLimit::AtMost(n)
        }
    }
}

impl fmt::Display for PoolLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolLimit::Unbounded => f.write_str("unbounded"),
            PoolLimit::AtMost(n) => write!(f, "{}", n),
        }
    }
}

enum Grant {
    Connection(Connection),
    /// A slot freed up; the waiter opens its own connection
    Capacity,
}

struct Waiter {
    id: u64,
    grant: Option<Grant>,
}

struct Lease {
    destination: Destination,
    owner: usize,
}

#[derive(Default)]
struct State {
    idle: HashMap<Destination, VecDeque<Connection>>,
    checked_out: HashMap<Destination, usize>,
    in_use: HashMap<Token, Lease>,
    waiters: HashMap<Destination, VecDeque<Waiter>>,
    next_waiter: u64,
}

impl State {
    fn checked_out(&self, destination: &Destination) -> usize {
        self.checked_out.get(destination).copied().unwrap_or(0)
    }

    fn check_out(&mut self, destination: &Destination) {
        *self.checked_out.entry(destination.clone()).or_insert(0) += 1;
    }

    fn check_in(&mut self, destination: &Destination) {
        if let Some(count) = self.checked_out.get_mut(destination) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.checked_out.remove(destination);
            }
        }
    }

    /// First waiter for `destination` that has not been served yet
    fn first_unserved(&mut self, destination: &Destination) -> Option<&mut Waiter> {
        self.waiters
            .get_mut(destination)
            .and_then(|queue| queue.iter_mut().find(|w| w.grant.is_none()))
    }

    fn take_waiter(&mut self, destination: &Destination, id: u64) -> Option<Waiter> {
        let queue = self.waiters.get_mut(destination)?;
        let pos = queue.iter().position(|w| w.id == id)?;
        let waiter = queue.remove(pos);
        if queue.is_empty() {
            self.waiters.remove(destination);
        }
        waiter
    }

    fn grant_of(&self, destination: &Destination, id: u64) -> bool {
        self.waiters
            .get(destination)
            .and_then(|queue| queue.iter().find(|w| w.id == id))
            .map(|w| w.grant.is_some())
            .unwrap_or(false)
    }
}

/// Reusable outbound sockets, grouped by destination
pub struct ConnectionPool {
    reactor: Reactor,
    limit: PoolLimit,
    timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    state: Mutex<State>,
    released: Condvar,
}

impl ConnectionPool {
    pub fn new(
        reactor: Reactor,
        limit: PoolLimit,
        timeout: Option<Duration>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        ConnectionPool {
            reactor,
            limit,
            timeout,
            idle_timeout,
            state: Mutex::new(State::default()),
            released: Condvar::new(),
        }
    }

    pub fn limit(&self) -> PoolLimit {
        self.limit
    }

    /// Check out a connection to `destination` on behalf of `owner`
    ///
    /// Returns an idle connection if one is usable, otherwise starts a
    /// new non-blocking connect. At the limit, blocks until a connection
    /// is released or the pool timeout elapses.
    pub fn acquire(&self, destination: &Destination, owner: usize) -> Result<Connection> {
        let started = Instant::now();
        let deadline = self.timeout.map(|t| started + t);
        let mut state = self.state.lock();

        if let Some(conn) = self.take_idle(&mut state, destination) {
            self.lease(&mut state, &conn, destination, owner);
            tracing::trace!(token = conn.token().0, %destination, "reusing pooled connection");
            return Ok(conn);
        }

        if self.limit.allows(state.checked_out(destination)) {
            state.check_out(destination);
            drop(state);
            return self.open(destination, owner);
        }

        let id = state.next_waiter;
        state.next_waiter += 1;
        state
            .waiters
            .entry(destination.clone())
            .or_default()
            .push_back(Waiter { id, grant: None });
        tracing::debug!(%destination, limit = %self.limit, "pool at limit; waiting");

        loop {
            if !state.grant_of(destination, id) {
                let timed_out = match deadline {
                    Some(deadline) => self
                        .released
                        .wait_until(&mut state, deadline)
                        .timed_out(),
                    None => {
                        self.released.wait(&mut state);
                        false
                    }
                };
                if !state.grant_of(destination, id) && !timed_out {
                    continue;
                }
            }

            // Served or timed out: leave the queue either way
            let grant = state.take_waiter(destination, id).and_then(|w| w.grant);
            match grant {
                Some(Grant::Connection(conn)) => {
                    self.lease(&mut state, &conn, destination, owner);
                    return Ok(conn);
                }
                Some(Grant::Capacity) => {
                    drop(state);
                    return self.open(destination, owner);
                }
                None => {
                    tracing::debug!(%destination, "timed out waiting for a pooled connection");
                    return Err(Error::PoolExhausted {
                        destination: destination.clone(),
                        waited: started.elapsed(),
                    });
                }
            }
        }
    }

    /// Open a connection for a slot already counted as checked out
    fn open(&self, destination: &Destination, owner: usize) -> Result<Connection> {
        match Connection::connect(self.reactor.next_token(), destination) {
            Ok(conn) => {
                let mut state = self.state.lock();
                state.in_use.insert(
                    conn.token(),
                    Lease {
                        destination: destination.clone(),
                        owner,
                    },
                );
                Ok(conn)
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.check_in(destination);
                self.pass_capacity(&mut state, destination);
                Err(Error::Io(e))
            }
        }
    }

    fn lease(&self, state: &mut State, conn: &Connection, destination: &Destination, owner: usize) {
        state.in_use.insert(
            conn.token(),
            Lease {
                destination: destination.clone(),
                owner,
            },
        );
    }

    fn take_idle(&self, state: &mut State, destination: &Destination) -> Option<Connection> {
        let registry = self.reactor.registry();
        loop {
            let mut conn = state.idle.get_mut(destination)?.pop_back()?;
            let expired = self
                .idle_timeout
                .map(|t| conn.last_access().elapsed() >= t)
                .unwrap_or(false);
            if expired || conn.probe_closed() {
                tracing::trace!(token = conn.token().0, expired, "evicting pooled connection");
                conn.close(registry);
                continue;
            }
            state.check_out(destination);
            return Some(conn);
        }
    }

    /// Give a slot that just opened up to the first waiter, if any
    fn pass_capacity(&self, state: &mut State, destination: &Destination) {
        if let Some(waiter) = state.first_unserved(destination) {
            waiter.grant = Some(Grant::Capacity);
            state.check_out(destination);
            self.released.notify_all();
        }
    }

    /// Return a checked-out connection
    ///
    /// A reusable connection goes to the first waiter or back to the idle
    /// set; anything else is closed and its slot freed.
    pub fn release(&self, mut conn: Connection, reusable: bool) {
        let registry = self.reactor.registry();
        let mut state = self.state.lock();
        let Some(lease) = state.in_use.remove(&conn.token()) else {
            tracing::debug!(token = conn.token().0, "release of unknown connection");
            conn.close(registry);
            return;
        };
        let destination = lease.destination;

        if !reusable {
            conn.close(registry);
            state.check_in(&destination);
            self.pass_capacity(&mut state, &destination);
            return;
        }

        conn.touch();
        if let Some(waiter) = state.first_unserved(&destination) {
            // Still counted as checked out; the waiter takes the lease over
            waiter.grant = Some(Grant::Connection(conn));
            self.released.notify_all();
            return;
        }

        if let Err(e) = conn.set_interest(registry, Interest::READABLE) {
            tracing::debug!(token = conn.token().0, error = %e, "cannot watch idle connection");
            conn.close(registry);
            state.check_in(&destination);
            return;
        }
        state.check_in(&destination);
        state
            .idle
            .entry(destination)
            .or_default()
            .push_back(conn);
    }

    /// Forget a checked-out connection whose socket was closed elsewhere
    ///
    /// Calling this for an unknown token does nothing.
    pub fn discard(&self, token: Token) {
        let mut state = self.state.lock();
        if let Some(lease) = state.in_use.remove(&token) {
            state.check_in(&lease.destination);
            self.pass_capacity(&mut state, &lease.destination);
        }
    }

    /// Handle a readiness event on an idle connection nobody owns
    ///
    /// Returns false if the token is not an idle connection of this
    /// pool. A closed connection is dropped; a live one is taken off the
    /// poller so the same event is not processed twice.
    pub fn check_for_closure(&self, token: Token) -> bool {
        let registry = self.reactor.registry();
        let mut state = self.state.lock();
        let found = state.idle.iter_mut().find_map(|(destination, queue)| {
            queue
                .iter()
                .position(|c| c.token() == token)
                .map(|pos| (destination.clone(), pos))
        });
        let Some((destination, pos)) = found else {
            return false;
        };

        let Some(queue) = state.idle.get_mut(&destination) else {
            return false;
        };
        if queue[pos].probe_closed() {
            if let Some(mut conn) = queue.remove(pos) {
                tracing::debug!(token = token.0, %destination, "pooled connection closed by peer");
                conn.close(registry);
            }
            if queue.is_empty() {
                state.idle.remove(&destination);
            }
        } else {
            queue[pos].deregister(registry);
        }
        true
    }

    /// Owner of a checked-out connection
    pub fn owner_of(&self, token: Token) -> Option<usize> {
        self.state.lock().in_use.get(&token).map(|l| l.owner)
    }

    pub fn idle_count(&self, destination: &Destination) -> usize {
        self.state
            .lock()
            .idle
            .get(destination)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn checked_out(&self, destination: &Destination) -> usize {
        self.state.lock().checked_out(destination)
    }

    /// Close every idle connection
    pub fn clear(&self) {
        let registry = self.reactor.registry();
        let mut state = self.state.lock();
        for (_, queue) in state.idle.drain() {
            for mut conn in queue {
                conn.close(registry);
            }
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("limit", &self.limit)
            .field("timeout", &self.timeout)
            .field("in_use", &state.in_use.len())
            .field("idle", &state.idle.values().map(|q| q.len()).sum::<usize>())
            .finish()
    }
}
