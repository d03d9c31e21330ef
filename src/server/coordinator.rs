//! In-order delivery of pipelined responses
//!
//! Workers finish requests in any order. Each request is numbered when it
//! arrives; a finished response is written only once every response
//! numbered before it has been written, and buffered until then. After
//! the peer stops sending, the socket closes behind the last response.

use bytes::Bytes;
use mio::Token;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Weak;

/// Where ordered responses are written
pub trait ResponseSink: Send + Sync {
    /// Queue `data` on `token`; with `close`, the socket closes after it
    fn emit(&self, token: Token, data: Bytes, close: bool);
}

struct Ready {
    data: Bytes,
    close: bool,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    next_emit: u64,
    ready: BTreeMap<u64, Ready>,
    /// No more requests will be numbered
    finishing: bool,
    closed: bool,
}

/// Per-socket response sequencer
pub struct ResponseCoordinator {
    token: Token,
    sink: Weak<dyn ResponseSink>,
    state: Mutex<State>,
}

impl ResponseCoordinator {
    pub fn new(token: Token, sink: Weak<dyn ResponseSink>) -> Self {
        ResponseCoordinator {
            token,
            sink,
            state: Mutex::new(State::default()),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Number the next request on this socket
    pub fn next_sequence(&self) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    /// Hand in the response for `seq`
    ///
    /// Emits it, and any buffered successors, if it is next in line.
    /// Once a closing response is emitted, nothing after it is sent.
    pub fn complete(&self, seq: u64, data: Bytes, close: bool) {
        let mut state = self.state.lock();
        if state.closed {
            tracing::trace!(token = self.token.0, seq, "socket gone; response dropped");
            return;
        }
        if seq < state.next_emit || state.ready.contains_key(&seq) {
            tracing::warn!(token = self.token.0, seq, "duplicate response");
            return;
        }
        state.ready.insert(seq, Ready { data, close });

        let Some(sink) = self.sink.upgrade() else {
            state.closed = true;
            state.ready.clear();
            return;
        };
        loop {
            let due = state.next_emit;
            let Some(ready) = state.ready.remove(&due) else {
                break;
            };
            state.next_emit += 1;
            // Emitted under the lock: writes leave in sequence order
            sink.emit(self.token, ready.data, ready.close);
            if ready.close {
                state.closed = true;
                let dropped = state.ready.len();
                state.ready.clear();
                if dropped > 0 {
                    tracing::debug!(token = self.token.0, dropped, "responses after close dropped");
                }
                break;
            }
        }
        if !state.closed {
            self.close_if_drained(&mut state);
        }
    }

    /// The peer sent its last request
    ///
    /// The socket is closed once every numbered response is written.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.finishing = true;
        self.close_if_drained(&mut state);
    }

    fn close_if_drained(&self, state: &mut State) {
        if !state.finishing || state.next_emit < state.next_seq {
            return;
        }
        state.closed = true;
        if let Some(sink) = self.sink.upgrade() {
            sink.emit(self.token, Bytes::new(), true);
        }
    }

    /// Discard everything; later completions are ignored
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.ready.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Responses finished but waiting for an earlier one
    pub fn buffered(&self) -> usize {
        self.state.lock().ready.len()
    }
}

impl std::fmt::Debug for ResponseCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ResponseCoordinator")
            .field("token", &self.token.0)
            .field("next_seq", &state.next_seq)
            .field("next_emit", &state.next_emit)
            .field("buffered", &state.ready.len())
            .field("closed", &state.closed)
            .finish()
    }
}
