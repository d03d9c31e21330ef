//! Non-blocking network engine
//!
//! One `Reactor` thread multiplexes every socket. Each client or server
//! owns a `Processor` that performs the actual reads and writes for its
//! sockets, parsing input with `MessageBuffer` and handing complete
//! messages to its `Role`. Outbound sockets are recycled through the
//! `ConnectionPool`; blocking work runs on the `WorkerPool`; deadlines
//! are fired by the `Timer` thread.
//!
//! Lock order, outermost first:
//!
//! 1. `ConnectionPool` state
//! 2. `Processor` connections
//! 3. `Processor` pending changes
//!
//! A `ResponseCoordinator` lock may be held while queueing changes, and
//! no lock is held while a role hook or user callback runs.

pub mod connection;
pub mod pool;
pub mod processor;
pub mod reactor;
pub mod timer;
pub mod worker;

pub use connection::{Connection, Destination, SocketState};
pub use pool::{ConnectionPool, PoolLimit};
pub use processor::{Processor, ProcessorOptions, Role, Teardown};
pub use reactor::Reactor;
pub use timer::{Timer, TimerHandle};
pub use worker::WorkerPool;

use crate::http::{self, tls::TlsError, Status};
use bytes::Bytes;
use std::time::Duration;

/// Result type for engine and call operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failures seen by callers of the transport
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No pooled connection became available in time
    #[error("no connection to {destination} available within {waited:?}")]
    PoolExhausted {
        destination: Destination,
        waited: Duration,
    },

    /// The request was abandoned and its connection closed
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The peer answered with a well-formed fault
    #[error("remote fault {code}: {message}")]
    RemoteFault { code: i32, message: String },

    /// The peer answered with a status other than 200
    #[error("unexpected HTTP status {status}")]
    Status { status: Status, body: Bytes },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

impl Error {
    /// The status a server answers this error with, if it is a framing error
    pub fn http_status(&self) -> Option<Status> {
        match self {
            Error::Http(e) => e.status(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::RequestTimeout(_) | Error::PoolExhausted { .. }
        )
    }
}
