//! HTTP/1.x wire layer for the RPC transport
//!
//! This module holds everything that deals with bytes on the wire and
//! nothing that deals with sockets:
//!
//! - `Headers` keeps a case-insensitive, order-preserving header mapping
//! - `HttpRequest` / `HttpResponse` are outbound messages with `to_wire()`
//! - `MessageBuffer` is the incremental parser fed by the network engine
//! - `Encoding` / `EncodingMap` describe content codecs keyed by name
//!
//! Only `GET` and `POST`, HTTP/1.0 and HTTP/1.1, and `Content-Length`
//! delimited bodies are understood. Anything else is a framing error
//! that carries the status code the server answers with.
//!
//! # Examples
//!
//! ```
//! use rpcwire::http::MessageBuffer;
//!
//! let mut buffer = MessageBuffer::request();
//! buffer
//!     .feed(b"POST /RPC2 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\n\r\nping")
//!     .unwrap();
//! assert!(buffer.is_complete());
//! assert_eq!(buffer.body(), b"ping");
//! ```

pub mod buffer;
pub mod encoding;
pub mod headers;
pub mod message;
pub mod tls;

pub use buffer::{AcceptedEncodings, MessageBuffer, MessageKind, StartLine};
pub use encoding::{Encoding, EncodingMap, IDENTITY};
pub use headers::Headers;
pub use message::{HttpRequest, HttpResponse, Method, Status, Version};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP framing and codec errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The message violates the expected structure. `status` is the
    /// response a server sends back before closing the connection.
    #[error("{status}: {reason}")]
    Framing { status: Status, reason: String },

    #[error("Unsupported content encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(u16),

    #[error("Incomplete message")]
    Incomplete,
}

impl Error {
    /// Build a framing error answered with `status`
    pub fn framing(status: Status, reason: impl Into<String>) -> Self {
        Error::Framing {
            status,
            reason: reason.into(),
        }
    }

    /// The HTTP status a server should answer this error with, if any
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Framing { status, .. } => Some(*status),
            Error::UnsupportedEncoding(_) => Some(Status::UNSUPPORTED_MEDIA_TYPE),
            _ => None,
        }
    }
}

/// Default maximum size of a start line plus header block
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// CRLF line ending
pub const CRLF: &str = "\r\n";

/// Header names with defined semantics
pub mod names {
    pub const ACCEPT_ENCODING: &str = "Accept-Encoding";
    pub const CONNECTION: &str = "Connection";
    pub const CONTENT_ENCODING: &str = "Content-Encoding";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const HOST: &str = "Host";
    pub const SERVER: &str = "Server";
    pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
    pub const USER_AGENT: &str = "User-Agent";
}
