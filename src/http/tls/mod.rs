//! TLS support for the transport
//!
//! Handshakes never block: a `TlsSession` is advanced from readiness
//! events exactly like plaintext reads and writes, so the engine only
//! has to look at `HandshakeState` to know which interest to register.
//!
//! # Examples
//!
//! ```no_run
//! use rpcwire::http::tls::{ClientAuth, Identity, TlsSettings, TlsVersion};
//!
//! let server = TlsSettings::new()
//!     .identity(Identity::from_pem_file("server.pem").unwrap())
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
//!     .client_auth(ClientAuth::Request);
//!
//! let client = TlsSettings::new()
//!     .protocols("TLSv1.2,TLSv1.3")
//!     .unwrap()
//!     .verify_peer(true)
//!     .ca_file("ca.pem");
//! ```

pub mod config;
pub mod identity;
pub mod session;

pub use config::{
    ClientAuth, TlsContext, TlsError, TlsSettings, TlsVersion, DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use identity::Identity;
pub use session::{HandshakeState, TlsSession};

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
