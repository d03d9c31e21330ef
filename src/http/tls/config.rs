//! TLS configuration
//!
//! `TlsSettings` is a plain description that can be cloned into the
//! client and server configuration. The OpenSSL context is only built
//! when a client or server starts.

use super::identity::Identity;
use super::session::TlsSession;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default time allowed for a handshake to complete
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Parse a protocol name (case-insensitive), e.g. `TLSv1.2`
    pub fn parse(s: &str) -> Result<Self, TlsError> {
        match s.trim().to_uppercase().as_str() {
            "TLSV1" | "TLSV1.0" | "TLS1" | "TLS1.0" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    fn to_openssl_version(self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// Client certificate policy (server side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    /// Don't ask for a client certificate
    #[default]
    None,
    /// Ask for one, but accept clients without
    Request,
    /// Refuse clients without a valid certificate
    Require,
}

impl ClientAuth {
    fn verify_mode(self) -> SslVerifyMode {
        match self {
            ClientAuth::None => SslVerifyMode::NONE,
            ClientAuth::Request => SslVerifyMode::PEER,
            ClientAuth::Require => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake did not finish within {0:?}")]
    HandshakeTimeout(Duration),
}

/// TLS settings shared by clients and servers
#[derive(Clone, Debug)]
pub struct TlsSettings {
    cipher_list: Option<String>,
    ciphersuites: Option<String>,
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    client_auth: ClientAuth,
    handshake_timeout: Duration,
    verify_peer: bool,
    ca_file: Option<PathBuf>,
    identity: Option<Identity>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        TlsSettings {
            cipher_list: None,
            ciphersuites: None,
            min_version: None,
            max_version: None,
            client_auth: ClientAuth::None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            verify_peer: true,
            ca_file: None,
            identity: None,
        }
    }
}

impl TlsSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// OpenSSL cipher list pattern (TLS 1.2 and below)
    pub fn cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.cipher_list = Some(ciphers.into());
        self
    }

    /// OpenSSL cipher suite pattern (TLS 1.3)
    pub fn ciphersuites(mut self, suites: impl Into<String>) -> Self {
        self.ciphersuites = Some(suites.into());
        self
    }

    /// Enable exactly the listed protocols, e.g. `"TLSv1.2,TLSv1.3"`
    ///
    /// OpenSSL only supports a contiguous range, so the lowest and
    /// highest listed versions become the bounds.
    pub fn protocols(mut self, list: &str) -> Result<Self, TlsError> {
        let mut versions = list
            .split(',')
            .filter(|p| !p.trim().is_empty())
            .map(TlsVersion::parse)
            .collect::<Result<Vec<_>, _>>()?;
        versions.sort();
        match (versions.first(), versions.last()) {
            (Some(min), Some(max)) => {
                self.min_version = Some(*min);
                self.max_version = Some(*max);
                Ok(self)
            }
            _ => Err(TlsError::InvalidConfig(format!(
                "no protocols in {:?}",
                list
            ))),
        }
    }

    /// Pin both bounds to one version
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.min_version = Some(min);
        self.max_version = Some(max);
        self
    }

    pub fn client_auth(mut self, mode: ClientAuth) -> Self {
        self.client_auth = mode;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Verify the server's certificate chain and host name (client
    /// side, on by default)
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Trusted CA certificates in PEM form
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Certificate and key presented to the peer
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn get_handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn get_client_auth(&self) -> ClientAuth {
        self.client_auth
    }

    fn apply_common(&self, builder: &mut SslContextBuilder) -> Result<(), TlsError> {
        if let Some(min) = self.min_version {
            builder.set_min_proto_version(Some(min.to_openssl_version()))?;
        }
        if let Some(max) = self.max_version {
            builder.set_max_proto_version(Some(max.to_openssl_version()))?;
        }
        if let Some(ref ciphers) = self.cipher_list {
            builder.set_cipher_list(ciphers)?;
        }
        if let Some(ref suites) = self.ciphersuites {
            builder.set_ciphersuites(suites)?;
        }
        if let Some(ref identity) = self.identity {
            identity.apply(builder)?;
        }
        Ok(())
    }

    /// Build the context used for outbound connections
    pub fn client_context(&self) -> Result<TlsContext, TlsError> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;
        self.apply_common(&mut builder)?;

        if self.verify_peer {
            builder.set_verify(SslVerifyMode::PEER);
            match self.ca_file {
                Some(ref path) => builder.set_ca_file(path)?,
                None => builder.set_default_verify_paths()?,
            }
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }

        Ok(TlsContext {
            ctx: builder.build(),
            is_server: false,
            verify_host: self.verify_peer,
            handshake_timeout: self.handshake_timeout,
        })
    }

    /// Build the context used for accepted connections
    ///
    /// A server without a configured identity presents a freshly
    /// generated self-signed certificate for `localhost`.
    pub fn server_context(&self) -> Result<TlsContext, TlsError> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
        self.apply_common(&mut builder)?;

        if self.identity.is_none() {
            tracing::debug!("no TLS identity configured; generating a self-signed one");
            Identity::self_signed("localhost")?.apply(&mut builder)?;
        }
        builder.check_private_key()?;

        builder.set_verify(self.client_auth.verify_mode());
        if let Some(ref path) = self.ca_file {
            builder.set_ca_file(path)?;
        }

        Ok(TlsContext {
            ctx: builder.build(),
            is_server: true,
            verify_host: false,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

/// A built OpenSSL context plus the side it is used on
#[derive(Clone)]
pub struct TlsContext {
    ctx: SslContext,
    is_server: bool,
    /// Clients check the certificate against the name they dialed
    verify_host: bool,
    handshake_timeout: Duration,
}

impl TlsContext {
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn verifies_host(&self) -> bool {
        self.verify_host
    }

    /// Begin a non-blocking handshake over a connected stream
    ///
    /// `servername` is sent as SNI by clients, and checked against the
    /// server's certificate when verification is on. Servers ignore it.
    pub fn start(
        &self,
        stream: mio::net::TcpStream,
        servername: Option<&str>,
    ) -> Result<TlsSession, TlsError> {
        let verify_host = if self.verify_host { servername } else { None };
        TlsSession::start(&self.ctx, self.is_server, stream, servername, verify_host)
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("is_server", &self.is_server)
            .field("verify_host", &self.verify_host)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}
