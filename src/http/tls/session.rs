//! Non-blocking TLS session
//!
//! The handshake is driven by the same readiness events as plaintext
//! I/O. Each call to `handshake()` advances it as far as the socket
//! allows and reports which readiness the session waits for next.

use super::config::TlsError;
use mio::net::TcpStream;
use openssl::ssl::{ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslStream};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown};

/// Where a handshake stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the socket to become readable
    NeedRead,
    /// Waiting for the socket to become writable
    NeedWrite,
    Established,
    Failed,
}

enum Stage {
    Handshaking(MidHandshakeSslStream<TcpStream>),
    Established(SslStream<TcpStream>),
    Failed,
}

/// A TLS connection over a non-blocking stream
pub struct TlsSession {
    stage: Stage,
    state: HandshakeState,
}

impl TlsSession {
    pub(crate) fn start(
        ctx: &SslContext,
        is_server: bool,
        stream: TcpStream,
        servername: Option<&str>,
        verify_host: Option<&str>,
    ) -> Result<Self, TlsError> {
        let mut ssl = Ssl::new(ctx)?;
        let result = if is_server {
            ssl.accept(stream)
        } else {
            // SNI only carries DNS names
            if let Some(name) = servername.filter(|n| n.parse::<IpAddr>().is_err()) {
                ssl.set_hostname(name)?;
            }
            if let Some(host) = verify_host {
                let param = ssl.param_mut();
                match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
                    Ok(ip) => param.set_ip(ip)?,
                    Err(_) => param.set_host(host)?,
                }
            }
            ssl.connect(stream)
        };

        let mut session = TlsSession {
            stage: Stage::Failed,
            state: HandshakeState::Failed,
        };
        session.advance(result)?;
        Ok(session)
    }

    fn advance(
        &mut self,
        result: Result<SslStream<TcpStream>, HandshakeError<TcpStream>>,
    ) -> Result<HandshakeState, TlsError> {
        match result {
            Ok(stream) => {
                self.stage = Stage::Established(stream);
                self.state = HandshakeState::Established;
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                self.state = if mid.error().code() == ErrorCode::WANT_WRITE {
                    HandshakeState::NeedWrite
                } else {
                    HandshakeState::NeedRead
                };
                self.stage = Stage::Handshaking(mid);
            }
            Err(HandshakeError::Failure(mid)) => {
                self.stage = Stage::Failed;
                self.state = HandshakeState::Failed;
                return Err(TlsError::HandshakeFailed(mid.error().to_string()));
            }
            Err(HandshakeError::SetupFailure(e)) => {
                self.stage = Stage::Failed;
                self.state = HandshakeState::Failed;
                return Err(TlsError::OpenSsl(e));
            }
        }
        Ok(self.state)
    }

    /// Continue the handshake after a readiness event
    pub fn handshake(&mut self) -> Result<HandshakeState, TlsError> {
        match std::mem::replace(&mut self.stage, Stage::Failed) {
            Stage::Handshaking(mid) => self.advance(mid.handshake()),
            Stage::Established(stream) => {
                self.stage = Stage::Established(stream);
                Ok(HandshakeState::Established)
            }
            Stage::Failed => Err(TlsError::HandshakeFailed(
                "session already failed".to_string(),
            )),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    /// Negotiated protocol version, once established
    pub fn version(&self) -> Option<&'static str> {
        match &self.stage {
            Stage::Established(stream) => Some(stream.ssl().version_str()),
            _ => None,
        }
    }

    pub fn get_ref(&self) -> Option<&TcpStream> {
        match &self.stage {
            Stage::Handshaking(mid) => Some(mid.get_ref()),
            Stage::Established(stream) => Some(stream.get_ref()),
            Stage::Failed => None,
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut TcpStream> {
        match &mut self.stage {
            Stage::Handshaking(mid) => Some(mid.get_mut()),
            Stage::Established(stream) => Some(stream.get_mut()),
            Stage::Failed => None,
        }
    }

    /// Send close_notify if possible, then shut the socket down
    pub fn close(&mut self) {
        if let Stage::Established(stream) = &mut self.stage {
            let _ = stream.shutdown();
        }
        if let Some(tcp) = self.get_mut() {
            let _ = tcp.shutdown(Shutdown::Both);
        }
    }
}

impl Read for TlsSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stage {
            Stage::Established(stream) => match stream.ssl_read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => Ok(0),
                Err(e) if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => {
                    Err(io::ErrorKind::WouldBlock.into())
                }
                Err(e) => match e.into_io_error() {
                    Ok(io) => Err(io),
                    Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
                },
            },
            Stage::Handshaking(_) => Err(io::ErrorKind::WouldBlock.into()),
            Stage::Failed => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Write for TlsSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stage {
            Stage::Established(stream) => stream.write(buf),
            Stage::Handshaking(_) => Err(io::ErrorKind::WouldBlock.into()),
            Stage::Failed => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stage {
            Stage::Established(stream) => stream.flush(),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("state", &self.state)
            .finish()
    }
}
