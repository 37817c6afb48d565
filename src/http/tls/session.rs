//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections,
//! enabling transparent switching between plain TCP and TLS I/O.

use super::config::{SslConfig, TlsError};
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{HandshakeError, SslStream, SslVerifyMode};
use openssl::x509::X509VerifyResult;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// TLS session operations
///
/// Wraps an OpenSSL `SslStream` and provides poll/read/write/close.
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    failed: bool,
}

impl TlsSessionOps {
    /// Perform a client handshake with `host` over an established stream
    ///
    /// `host` is sent as SNI and, when the configuration verifies peers,
    /// checked against the server certificate. The configuration's timeout
    /// bounds the handshake, or `fallback_timeout` when it has none. A peer
    /// that stalls past that limit yields `TlsError::Timeout`.
    pub fn connect(
        tcp_stream: TcpStream,
        host: &str,
        config: &mut SslConfig,
        fallback_timeout: Option<Duration>,
    ) -> std::result::Result<Self, TlsError> {
        let connector = config.connector()?;
        let verify_peer = config.verify_mode().contains(SslVerifyMode::PEER);

        let handshake_timeout = config.timeout().or(fallback_timeout);
        tcp_stream.set_read_timeout(handshake_timeout)?;
        tcp_stream.set_write_timeout(handshake_timeout)?;

        let ssl = connector
            .configure()?
            .verify_hostname(verify_peer)
            .use_server_name_indication(true);

        let stream = ssl.connect(host, tcp_stream).map_err(describe_handshake_error)?;

        // The HTTP session polls with its own send/receive timeouts
        stream.get_ref().set_read_timeout(None)?;
        stream.get_ref().set_write_timeout(None)?;

        Ok(TlsSessionOps {
            stream,
            failed: false,
        })
    }

    /// Negotiated protocol version, e.g. "TLSv1.3"
    pub fn version(&self) -> &'static str {
        self.stream.ssl().version_str()
    }

    /// Negotiated cipher name
    pub fn cipher(&self) -> Option<&'static str> {
        self.stream.ssl().current_cipher().map(|c| c.name())
    }

    /// Check if an I/O operation on this session failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }
}

fn describe_handshake_error(err: HandshakeError<TcpStream>) -> TlsError {
    match err {
        HandshakeError::SetupFailure(stack) => TlsError::OpenSsl(stack),
        HandshakeError::Failure(mid) => {
            let verify = mid.ssl().verify_result();
            if mid.error().io_error().is_some_and(is_timeout) {
                TlsError::Timeout
            } else if verify != X509VerifyResult::OK {
                TlsError::HandshakeFailed(format!(
                    "certificate verify failed: {}",
                    verify.error_string()
                ))
            } else {
                TlsError::HandshakeFailed(mid.error().to_string())
            }
        }
        // Blocking socket with a timeout: the peer went quiet mid-handshake
        HandshakeError::WouldBlock(_) => TlsError::Timeout,
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        // Decrypted bytes may already be buffered inside OpenSSL
        if events == PollEvents::Read && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }
        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.stream.flush().map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn close(&mut self) -> HttpResult<()> {
        // Only attempt a clean TLS shutdown on a healthy session
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        use std::net::Shutdown;
        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            other => other.map_err(Error::from),
        }
    }
}
