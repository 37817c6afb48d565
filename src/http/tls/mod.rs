//! TLS support for HTTPS connections
//!
//! The agent's TLS side, built on the `openssl` crate:
//!
//! 1. `SslConfig` holds the mutable TLS settings (verify mode, trust store,
//!    client credentials, verify depth, ciphers) and caches the OpenSSL
//!    connector built from them
//! 2. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O
//! 3. All HTTP code remains unchanged - it transparently uses TLS operations
//!
//! # Examples
//!
//! ```no_run
//! use httpclient_adapter::http::tls::{SslConfig, SslConfigTarget, TlsSessionOps};
//! use httpclient_adapter::http::HttpClient;
//! use std::net::TcpStream;
//!
//! let mut config = SslConfig::new();
//! config.set_verify_depth(4);
//!
//! let tcp_stream = TcpStream::connect("example.com:443").unwrap();
//! let tls_session = TlsSessionOps::connect(tcp_stream, "example.com", &mut config, None).unwrap();
//! let mut client = HttpClient::new(tls_session);
//! ```

pub mod config;
pub mod session;

pub use config::{
    CertStore, CertStoreBuilder, CipherListTarget, SslConfig, SslConfigTarget, TlsError,
};
pub use session::TlsSessionOps;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
