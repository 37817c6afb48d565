//! HTTP/1.1 plumbing used by the agent
//!
//! This module provides the wire-level client side of HTTP/1.1: request
//! serialization, response parsing and the transport abstraction the agent
//! drives.
//!
//! # Architecture
//!
//! The HTTP layer uses a session operations abstraction so that plain TCP and
//! TLS connections share the same request/response code:
//!
//! - `SessionOps` trait defines operations (poll, read, write, flush, close)
//! - `HttpSession` wraps a `SessionOps` and applies send/receive timeouts
//! - `HttpClient` speaks HTTP/1.1 over an `HttpSession`
//!
//! # Examples
//!
//! ```no_run
//! use httpclient_adapter::http::{HttpClient, HttpRequest, Method};
//! use httpclient_adapter::http::session::FdSessionOps;
//! use std::net::TcpStream;
//!
//! let stream = TcpStream::connect("127.0.0.1:8080").unwrap();
//! let mut client = HttpClient::new(FdSessionOps::new(stream));
//!
//! let request = HttpRequest::builder()
//!     .method(Method::Get)
//!     .uri("/")
//!     .header("Host", "localhost")
//!     .build();
//! client.send_request(&request).unwrap();
//!
//! let response = client.receive_response(false).unwrap();
//! assert_eq!(response.status().code(), 200);
//! ```

pub mod chunked;
pub mod client;
pub mod headers;
pub mod message;
pub mod parser;
pub mod session;
pub mod tls;

pub use client::HttpClient;
pub use headers::Headers;
pub use message::{HttpRequest, HttpResponse, Method, Status, Version};
pub use parser::ResponseParser;
pub use session::{HttpSession, SessionOps};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Proxy refused tunnel: {0}")]
    ProxyRefused(Status),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 100;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
