//! HTTP/1.1 client connection
//!
//! One request/response exchange at a time over a `SessionOps` transport.

use super::{HttpRequest, HttpResponse, HttpSession, Method, ResponseParser, Result, SessionOps};
use std::time::Duration;

const READ_CHUNK: usize = 8192;

/// HTTP client
///
/// Provides methods for sending requests and receiving responses.
pub struct HttpClient<S: SessionOps> {
    session: HttpSession<S>,
    buffer: Vec<u8>,
    read_to_eof: bool,
}

impl<S: SessionOps> HttpClient<S> {
    /// Create a new HTTP client over a transport
    pub fn new(session: S) -> Self {
        Self::from_session(HttpSession::new(session))
    }

    pub fn from_session(session: HttpSession<S>) -> Self {
        HttpClient {
            session,
            buffer: vec![0u8; READ_CHUNK],
            read_to_eof: false,
        }
    }

    /// Set send and receive timeouts
    pub fn set_timeouts(&mut self, send: Option<Duration>, receive: Option<Duration>) {
        self.session.set_write_timeout(send);
        self.session.set_read_timeout(receive);
    }

    /// Send an HTTP request
    pub fn send_request(&mut self, request: &HttpRequest) -> Result<()> {
        self.session.write_all(&request.to_wire())
    }

    /// Receive an HTTP response
    ///
    /// `head_request` tells the parser not to expect a body.
    pub fn receive_response(&mut self, head_request: bool) -> Result<HttpResponse> {
        let mut parser = ResponseParser::new(head_request);
        self.read_to_eof = false;

        loop {
            let n = self.session.read(&mut self.buffer)?;

            if n == 0 {
                let response = parser.finish()?;
                self.read_to_eof = true;
                return Ok(response);
            }

            if let Some(response) = parser.feed(&self.buffer[..n])? {
                return Ok(response);
            }
        }
    }

    /// Send a request and wait for its response
    pub fn exchange(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        self.send_request(request)?;
        self.receive_response(request.method() == Method::Head)
    }

    /// Whether the last response body was delimited by the peer closing
    ///
    /// Such a connection cannot carry another request.
    pub fn read_to_eof(&self) -> bool {
        self.read_to_eof
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    pub fn session(&self) -> &HttpSession<S> {
        &self.session
    }

    pub fn into_inner(self) -> S {
        self.session.into_inner()
    }
}
