//! Blocking HTTP/1.1 agent
//!
//! `Agent` is the HTTP client the adapter delegates to. It owns its
//! settings (timeouts, proxy, local bind address, TLS configuration) and at
//! most one kept-alive connection, which it reuses for the next request to
//! the same origin.
//!
//! A kept-alive HTTPS connection is only reused while the TLS configuration
//! it was opened with is still current: any effective change to `SslConfig`
//! (a different cert store, new trust anchors, another verify mode) retires
//! it.

use crate::http::session::{BoxedSession, FdSessionOps, PollEvents};
use crate::http::tls::{SslConfig, TlsError, TlsSessionOps};
use crate::http::{
    Error, Headers, HttpClient, HttpRequest, HttpResponse, Method, Result, SessionOps, Version,
    DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::{GzDecoder, ZlibDecoder};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;
use url::{Host, Position, Url};

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default send timeout
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(120);

/// Default receive timeout
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default idle time after which a kept-alive connection is not reused
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP proxy settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    uri: Url,
    user: Option<String>,
    password: Option<String>,
}

impl ProxyConfig {
    pub fn new(uri: Url) -> Self {
        ProxyConfig {
            uri,
            user: None,
            password: None,
        }
    }

    /// Credentials sent as `Proxy-Authorization: Basic`
    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn authorization(&self) -> Option<String> {
        let user = self.user.as_deref()?;
        let password = self.password.as_deref().unwrap_or_default();
        Some(format!("Basic {}", BASE64.encode(format!("{}:{}", user, password))))
    }
}

/// Scheme, host and port a connection is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
struct Origin {
    https: bool,
    host: String,
    port: u16,
}

impl Origin {
    fn from_url(url: &Url) -> Result<Self> {
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::InvalidUrl(format!("unsupported scheme: {}", other))),
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(Error::InvalidUrl(format!("missing host: {}", url))),
        };

        let port = url
            .port()
            .unwrap_or(if https { DEFAULT_HTTPS_PORT } else { DEFAULT_HTTP_PORT });

        Ok(Origin { https, host, port })
    }

    fn default_port(&self) -> u16 {
        if self.https {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        }
    }

    /// `host[:port]`, bracketing IPv6 literals
    fn authority(&self, always_port: bool) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if always_port || self.port != self.default_port() {
            format!("{}:{}", host, self.port)
        } else {
            host
        }
    }
}

struct Connection {
    origin: Origin,
    client: HttpClient<BoxedSession>,
    tls_generation: Option<u64>,
    idle_since: Instant,
}

/// Blocking HTTP/1.1 client
pub struct Agent {
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
    keep_alive_timeout: Duration,
    transparent_gzip_decompression: bool,
    local_addr: Option<SocketAddr>,
    proxy: Option<ProxyConfig>,
    ssl_config: SslConfig,
    connection: Option<Connection>,
}

impl Agent {
    pub fn new() -> Self {
        Agent {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            send_timeout: Some(DEFAULT_SEND_TIMEOUT),
            receive_timeout: Some(DEFAULT_RECEIVE_TIMEOUT),
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            transparent_gzip_decompression: false,
            local_addr: None,
            proxy: None,
            ssl_config: SslConfig::new(),
            connection: None,
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn set_connect_timeout(&mut self, timeout: Option<Duration>) {
        self.connect_timeout = timeout;
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    pub fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.send_timeout = timeout;
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout
    }

    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) {
        self.receive_timeout = timeout;
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout
    }

    pub fn set_keep_alive_timeout(&mut self, timeout: Duration) {
        self.keep_alive_timeout = timeout;
    }

    pub fn transparent_gzip_decompression(&self) -> bool {
        self.transparent_gzip_decompression
    }

    /// Ask for compressed responses and decode them before returning
    pub fn set_transparent_gzip_decompression(&mut self, enabled: bool) {
        self.transparent_gzip_decompression = enabled;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind outgoing sockets to a local address
    pub fn set_local_addr(&mut self, addr: Option<SocketAddr>) {
        if self.local_addr != addr {
            self.local_addr = addr;
            self.drop_connection();
        }
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    pub fn set_proxy(&mut self, proxy: Option<ProxyConfig>) {
        if self.proxy != proxy {
            self.proxy = proxy;
            self.drop_connection();
        }
    }

    pub fn ssl_config(&self) -> &SslConfig {
        &self.ssl_config
    }

    pub fn ssl_config_mut(&mut self) -> &mut SslConfig {
        &mut self.ssl_config
    }

    /// Whether a kept-alive connection is waiting for the next request
    pub fn has_idle_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Close the kept-alive connection, if any
    pub fn close(&mut self) {
        self.drop_connection();
    }

    /// Perform one request
    pub fn request(
        &mut self,
        method: Method,
        url: &Url,
        headers: &Headers,
        body: Option<&[u8]>,
    ) -> Result<HttpResponse> {
        let origin = Origin::from_url(url)?;
        let request = self.build_request(method, url, &origin, headers, body);

        let mut conn = match self.reusable_connection(&origin) {
            Some(conn) => {
                debug!(host = %origin.host, port = origin.port, "reusing kept-alive connection");
                conn
            }
            None => self.connect(origin)?,
        };
        conn.client.set_timeouts(self.send_timeout, self.receive_timeout);

        let mut response = match conn.client.exchange(&request) {
            Ok(response) => response,
            Err(e) => {
                let _ = conn.client.close();
                return Err(e);
            }
        };

        if self.keep_alive(&conn, &request, &response) {
            conn.idle_since = Instant::now();
            self.connection = Some(conn);
        } else {
            let _ = conn.client.close();
        }

        if self.transparent_gzip_decompression {
            decode_content(&mut response)?;
        }

        Ok(response)
    }

    fn build_request(
        &self,
        method: Method,
        url: &Url,
        origin: &Origin,
        headers: &Headers,
        body: Option<&[u8]>,
    ) -> HttpRequest {
        let plain_proxy = self.proxy.as_ref().filter(|_| !origin.https);

        // Plain requests through a proxy use the absolute form
        let target = match plain_proxy {
            Some(_) => url[..Position::AfterQuery].to_string(),
            None => url[Position::BeforePath..Position::AfterQuery].to_string(),
        };

        let mut headers = headers.clone();
        if !headers.contains("Host") {
            headers.insert("Host", origin.authority(false));
        }
        if let Some(auth) = plain_proxy.and_then(ProxyConfig::authorization) {
            headers.set("Proxy-Authorization", auth);
        }
        if self.transparent_gzip_decompression && !headers.contains("Accept-Encoding") {
            headers.insert("Accept-Encoding", "gzip, deflate");
        }

        let chunked = headers.has_token("Transfer-Encoding", "chunked");
        let body = body.unwrap_or_default();
        let needs_length = !body.is_empty()
            || matches!(method, Method::Post | Method::Put | Method::Patch);
        if needs_length && !chunked && !headers.contains("Content-Length") {
            headers.insert("Content-Length", body.len().to_string());
        }

        HttpRequest::builder()
            .method(method)
            .uri(target)
            .headers(headers)
            .body(body.to_vec())
            .build()
    }

    fn reusable_connection(&mut self, origin: &Origin) -> Option<Connection> {
        let mut conn = self.connection.take()?;

        let current_tls = origin.https.then(|| self.ssl_config.generation());
        let fresh = conn.idle_since.elapsed() < self.keep_alive_timeout;
        // An idle connection with readable data was closed (or broken) by the peer
        let quiet = matches!(
            conn.client.session().get_ref().poll(PollEvents::Read, Some(Duration::ZERO)),
            Ok(false)
        );

        if conn.origin == *origin && conn.tls_generation == current_tls && fresh && quiet {
            Some(conn)
        } else {
            let _ = conn.client.close();
            None
        }
    }

    fn connect(&mut self, origin: Origin) -> Result<Connection> {
        let (host, port) = match &self.proxy {
            Some(proxy) => {
                let host = proxy
                    .uri
                    .host_str()
                    .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
                    .ok_or_else(|| Error::InvalidUrl(format!("proxy without host: {}", proxy.uri)))?;
                let port = proxy.uri.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT);
                (host, port)
            }
            None => (origin.host.clone(), origin.port),
        };

        debug!(host = %origin.host, port = origin.port, https = origin.https, via_proxy = self.proxy.is_some(), "opening connection");
        let mut tcp = self.open_socket(&host, port)?;

        let session: BoxedSession = if origin.https {
            if self.proxy.is_some() {
                tcp = self.tunnel(tcp, &origin)?;
            }
            let session = TlsSessionOps::connect(
                tcp,
                &origin.host,
                &mut self.ssl_config,
                self.receive_timeout,
            )
            .map_err(|e| match e {
                TlsError::Timeout => Error::Timeout,
                e => Error::Tls(e),
            })?;
            Box::new(session)
        } else {
            Box::new(FdSessionOps::new(tcp))
        };

        let tls_generation = origin.https.then(|| self.ssl_config.generation());
        Ok(Connection {
            origin,
            client: HttpClient::new(session),
            tls_generation,
            idle_since: Instant::now(),
        })
    }

    fn open_socket(&self, host: &str, port: u16) -> Result<TcpStream> {
        let mut last_err = None;

        for addr in (host, port).to_socket_addrs()? {
            match self.connect_addr(addr) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {}", host))
            })
            .into())
    }

    fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

        if let Some(local) = self.local_addr {
            socket.bind(&SockAddr::from(local))?;
        }

        let remote = SockAddr::from(addr);
        match self.connect_timeout {
            Some(timeout) => socket.connect_timeout(&remote, timeout)?,
            None => socket.connect(&remote)?,
        }
        socket.set_nodelay(true)?;

        Ok(socket.into())
    }

    /// Open a CONNECT tunnel through the proxy to `origin`
    fn tunnel(&self, tcp: TcpStream, origin: &Origin) -> Result<TcpStream> {
        let authority = origin.authority(true);
        let mut builder = HttpRequest::builder()
            .method(Method::Connect)
            .uri(authority.clone())
            .header("Host", authority);
        if let Some(auth) = self.proxy.as_ref().and_then(ProxyConfig::authorization) {
            builder = builder.header("Proxy-Authorization", auth);
        }

        let mut client = HttpClient::new(FdSessionOps::new(tcp));
        client.set_timeouts(self.send_timeout, self.receive_timeout);
        client.send_request(&builder.build())?;

        // Whatever follows a successful CONNECT belongs to the tunnel
        let response = client.receive_response(true)?;
        if !response.status().is_success() {
            return Err(Error::ProxyRefused(response.status()));
        }

        Ok(client.into_inner().into_stream())
    }

    fn keep_alive(&self, conn: &Connection, request: &HttpRequest, response: &HttpResponse) -> bool {
        if self.keep_alive_timeout.is_zero() || conn.client.read_to_eof() {
            return false;
        }
        if request.headers().has_token("Connection", "close")
            || response.headers().has_token("Connection", "close")
        {
            return false;
        }
        match response.version() {
            Version::Http11 => true,
            Version::Http10 => response.headers().has_token("Connection", "keep-alive"),
        }
    }

    fn drop_connection(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            let _ = conn.client.close();
        }
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

/// Decode a `gzip` or `deflate` body in place
fn decode_content(response: &mut HttpResponse) -> Result<()> {
    let encoding = match response.headers().get("Content-Encoding") {
        Some(encoding) => encoding.trim().to_ascii_lowercase(),
        None => return Ok(()),
    };
    if response.body().is_empty() {
        return Ok(());
    }

    let mut decoded = Vec::new();
    let result = match encoding.as_str() {
        "gzip" | "x-gzip" => GzDecoder::new(response.body()).read_to_end(&mut decoded),
        "deflate" => ZlibDecoder::new(response.body()).read_to_end(&mut decoded),
        _ => return Ok(()),
    };
    // The body arrived intact; a bad encoding is a malformed response
    result.map_err(|e| Error::Parse(format!("invalid {} body: {}", encoding, e)))?;

    let headers = response.headers_mut();
    headers.remove("Content-Encoding");
    headers.set("Content-Length", decoded.len().to_string());
    response.set_body(decoded);
    Ok(())
}
