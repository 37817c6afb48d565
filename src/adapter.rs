//! Adapter between a generic request environment and the agent
//!
//! `HttpClientAdapter` receives a request described by an `Env`, configures
//! its cached `Agent` from the per-request options (timeouts, proxy, local
//! bind address and, for HTTPS, the SSL options), performs the request and
//! writes the response back into the `Env`.

use crate::agent::{Agent, ProxyConfig};
use crate::http::{self, Headers, Method, Status};
use crate::ssl::{SslConfigurator, SslOptions};
use once_cell::sync::OnceCell;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Adapter errors
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("SSL error: {0}")]
    Ssl(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<http::Error> for AdapterError {
    fn from(err: http::Error) -> Self {
        match err {
            http::Error::Timeout => AdapterError::Timeout,
            http::Error::Io(e) => match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => AdapterError::Timeout,
                _ => AdapterError::ConnectionFailed(e.to_string()),
            },
            http::Error::ConnectionClosed => AdapterError::ConnectionFailed(err.to_string()),
            http::Error::ProxyRefused(status) if status == Status::PROXY_AUTHENTICATION_REQUIRED => {
                AdapterError::ConnectionFailed(format!(
                    "{} \"{}\"",
                    status.code(),
                    status.reason_phrase()
                ))
            }
            http::Error::ProxyRefused(_) => AdapterError::ConnectionFailed(err.to_string()),
            http::Error::Tls(http::tls::TlsError::Timeout) => AdapterError::Timeout,
            http::Error::Tls(e) => AdapterError::Ssl(e.to_string()),
            http::Error::InvalidUrl(_) | http::Error::InvalidMethod(_) => {
                AdapterError::InvalidRequest(err.to_string())
            }
            http::Error::Parse(_)
            | http::Error::InvalidVersion(_)
            | http::Error::InvalidStatus(_)
            | http::Error::InvalidHeader(_)
            | http::Error::InvalidChunkSize(_) => AdapterError::Client(err.to_string()),
        }
    }
}

/// Proxy settings of a single request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOptions {
    pub uri: Url,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ProxyOptions {
    pub fn new(uri: Url) -> Self {
        ProxyOptions {
            uri,
            user: None,
            password: None,
        }
    }

    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }
}

/// Per-request connection options
///
/// `timeout` is the fallback for any of the specific timeouts left unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub open_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub proxy: Option<ProxyOptions>,
    pub bind: Option<SocketAddr>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn proxy(mut self, proxy: ProxyOptions) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(addr);
        self
    }
}

/// Request environment
///
/// Carries the request in and the response back out.
#[derive(Debug, Clone)]
pub struct Env {
    pub method: Method,
    pub url: Url,
    pub request_headers: Headers,
    pub body: Option<Vec<u8>>,
    pub request: Option<RequestOptions>,
    pub ssl: Option<SslOptions>,

    pub status: Option<Status>,
    pub reason_phrase: Option<String>,
    pub response_headers: Headers,
    pub response_body: Vec<u8>,
}

impl Env {
    pub fn new(method: Method, url: Url) -> Self {
        Env {
            method,
            url,
            request_headers: Headers::new(),
            body: None,
            request: None,
            ssl: None,
            status: None,
            reason_phrase: None,
            response_headers: Headers::new(),
            response_body: Vec::new(),
        }
    }

    /// Parse `url` and build an environment for it
    pub fn parse(method: Method, url: &str) -> Result<Self, AdapterError> {
        let url = Url::parse(url)
            .map_err(|e| AdapterError::InvalidRequest(format!("{}: {}", url, e)))?;
        Ok(Self::new(method, url))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn request_options(mut self, options: RequestOptions) -> Self {
        self.request = Some(options);
        self
    }

    pub fn ssl(mut self, ssl: SslOptions) -> Self {
        self.ssl = Some(ssl);
        self
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    fn save_response(&mut self, response: http::HttpResponse) {
        let (status, reason, headers, body) = response.into_parts();
        self.status = Some(status);
        self.reason_phrase = Some(reason);
        self.response_headers = headers;
        self.response_body = body;
    }
}

/// Something that can perform the request described by an `Env`
pub trait Adapter {
    fn call(&self, env: &mut Env) -> Result<(), AdapterError>;
}

type ConfigHook = Box<dyn Fn(&mut Agent) + Send + Sync>;

/// Adapter backed by a single cached `Agent`
pub struct HttpClientAdapter {
    agent: OnceCell<Mutex<Agent>>,
    configurator: SslConfigurator,
    config: Option<ConfigHook>,
}

impl HttpClientAdapter {
    pub fn new() -> Self {
        HttpClientAdapter {
            agent: OnceCell::new(),
            configurator: SslConfigurator::new(),
            config: None,
        }
    }

    /// Create an adapter whose agent is further configured by `hook`
    ///
    /// The hook runs after the per-request options are applied, on every
    /// request.
    pub fn with_config<F>(hook: F) -> Self
    where
        F: Fn(&mut Agent) + Send + Sync + 'static,
    {
        HttpClientAdapter {
            config: Some(Box::new(hook)),
            ..Self::new()
        }
    }

    /// The cached agent, configured for `env`
    pub fn build_connection(&self, env: &Env) -> MutexGuard<'_, Agent> {
        let mut agent = self
            .agent
            .get_or_init(|| {
                let mut agent = Agent::new();
                agent.set_transparent_gzip_decompression(true);
                Mutex::new(agent)
            })
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(req) = &env.request {
            Self::configure_socket(&mut agent, req.bind);
            Self::configure_proxy(&mut agent, req.proxy.as_ref());
            Self::configure_timeouts(&mut agent, req);
        }

        if env.is_https() {
            if let Some(ssl) = &env.ssl {
                self.configurator.configure_agent(&mut agent, ssl);
            }
        }

        if let Some(hook) = &self.config {
            hook(&mut agent);
        }

        agent
    }

    /// Copy request timeouts onto the agent
    ///
    /// A specific timeout wins over `timeout`; when neither is set the
    /// agent keeps its current value.
    pub fn configure_timeouts(agent: &mut Agent, req: &RequestOptions) {
        if let Some(timeout) = req.open_timeout.or(req.timeout) {
            agent.set_connect_timeout(Some(timeout));
        }
        if let Some(timeout) = req.write_timeout.or(req.timeout) {
            agent.set_send_timeout(Some(timeout));
        }
        if let Some(timeout) = req.read_timeout.or(req.timeout) {
            agent.set_receive_timeout(Some(timeout));
        }
    }

    pub fn configure_proxy(agent: &mut Agent, proxy: Option<&ProxyOptions>) {
        let proxy = proxy.map(|p| {
            let config = ProxyConfig::new(p.uri.clone());
            match &p.user {
                Some(user) => config.basic_auth(user.clone(), p.password.clone().unwrap_or_default()),
                None => config,
            }
        });
        agent.set_proxy(proxy);
    }

    pub fn configure_socket(agent: &mut Agent, bind: Option<SocketAddr>) {
        agent.set_local_addr(bind);
    }

    pub fn configurator(&self) -> &SslConfigurator {
        &self.configurator
    }
}

impl Default for HttpClientAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HttpClientAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientAdapter")
            .field("configurator", &self.configurator)
            .field("config", &self.config.is_some())
            .finish_non_exhaustive()
    }
}

impl Adapter for HttpClientAdapter {
    fn call(&self, env: &mut Env) -> Result<(), AdapterError> {
        let response = {
            let mut agent = self.build_connection(env);
            debug!(method = %env.method, url = %env.url, "performing request");
            agent.request(env.method, &env.url, &env.request_headers, env.body.as_deref())
        };

        match response {
            Ok(response) => {
                debug!(status = response.status().code(), "received response");
                env.save_response(response);
                Ok(())
            }
            Err(e) => {
                warn!(url = %env.url, error = %e, "request failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tls::{CertStore, SslConfigTarget};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_timeouts_keep_defaults_when_unset() {
        let mut agent = Agent::new();
        HttpClientAdapter::configure_timeouts(&mut agent, &RequestOptions::new());

        assert_eq!(agent.connect_timeout(), Some(secs(60)));
        assert_eq!(agent.send_timeout(), Some(secs(120)));
        assert_eq!(agent.receive_timeout(), Some(secs(60)));
    }

    #[test]
    fn test_timeout_fills_every_field() {
        let mut agent = Agent::new();
        HttpClientAdapter::configure_timeouts(&mut agent, &RequestOptions::new().timeout(secs(5)));

        assert_eq!(agent.connect_timeout(), Some(secs(5)));
        assert_eq!(agent.send_timeout(), Some(secs(5)));
        assert_eq!(agent.receive_timeout(), Some(secs(5)));
    }

    #[test]
    fn test_specific_timeouts_win() {
        let mut agent = Agent::new();
        let req = RequestOptions::new()
            .timeout(secs(5))
            .open_timeout(secs(1))
            .read_timeout(secs(7));
        HttpClientAdapter::configure_timeouts(&mut agent, &req);

        assert_eq!(agent.connect_timeout(), Some(secs(1)));
        assert_eq!(agent.send_timeout(), Some(secs(5)));
        assert_eq!(agent.receive_timeout(), Some(secs(7)));
    }

    #[test]
    fn test_open_timeout_alone() {
        let mut agent = Agent::new();
        HttpClientAdapter::configure_timeouts(&mut agent, &RequestOptions::new().open_timeout(secs(2)));

        assert_eq!(agent.connect_timeout(), Some(secs(2)));
        assert_eq!(agent.send_timeout(), Some(secs(120)));
        assert_eq!(agent.receive_timeout(), Some(secs(60)));
    }

    #[test]
    fn test_all_specific_timeouts() {
        let mut agent = Agent::new();
        let req = RequestOptions::new()
            .open_timeout(secs(1))
            .write_timeout(secs(10))
            .read_timeout(secs(5));
        HttpClientAdapter::configure_timeouts(&mut agent, &req);

        assert_eq!(agent.connect_timeout(), Some(secs(1)));
        assert_eq!(agent.send_timeout(), Some(secs(10)));
        assert_eq!(agent.receive_timeout(), Some(secs(5)));
    }

    #[test]
    fn test_config_hook_sets_agent_knobs() {
        let adapter = HttpClientAdapter::with_config(|agent| {
            agent.set_keep_alive_timeout(secs(20));
            agent.ssl_config_mut().set_timeout(Some(secs(25)));
        });
        let env = Env::parse(Method::Get, "https://example.com").unwrap();

        let agent = adapter.build_connection(&env);
        assert_eq!(agent.keep_alive_timeout(), secs(20));
        assert_eq!(agent.ssl_config().timeout(), Some(secs(25)));
    }

    #[test]
    fn test_configure_proxy_with_credentials() {
        let mut agent = Agent::new();
        let proxy = ProxyOptions::new(Url::parse("http://proxy.local:3128").unwrap())
            .credentials("user", "secret");
        HttpClientAdapter::configure_proxy(&mut agent, Some(&proxy));

        let configured = agent.proxy().unwrap();
        assert_eq!(configured.uri().as_str(), "http://proxy.local:3128/");
        assert_eq!(configured.user(), Some("user"));

        HttpClientAdapter::configure_proxy(&mut agent, None);
        assert!(agent.proxy().is_none());
    }

    #[test]
    fn test_ssl_applied_only_for_https() {
        let adapter = HttpClientAdapter::new();
        let store = CertStore::builder().build();
        let ssl = SslOptions::new().cert_store(store.clone());

        let env = Env::parse(Method::Get, "http://example.com/").unwrap().ssl(ssl.clone());
        {
            let agent = adapter.build_connection(&env);
            assert!(!agent.ssl_config().cert_store().is_some_and(|s| CertStore::ptr_eq(s, &store)));
        }

        let env = Env::parse(Method::Get, "https://example.com/").unwrap().ssl(ssl);
        let agent = adapter.build_connection(&env);
        assert!(agent.ssl_config().cert_store().is_some_and(|s| CertStore::ptr_eq(s, &store)));
    }

    #[test]
    fn test_https_without_ssl_options_untouched() {
        let adapter = HttpClientAdapter::new();
        let env = Env::parse(Method::Get, "https://example.com/").unwrap();

        let agent = adapter.build_connection(&env);
        assert_eq!(agent.ssl_config().generation(), 0);
        assert!(agent.transparent_gzip_decompression());
    }

    #[test]
    fn test_agent_is_cached_and_default_store_shared() {
        let adapter = HttpClientAdapter::new();
        let env = Env::parse(Method::Get, "https://example.com/")
            .unwrap()
            .ssl(SslOptions::new());

        let generation = adapter.build_connection(&env).ssl_config().generation();
        let again = adapter.build_connection(&env).ssl_config().generation();
        assert_eq!(generation, again);

        let agent = adapter.build_connection(&env);
        let store = agent.ssl_config().cert_store().unwrap();
        assert!(CertStore::ptr_eq(store, adapter.configurator().default_cert_store()));
    }

    #[test]
    fn test_config_hook_runs_last() {
        let adapter = HttpClientAdapter::with_config(|agent| {
            agent.set_receive_timeout(Some(Duration::from_millis(250)));
        });
        let env = Env::parse(Method::Get, "http://example.com/")
            .unwrap()
            .request_options(RequestOptions::new().timeout(secs(9)));

        let agent = adapter.build_connection(&env);
        assert_eq!(agent.connect_timeout(), Some(secs(9)));
        assert_eq!(agent.receive_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_error_mapping() {
        let timeout: AdapterError = http::Error::Timeout.into();
        assert!(matches!(timeout, AdapterError::Timeout));

        let io = io::Error::new(io::ErrorKind::TimedOut, "connect");
        assert!(matches!(AdapterError::from(http::Error::Io(io)), AdapterError::Timeout));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            AdapterError::from(http::Error::Io(refused)),
            AdapterError::ConnectionFailed(_)
        ));

        let proxy = AdapterError::from(http::Error::ProxyRefused(Status::PROXY_AUTHENTICATION_REQUIRED));
        match proxy {
            AdapterError::ConnectionFailed(msg) => {
                assert_eq!(msg, "407 \"Proxy Authentication Required\"")
            }
            other => panic!("unexpected {:?}", other),
        }

        let tls = http::Error::Tls(http::tls::TlsError::HandshakeFailed("bad cert".into()));
        assert!(matches!(AdapterError::from(tls), AdapterError::Ssl(_)));

        let stalled = http::Error::Tls(http::tls::TlsError::Timeout);
        assert!(matches!(AdapterError::from(stalled), AdapterError::Timeout));

        let parse = http::Error::Parse("garbage".into());
        assert!(matches!(AdapterError::from(parse), AdapterError::Client(_)));

        let url = http::Error::InvalidUrl("ftp://x".into());
        assert!(matches!(AdapterError::from(url), AdapterError::InvalidRequest(_)));
    }

    #[test]
    fn test_call_saves_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            stream
                .write_all(b"HTTP/1.1 201 Created\r\nX-Test: yes\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
                .unwrap();
            request
        });

        let adapter = HttpClientAdapter::new();
        let mut env = Env::parse(Method::Post, &format!("http://{}/items", addr))
            .unwrap()
            .header("Content-Type", "text/plain")
            .body("abc");
        adapter.call(&mut env).unwrap();

        assert_eq!(env.status, Some(Status::new(201).unwrap()));
        assert_eq!(env.reason_phrase.as_deref(), Some("Created"));
        assert_eq!(env.response_headers.get("X-Test"), Some("yes"));
        assert_eq!(env.response_body, b"hello");

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /items HTTP/1.1\r\n"));
        assert!(request.contains("Content-Length: 3\r\n"));
        assert!(request.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn test_call_unsupported_scheme() {
        let adapter = HttpClientAdapter::new();
        let mut env = Env::parse(Method::Get, "ftp://example.com/file").unwrap();

        assert!(matches!(adapter.call(&mut env), Err(AdapterError::InvalidRequest(_))));
        assert!(env.status.is_none());
    }
}
