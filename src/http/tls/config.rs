//! TLS configuration
//!
//! `SslConfig` is the agent's native, mutable TLS configuration. Callers
//! adjust it through setters (directly, or through the `SslConfigTarget`
//! trait the SSL configurator writes to) and the agent turns it into an
//! OpenSSL connector when it opens an HTTPS connection.
//!
//! Building the connector is where OpenSSL validates everything: unreadable
//! CA paths, bad cipher names or a key that does not match the certificate
//! all surface as `TlsError` at connection time, never from the setters.

use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use openssl::x509::store::{X509Lookup, X509Store, X509StoreBuilder};
use openssl::x509::X509;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timed out")]
    Timeout,
}

/// Trust store handle
///
/// A cheaply clonable description of a set of trust anchors: optionally the
/// platform defaults, plus explicit certificates. Clones share identity, and
/// identity is what the agent uses to decide whether its TLS state must be
/// rebuilt (see [`CertStore::ptr_eq`]).
#[derive(Clone)]
pub struct CertStore {
    inner: Arc<CertStoreInner>,
}

struct CertStoreInner {
    default_paths: bool,
    certs: Vec<X509>,
}

impl CertStore {
    /// A store trusting the platform's default CA locations
    pub fn default_paths() -> Self {
        CertStore::builder().default_paths().build()
    }

    pub fn builder() -> CertStoreBuilder {
        CertStoreBuilder::default()
    }

    /// Whether two handles refer to the same store
    pub fn ptr_eq(a: &CertStore, b: &CertStore) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn uses_default_paths(&self) -> bool {
        self.inner.default_paths
    }

    /// Explicitly added trust anchors
    pub fn certificates(&self) -> &[X509] {
        &self.inner.certs
    }

    /// Materialize as an OpenSSL store
    pub fn to_x509_store(&self) -> Result<X509Store, TlsError> {
        let mut builder = X509StoreBuilder::new()?;
        if self.inner.default_paths {
            builder.set_default_paths()?;
        }
        for cert in &self.inner.certs {
            builder.add_cert(cert.clone())?;
        }
        Ok(builder.build())
    }
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertStore")
            .field("id", &Arc::as_ptr(&self.inner))
            .field("default_paths", &self.inner.default_paths)
            .field("certs", &self.inner.certs.len())
            .finish()
    }
}

/// Builder for [`CertStore`]
#[derive(Default)]
pub struct CertStoreBuilder {
    default_paths: bool,
    certs: Vec<X509>,
}

impl CertStoreBuilder {
    /// Trust the platform default CA file and directory
    pub fn default_paths(mut self) -> Self {
        self.default_paths = true;
        self
    }

    /// Trust an explicit certificate
    pub fn add_cert(mut self, cert: X509) -> Self {
        self.certs.push(cert);
        self
    }

    /// Trust every certificate in a PEM bundle
    pub fn add_pem(mut self, pem: &[u8]) -> Result<Self, TlsError> {
        self.certs.extend(X509::stack_from_pem(pem)?);
        Ok(self)
    }

    pub fn build(self) -> CertStore {
        CertStore {
            inner: Arc::new(CertStoreInner {
                default_paths: self.default_paths,
                certs: self.certs,
            }),
        }
    }
}

/// A TLS configuration object the SSL configurator can write to
///
/// Cipher configuration is an optional capability: targets that cannot set a
/// cipher list keep the default `cipher_list` and return `None`.
pub trait SslConfigTarget {
    fn set_verify_mode(&mut self, mode: SslVerifyMode);

    fn cert_store(&self) -> Option<&CertStore>;

    /// Replace the trust store; the target takes ownership of the handle
    fn set_cert_store(&mut self, store: CertStore);

    /// Trust a CA file or a hashed CA directory
    fn add_trust_ca(&mut self, path: &Path);

    fn set_client_cert(&mut self, cert: X509);

    fn set_client_key(&mut self, key: PKey<Private>);

    fn set_verify_depth(&mut self, depth: u32);

    /// Cipher-list support, if this target has any
    fn cipher_list(&mut self) -> Option<&mut dyn CipherListTarget> {
        None
    }
}

/// Cipher-list capability of a TLS configuration object
pub trait CipherListTarget {
    /// Set the ordered cipher list; `None` restores the library default
    fn set_ciphers(&mut self, ciphers: Option<&[String]>);
}

/// The agent's TLS configuration
pub struct SslConfig {
    verify_mode: SslVerifyMode,
    cert_store: Option<CertStore>,
    trust_ca: Vec<PathBuf>,
    client_cert: Option<X509>,
    client_key: Option<PKey<Private>>,
    verify_depth: Option<u32>,
    ciphers: Option<Vec<String>>,
    timeout: Option<Duration>,
    connector: Option<SslConnector>,
    generation: u64,
}

impl SslConfig {
    pub fn new() -> Self {
        SslConfig {
            verify_mode: SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
            cert_store: None,
            trust_ca: Vec::new(),
            client_cert: None,
            client_key: None,
            verify_depth: None,
            ciphers: None,
            timeout: None,
            connector: None,
            generation: 0,
        }
    }

    pub fn verify_mode(&self) -> SslVerifyMode {
        self.verify_mode
    }

    /// CA files and directories added with `add_trust_ca`, in order
    pub fn trust_ca(&self) -> &[PathBuf] {
        &self.trust_ca
    }

    pub fn client_cert(&self) -> Option<&X509> {
        self.client_cert.as_ref()
    }

    pub fn client_key(&self) -> Option<&PKey<Private>> {
        self.client_key.as_ref()
    }

    pub fn verify_depth(&self) -> Option<u32> {
        self.verify_depth
    }

    pub fn ciphers(&self) -> Option<&[String]> {
        self.ciphers.as_deref()
    }

    /// Handshake timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Counter bumped whenever a change invalidates established TLS state
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The OpenSSL connector for the current settings
    ///
    /// Built on first use after a change and cached until the next one.
    pub fn connector(&mut self) -> Result<SslConnector, TlsError> {
        if let Some(connector) = &self.connector {
            return Ok(connector.clone());
        }
        let connector = self.build_connector()?;
        self.connector = Some(connector.clone());
        Ok(connector)
    }

    fn build_connector(&self) -> Result<SslConnector, TlsError> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())?;
        builder.set_verify(self.verify_mode);

        if let Some(store) = &self.cert_store {
            builder.set_cert_store(store.to_x509_store()?);
        }

        // Added after the store so they land in whichever store is active
        for path in &self.trust_ca {
            if path.is_dir() {
                builder
                    .cert_store_mut()
                    .add_lookup(X509Lookup::hash_dir())?
                    .add_dir(&path.to_string_lossy(), SslFiletype::PEM)?;
            } else {
                builder.set_ca_file(path)?;
            }
        }

        if let Some(cert) = &self.client_cert {
            builder.set_certificate(cert)?;
        }
        if let Some(key) = &self.client_key {
            builder.set_private_key(key)?;
        }
        if self.client_cert.is_some() && self.client_key.is_some() {
            builder.check_private_key()?;
        }

        if let Some(depth) = self.verify_depth {
            builder.set_verify_depth(depth);
        }

        if let Some(ciphers) = &self.ciphers {
            // TLS 1.3 suites and the TLS <= 1.2 cipher list are configured separately
            let (suites, list): (Vec<&str>, Vec<&str>) = ciphers
                .iter()
                .map(String::as_str)
                .partition(|c| c.starts_with("TLS_"));
            if !list.is_empty() {
                builder.set_cipher_list(&list.join(":"))?;
            }
            if !suites.is_empty() {
                builder.set_ciphersuites(&suites.join(":"))?;
            }
        }

        Ok(builder.build())
    }

    fn changed(&mut self) {
        self.connector = None;
        self.generation += 1;
    }
}

impl Default for SslConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SslConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslConfig")
            .field("verify_mode", &self.verify_mode)
            .field("cert_store", &self.cert_store)
            .field("trust_ca", &self.trust_ca)
            .field("client_cert", &self.client_cert.is_some())
            .field("client_key", &self.client_key.is_some())
            .field("verify_depth", &self.verify_depth)
            .field("ciphers", &self.ciphers)
            .field("timeout", &self.timeout)
            .field("generation", &self.generation)
            .finish()
    }
}

impl SslConfigTarget for SslConfig {
    fn set_verify_mode(&mut self, mode: SslVerifyMode) {
        if self.verify_mode != mode {
            self.verify_mode = mode;
            self.changed();
        }
    }

    fn cert_store(&self) -> Option<&CertStore> {
        self.cert_store.as_ref()
    }

    fn set_cert_store(&mut self, store: CertStore) {
        let same = self
            .cert_store
            .as_ref()
            .is_some_and(|current| CertStore::ptr_eq(current, &store));
        if !same {
            self.cert_store = Some(store);
            self.changed();
        }
    }

    fn add_trust_ca(&mut self, path: &Path) {
        if !self.trust_ca.iter().any(|p| p == path) {
            self.trust_ca.push(path.to_path_buf());
            self.changed();
        }
    }

    fn set_client_cert(&mut self, cert: X509) {
        let same = match (&self.client_cert, cert.to_der()) {
            (Some(current), Ok(der)) => current.to_der().is_ok_and(|c| c == der),
            _ => false,
        };
        if !same {
            self.client_cert = Some(cert);
            self.changed();
        }
    }

    fn set_client_key(&mut self, key: PKey<Private>) {
        let same = self
            .client_key
            .as_ref()
            .is_some_and(|current| current.public_eq(&key));
        if !same {
            self.client_key = Some(key);
            self.changed();
        }
    }

    fn set_verify_depth(&mut self, depth: u32) {
        if self.verify_depth != Some(depth) {
            self.verify_depth = Some(depth);
            self.changed();
        }
    }

    fn cipher_list(&mut self) -> Option<&mut dyn CipherListTarget> {
        Some(self)
    }
}

impl CipherListTarget for SslConfig {
    fn set_ciphers(&mut self, ciphers: Option<&[String]>) {
        if self.ciphers.as_deref() != ciphers {
            self.ciphers = ciphers.map(<[String]>::to_vec);
            self.changed();
        }
    }
}
