//! SSL option mapping
//!
//! `SslOptions` is the declarative, library-neutral description of how a
//! request wants TLS to behave. `SslConfigurator` writes those options onto
//! the agent's native TLS configuration (anything implementing
//! `SslConfigTarget`).
//!
//! Resolution rules:
//!
//! - verify mode: an explicit `verify_mode` wins; otherwise `verify: false`
//!   means `NONE`; otherwise `PEER | FAIL_IF_NO_PEER_CERT`
//! - cert store: an explicit `cert_store` wins; otherwise one store of the
//!   platform default trust anchors, created once per configurator and
//!   handed out on every call so the agent's TLS state is not rebuilt
//! - `ca_file`, `ca_path`, `client_cert`, `client_key`, `verify_depth` are
//!   copied when present and leave the target untouched when absent
//! - ciphers are only written when the target reports cipher-list support
//!
//! The configurator validates nothing. OpenSSL reports bad paths, credentials
//! or cipher names when the agent builds its connector.

use crate::agent::Agent;
use crate::http::tls::{CertStore, SslConfigTarget};
use once_cell::sync::OnceCell;
use openssl::pkey::{PKey, Private};
use openssl::ssl::SslVerifyMode;
use openssl::x509::X509;
use std::path::PathBuf;
use tracing::{debug, trace};

/// Requested TLS behavior for a request
///
/// Every field is optional; `None` means "use the default".
#[derive(Debug, Clone, Default)]
pub struct SslOptions {
    pub verify: Option<bool>,
    pub verify_mode: Option<SslVerifyMode>,
    pub cert_store: Option<CertStore>,
    pub ca_file: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub client_cert: Option<X509>,
    pub client_key: Option<PKey<Private>>,
    pub verify_depth: Option<u32>,
    pub ciphers: Option<Vec<String>>,
}

impl SslOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify the peer certificate (default true)
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = Some(verify);
        self
    }

    /// Exact OpenSSL verify mode, overriding `verify`
    pub fn verify_mode(mut self, mode: SslVerifyMode) -> Self {
        self.verify_mode = Some(mode);
        self
    }

    pub fn cert_store(mut self, store: CertStore) -> Self {
        self.cert_store = Some(store);
        self
    }

    /// PEM file of additional trust anchors
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Hashed directory of additional trust anchors
    pub fn ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, cert: X509) -> Self {
        self.client_cert = Some(cert);
        self
    }

    pub fn client_key(mut self, key: PKey<Private>) -> Self {
        self.client_key = Some(key);
        self
    }

    /// Maximum certificate chain depth
    pub fn verify_depth(mut self, depth: u32) -> Self {
        self.verify_depth = Some(depth);
        self
    }

    /// Ordered cipher identifiers (TLS 1.3 suite names or OpenSSL cipher names)
    pub fn ciphers<I, S>(mut self, ciphers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ciphers = Some(ciphers.into_iter().map(Into::into).collect());
        self
    }
}

/// Resolve the verify mode for a set of options
///
/// Precedence: explicit `verify_mode`, then `verify: false`, then the
/// verifying default.
pub fn resolve_verify_mode(ssl: &SslOptions) -> SslVerifyMode {
    match (ssl.verify_mode, ssl.verify) {
        (Some(mode), _) => mode,
        (None, Some(false)) => SslVerifyMode::NONE,
        (None, Some(true) | None) => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
    }
}

/// Applies `SslOptions` to TLS configuration targets
///
/// Keep one configurator per agent (the adapter does): the default cert
/// store it creates is reused by every later call, which lets the agent keep
/// its TLS connector and kept-alive connection.
#[derive(Debug, Default)]
pub struct SslConfigurator {
    default_store: OnceCell<CertStore>,
}

impl SslConfigurator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure an agent's TLS settings from `ssl`
    pub fn configure_agent(&self, agent: &mut Agent, ssl: &SslOptions) {
        self.configure(agent.ssl_config_mut(), ssl);
    }

    /// Write `ssl` onto a TLS configuration target
    pub fn configure<T>(&self, target: &mut T, ssl: &SslOptions)
    where
        T: SslConfigTarget + ?Sized,
    {
        let mode = resolve_verify_mode(ssl);
        debug!(verify_mode = ?mode, explicit_store = ssl.cert_store.is_some(), "configuring TLS");

        target.set_verify_mode(mode);
        target.set_cert_store(self.cert_store(ssl));

        if let Some(ca_file) = &ssl.ca_file {
            target.add_trust_ca(ca_file);
        }
        if let Some(ca_path) = &ssl.ca_path {
            target.add_trust_ca(ca_path);
        }
        if let Some(cert) = &ssl.client_cert {
            target.set_client_cert(cert.clone());
        }
        if let Some(key) = &ssl.client_key {
            target.set_client_key(key.clone());
        }
        if let Some(depth) = ssl.verify_depth {
            target.set_verify_depth(depth);
        }

        match target.cipher_list() {
            Some(ciphers) => ciphers.set_ciphers(ssl.ciphers.as_deref()),
            None => trace!("target has no cipher-list support, leaving ciphers alone"),
        }
    }

    /// The store handed out when options carry none
    pub fn default_cert_store(&self) -> &CertStore {
        self.default_store.get_or_init(CertStore::default_paths)
    }

    fn cert_store(&self, ssl: &SslOptions) -> CertStore {
        match &ssl.cert_store {
            Some(store) => store.clone(),
            None => self.default_cert_store().clone(),
        }
    }
}
