//! httpclient-adapter - HTTP adapter over a blocking HTTP/1.1 agent
//!
//! This crate lets an HTTP client abstraction (an [`adapter::Env`] record
//! passed through the [`adapter::Adapter`] trait) delegate requests to
//! [`agent::Agent`], a blocking HTTP/1.1 client with OpenSSL-backed TLS.
//!
//! The interesting piece is [`ssl::SslConfigurator`], which translates
//! declarative [`ssl::SslOptions`] into the agent's mutable
//! [`http::tls::SslConfig`].

pub mod adapter;
pub mod agent;
pub mod http;
pub mod ssl;

pub use adapter::{Adapter, AdapterError, Env, HttpClientAdapter, ProxyOptions, RequestOptions};
pub use agent::{Agent, ProxyConfig};
pub use ssl::{SslConfigurator, SslOptions};
