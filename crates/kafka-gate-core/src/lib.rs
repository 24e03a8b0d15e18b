//! kafka-gate core library
//!
//! A transparent proxy between Kafka clients and the brokers of a cluster
//! the clients cannot reach directly. The proxy provisions one local
//! listener per broker — statically from configuration or dynamically on
//! first discovery — and rewrites the broker addresses inside discovery
//! responses so clients are redirected back through it. Connection
//! establishment can be gated by a pluggable authentication framework whose
//! accept/reject decision lives in an external, process-isolated plugin.
//!
//! # Architecture
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`network`] - Port pool, listener directory, frame codecs, dialing and
//!   the per-connection relay pipeline
//! - [`rewrite`] - Address rewriting over the discovery-response subset
//! - [`auth`] - Pluggable authentication (local SASL interception, gateway
//!   mutual auth, plugin process supervision, token-info verifiers)
//! - [`server`] - Startup wiring

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod error;
pub mod network;
pub mod rewrite;
pub mod server;

/// Test utilities: mock broker and auth doubles.
///
/// Only available when compiling tests or with the `testing` feature.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use auth::{AuthPluginHost, AuthRole, AuthVerdict, Authenticator, Credential};
pub use config::ProxyConfig;
pub use error::{AuthError, ConfigError, ProxyError, Result};
pub use network::{BrokerEndpoint, ListenerDirectory, ListenerMapping};
pub use rewrite::AddressRewriter;
pub use server::ProxyServer;
