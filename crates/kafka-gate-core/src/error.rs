//! Domain error types for the kafka-gate proxy.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
///
/// All of these are fatal: the process refuses to start on an invalid
/// configuration instead of guessing at runtime.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// The proxy needs at least one statically mapped broker to bootstrap.
    #[error("list of bootstrap server mappings must not be empty")]
    MissingBootstrapServers,

    /// The default listener IP could not be parsed.
    #[error("default listener IP '{0}' is not a valid IP address")]
    InvalidListenerIp(String),

    /// Deterministic port assignment needs a fixed starting port.
    #[error("dynamic.sequential_min_port must be set when dynamic.deterministic is enabled")]
    DeterministicRequiresMinPort,

    /// A statically configured listener sits inside the dynamic port range.
    #[error(
        "static listener '{address}' overlaps the dynamic port range {min_port}-{max_port}"
    )]
    StaticListenerInDynamicRange {
        address: String,
        min_port: u16,
        max_port: u16,
    },

    /// An auth plugin spec is enabled but incomplete.
    #[error("auth.{role}: {reason}")]
    AuthPlugin { role: &'static str, reason: String },

    /// The forward proxy target is malformed.
    #[error("forward proxy: {0}")]
    ForwardProxy(String),

    /// A token-info verifier could not be constructed.
    #[error("token-info verifier '{name}': {reason}")]
    TokenInfo { name: String, reason: String },
}

/// Errors raised while authenticating one connection.
///
/// None of these escalate past the connection that triggered them; every
/// variant maps to a closed client socket, never to an open one.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The plugin (or token-info verifier) rejected the credential.
    #[error("authentication denied: {0}")]
    Denied(String),

    /// No verdict arrived within the configured timeout. Equivalent to a deny.
    #[error("authentication timed out")]
    TimedOut,

    /// The plugin process failed, exited, or returned garbage.
    #[error("auth plugin error: {0}")]
    PluginError(String),

    /// A gateway peer did not present the expected magic tag.
    #[error("gateway magic mismatch")]
    MagicMismatch,

    /// The client handshake carried a credential we could not parse.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// I/O failure during the authentication exchange.
    #[error("auth I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that occur during proxy operation.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// TCP/IO connection error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The sequential port pool has no ports left.
    #[error("dynamic port pool exhausted (range {min_port}-{max_port})")]
    PoolExhausted { min_port: u16, max_port: u16 },

    /// Binding a listener socket failed.
    #[error("failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Dynamic listener provisioning failed part-way; nothing was registered.
    #[error("failed to provision listener for broker {broker_id}: {source}")]
    ProvisionFailed {
        broker_id: i32,
        #[source]
        source: std::io::Error,
    },

    /// Dynamic provisioning is disabled and the broker is not statically mapped.
    #[error("unknown broker {0}: dynamic listeners are disabled")]
    UnknownBroker(i32),

    /// An address-bearing response could not be rewritten (strict mode only).
    #[error("address rewrite failed: {message}")]
    RewriteFailed { message: String },

    /// Failed to decode a protocol message we are required to understand.
    #[error("protocol decode error: {message}")]
    ProtocolDecode { message: String },

    /// Failed to re-encode a rewritten protocol message.
    #[error("protocol encode error: {message}")]
    ProtocolEncode { message: String },

    /// One of the relay legs failed; both are closed, the client reconnects.
    #[error("relay I/O error: {0}")]
    RelayIo(std::io::Error),

    /// Authentication failure on this connection.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Invalid configuration surfaced during startup wiring. Process-fatal.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Shutdown signal received.
    #[error("proxy shutting down")]
    Shutdown,
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for authentication operations.
pub type AuthResult<T> = std::result::Result<T, AuthError>;
