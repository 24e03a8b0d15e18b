//! Configuration types for the kafka-gate proxy.
//!
//! Configuration is loaded from YAML files and validated before use. The rest
//! of the crate trusts a validated `ProxyConfig`: non-negative timeouts,
//! parseable addresses, complete plugin specs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Listener and address-mapping configuration.
    pub proxy: ListenersConfig,

    /// Upstream (broker-side) connection configuration.
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Pluggable authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Optional HTTP CONNECT / SOCKS5 forward proxy for broker dialing.
    #[serde(default)]
    pub forward_proxy: Option<ForwardProxyConfig>,

    /// Address rewriting behavior.
    #[serde(default)]
    pub rewrite: RewriteConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-side configuration: static mappings, dynamic provisioning, socket
/// tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenersConfig {
    /// IP the proxy binds dynamically provisioned listeners to.
    #[serde(default = "default_listener_ip")]
    pub default_listener_ip: String,

    /// Static broker mappings used to bootstrap the cluster connection.
    pub bootstrap_servers: Vec<StaticMapping>,

    /// Additional static broker mappings beyond the bootstrap set.
    #[serde(default)]
    pub external_servers: Vec<StaticMapping>,

    /// Dynamic listener provisioning.
    #[serde(default)]
    pub dynamic: DynamicListenersConfig,

    /// Outbound dial-address overrides, applied before any broker dial.
    #[serde(default)]
    pub dial_mappings: Vec<DialMapping>,

    /// TCP keep-alive for accepted client sockets. Zero disables it.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// SO_RCVBUF for accepted client sockets. Zero keeps the OS default.
    #[serde(default)]
    pub read_buffer_size: usize,

    /// SO_SNDBUF for accepted client sockets. Zero keeps the OS default.
    #[serde(default)]
    pub write_buffer_size: usize,
}

/// One statically configured broker mapping.
///
/// `advertised_address` defaults to `listener_address` when not set; it only
/// differs when clients reach the proxy through NAT or a load balancer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticMapping {
    /// Real broker address the proxy dials (host:port).
    pub broker_address: String,

    /// Local address the proxy binds for this broker (host:port).
    pub listener_address: String,

    /// Address announced to clients in rewritten responses (host:port).
    #[serde(default)]
    pub advertised_address: Option<String>,
}

impl StaticMapping {
    /// The address announced to clients, falling back to the listener address.
    #[must_use]
    pub fn get_advertised_address(&self) -> &str {
        self.advertised_address
            .as_deref()
            .unwrap_or(&self.listener_address)
    }
}

/// Outbound dial override: connections destined for `source_address` are
/// dialed against `destination_address` instead. Read-only after startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DialMapping {
    pub source_address: String,
    pub destination_address: String,
}

/// Dynamic listener provisioning settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DynamicListenersConfig {
    /// Disable dynamic listeners entirely; only statically mapped brokers are
    /// served and unknown brokers abort the triggering connection.
    #[serde(default)]
    pub disabled: bool,

    /// First port of the sequential allocation range. Zero means OS-assigned
    /// ephemeral ports.
    #[serde(default)]
    pub sequential_min_port: u16,

    /// Number of ports in the sequential range. Zero extends the range to
    /// port 65535.
    #[serde(default)]
    pub max_ports: u16,

    /// Repeatable broker-to-port assignment across restarts. Requires
    /// `sequential_min_port`; clients that hard-code proxy ports depend on it.
    #[serde(default)]
    pub deterministic: bool,

    /// Hostname announced for dynamically provisioned listeners. Defaults to
    /// the default listener IP.
    #[serde(default)]
    pub advertised_host: Option<String>,
}

impl DynamicListenersConfig {
    /// Whether dynamic provisioning uses the sequential port range.
    #[must_use]
    pub fn sequential(&self) -> bool {
        self.sequential_min_port > 0
    }

    /// Last port of the sequential range, inclusive.
    #[must_use]
    pub fn max_port(&self) -> u16 {
        if self.sequential_min_port == 0 {
            return 0;
        }
        if self.max_ports == 0 {
            return u16::MAX;
        }
        let span = u32::from(self.sequential_min_port) + u32::from(self.max_ports) - 1;
        span.min(u32::from(u16::MAX)) as u16
    }
}

/// Upstream (broker-side) connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// How long to wait for the initial broker connection.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// TCP keep-alive for broker-side sockets. Zero disables it.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// SO_RCVBUF for broker-side sockets. Zero keeps the OS default.
    #[serde(default)]
    pub read_buffer_size: usize,

    /// SO_SNDBUF for broker-side sockets. Zero keeps the OS default.
    #[serde(default)]
    pub write_buffer_size: usize,

    /// Maximum accepted frame size on either relay direction.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl KafkaConfig {
    /// Dial timeout as a `Duration`.
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            read_buffer_size: 0,
            write_buffer_size: 0,
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Authentication configuration, one spec per role.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// End-client authentication on accepted connections.
    #[serde(default)]
    pub local: Option<LocalAuthConfig>,

    /// Gateway authentication performed against a chained upstream proxy.
    #[serde(default)]
    pub gateway_client: Option<GatewayAuthConfig>,

    /// Gateway authentication required from chained downstream proxies.
    #[serde(default)]
    pub gateway_server: Option<GatewayAuthConfig>,
}

/// Mechanism used to extract credentials from the client handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum LocalAuthMechanism {
    /// Password-style `\0user\0pass` exchange.
    #[default]
    #[serde(rename = "PLAIN")]
    Plain,
    /// OAuth 2.0 bearer token exchange (RFC 7628 framing).
    #[serde(rename = "OAUTHBEARER")]
    OauthBearer,
}

impl LocalAuthMechanism {
    /// The mechanism name as it appears in the wire handshake.
    #[must_use]
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::OauthBearer => "OAUTHBEARER",
        }
    }
}

/// End-client authentication spec.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalAuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Credential extraction mechanism.
    #[serde(default)]
    pub mechanism: LocalAuthMechanism,

    /// External plugin command deciding the verdict. May be empty for the
    /// bearer-token mechanism when a token-info verifier is configured.
    #[serde(default)]
    pub command: String,

    /// Opaque parameters passed to the plugin process.
    #[serde(default)]
    pub parameters: Vec<String>,

    /// Verdict deadline; expiry is equivalent to a deny.
    #[serde(default = "default_auth_timeout_ms")]
    pub timeout_ms: u64,

    /// In-process token-info verifier for the bearer-token mechanism.
    #[serde(default)]
    pub token_info: Option<TokenInfoConfig>,
}

impl LocalAuthConfig {
    /// Verdict deadline as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Token-info verifier selection: a name resolved against the in-process
/// registry plus flag-style parameters the factory parses itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenInfoConfig {
    pub name: String,

    #[serde(default)]
    pub parameters: Vec<String>,

    /// Audiences every accepted token must carry.
    #[serde(default)]
    pub required_audiences: Vec<String>,
}

/// Gateway (proxy-to-proxy) authentication spec.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayAuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fixed-width handshake tag exchanged before any credential bytes.
    /// Non-gateway peers are rejected on this alone.
    pub magic: u64,

    /// External plugin command (verifier server-side, credential source
    /// client-side).
    pub command: String,

    /// Opaque parameters passed to the plugin process.
    #[serde(default)]
    pub parameters: Vec<String>,

    /// Verdict deadline; expiry is equivalent to a deny.
    #[serde(default = "default_auth_timeout_ms")]
    pub timeout_ms: u64,
}

impl GatewayAuthConfig {
    /// Verdict deadline as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Forward proxy scheme for outbound broker connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProxyScheme {
    Http,
    Socks5,
}

/// Forward proxy target for outbound broker connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwardProxyConfig {
    pub scheme: ForwardProxyScheme,

    /// Proxy address (host:port).
    pub address: String,

    /// Supports environment variable expansion: "${PROXY_USERNAME}".
    #[serde(default)]
    pub username: Option<String>,

    /// Supports environment variable expansion: "${PROXY_PASSWORD}".
    #[serde(default)]
    pub password: Option<String>,
}

impl ForwardProxyConfig {
    /// Username with environment variables expanded.
    #[must_use]
    pub fn username(&self) -> Option<String> {
        self.username.as_deref().map(expand_env_vars)
    }

    /// Password with environment variables expanded.
    #[must_use]
    pub fn password(&self) -> Option<String> {
        self.password.as_deref().map(expand_env_vars)
    }
}

/// Address rewriting behavior.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RewriteConfig {
    /// Tear the connection down on a malformed address-bearing frame instead
    /// of forwarding it unmodified.
    #[serde(default)]
    pub strict: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_listener_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_dial_timeout_ms() -> u64 {
    15_000
}

fn default_auth_timeout_ms() -> u64 {
    10_000
}

fn default_max_frame_size() -> usize {
    100 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable
/// `VAR_NAME`. Unset variables expand to an empty string.
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

/// Split a `host:port` string, tolerating IPv6 bracket notation.
///
/// # Errors
///
/// Returns an error if the string has no port separator or the port does not
/// parse.
pub fn split_host_port(address: &str) -> ConfigResult<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(address.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(address.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ConfigError::InvalidAddress(address.to_string()));
    }
    Ok((host.to_string(), port))
}

// Configuration loading and validation

impl ProxyConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// All static mappings: bootstrap first, then external, preserving
    /// configuration order so deterministic pools see a stable sequence.
    #[must_use]
    pub fn static_mappings(&self) -> impl Iterator<Item = &StaticMapping> {
        self.proxy
            .bootstrap_servers
            .iter()
            .chain(self.proxy.external_servers.iter())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.proxy.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingBootstrapServers);
        }

        if self.proxy.default_listener_ip.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidListenerIp(
                self.proxy.default_listener_ip.clone(),
            ));
        }

        for mapping in self.static_mappings() {
            split_host_port(&mapping.broker_address)?;
            split_host_port(&mapping.listener_address)?;
            if let Some(advertised) = &mapping.advertised_address {
                split_host_port(advertised)?;
            }
        }

        for mapping in &self.proxy.dial_mappings {
            split_host_port(&mapping.source_address)?;
            split_host_port(&mapping.destination_address)?;
        }

        self.validate_dynamic()?;
        self.validate_auth()?;

        if let Some(proxy) = &self.forward_proxy {
            split_host_port(&proxy.address)
                .map_err(|_| ConfigError::ForwardProxy(format!(
                    "invalid address '{}'",
                    proxy.address
                )))?;
            if proxy.username.is_some() != proxy.password.is_some() {
                return Err(ConfigError::ForwardProxy(
                    "username and password must both be provided".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn validate_dynamic(&self) -> ConfigResult<()> {
        let dynamic = &self.proxy.dynamic;
        if dynamic.disabled {
            return Ok(());
        }

        if dynamic.deterministic && !dynamic.sequential() {
            // Deterministic assignment cannot work with OS-allocated
            // ephemeral ports.
            return Err(ConfigError::DeterministicRequiresMinPort);
        }

        if dynamic.sequential() {
            let (min_port, max_port) = (dynamic.sequential_min_port, dynamic.max_port());
            for mapping in self.static_mappings() {
                let (_, port) = split_host_port(&mapping.listener_address)?;
                if port >= min_port && port <= max_port {
                    return Err(ConfigError::StaticListenerInDynamicRange {
                        address: mapping.listener_address.clone(),
                        min_port,
                        max_port,
                    });
                }
            }
        }

        Ok(())
    }

    fn validate_auth(&self) -> ConfigResult<()> {
        if let Some(local) = &self.auth.local {
            if local.enabled {
                if local.timeout_ms == 0 {
                    return Err(ConfigError::AuthPlugin {
                        role: "local",
                        reason: "timeout_ms must be greater than 0".to_string(),
                    });
                }
                let has_verifier = local.token_info.is_some()
                    && local.mechanism == LocalAuthMechanism::OauthBearer;
                if local.command.is_empty() && !has_verifier {
                    return Err(ConfigError::AuthPlugin {
                        role: "local",
                        reason: "command is required (or token_info for OAUTHBEARER)"
                            .to_string(),
                    });
                }
            }
        }

        for (role, gateway) in [
            ("gateway_client", &self.auth.gateway_client),
            ("gateway_server", &self.auth.gateway_server),
        ] {
            if let Some(gateway) = gateway {
                if !gateway.enabled {
                    continue;
                }
                if gateway.command.is_empty() {
                    return Err(ConfigError::AuthPlugin {
                        role,
                        reason: "command is required".to_string(),
                    });
                }
                if gateway.magic == 0 {
                    return Err(ConfigError::AuthPlugin {
                        role,
                        reason: "magic must be non-zero".to_string(),
                    });
                }
                if gateway.timeout_ms == 0 {
                    return Err(ConfigError::AuthPlugin {
                        role,
                        reason: "timeout_ms must be greater than 0".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}
