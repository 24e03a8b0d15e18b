//! Pluggable authentication framework.
//!
//! The accept/reject decision for a connection is delegated to an
//! [`Authenticator`] — a narrow, one-method capability. The production
//! implementation talks to an external plugin process ([`plugin`]); the
//! bearer-token path uses an in-process token-info verifier ([`token_info`]);
//! tests substitute scripted doubles. [`AuthPluginHost`] wraps whichever
//! transport is configured and enforces the per-role timeout, so the
//! connection state machine never blocks indefinitely on a slow plugin.
//!
//! Roles:
//! - **local** — end-client authentication, intercepted from the SASL
//!   handshake ([`local`]);
//! - **gateway client / gateway server** — mutual authentication between
//!   chained proxies, guarded by a magic handshake tag ([`gateway`]).
//!
//! Every non-allowed outcome terminates the connection before any broker
//! dial: fail closed, never fail open.

pub mod gateway;
pub mod local;
pub mod plugin;
pub mod token_info;

pub use gateway::{GatewayClientAuth, GatewayServerAuth};
pub use local::LocalAuthenticator;
pub use plugin::PluginProcess;
pub use token_info::{TokenInfo, TokenInfoAuthenticator, TokenInfoRegistry};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};

/// Outcome of one authentication attempt. Scoped to one connection's setup
/// phase.
#[derive(Debug, Clone)]
pub struct AuthVerdict {
    pub allowed: bool,
    /// Verified principal (e.g. an email claim), when the backend provides one.
    pub identity: Option<String>,
    pub failure_reason: Option<String>,
}

impl AuthVerdict {
    /// An allowing verdict carrying an optional identity.
    #[must_use]
    pub fn allow(identity: Option<String>) -> Self {
        Self {
            allowed: true,
            identity,
            failure_reason: None,
        }
    }

    /// A denying verdict with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            identity: None,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Credential material extracted from a connection handshake.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Password-style mechanism.
    Plain { username: String, password: String },
    /// Bearer-token mechanism.
    Token { token: String },
    /// Opaque bytes, used by the gateway exchange.
    Raw { bytes: Vec<u8> },
}

/// The narrow verification capability every auth transport implements.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Decide whether the credential is acceptable.
    async fn authenticate(&self, credential: &Credential) -> AuthResult<AuthVerdict>;
}

/// Producer of credential material, used by the gateway client side to
/// obtain the blob it presents to the upstream proxy.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Produce the credential bytes to present.
    async fn obtain(&self) -> AuthResult<Vec<u8>>;
}

/// Which handshake a plugin host serves. Used for log context only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRole {
    Local,
    GatewayClient,
    GatewayServer,
}

impl std::fmt::Display for AuthRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::GatewayClient => write!(f, "gateway-client"),
            Self::GatewayServer => write!(f, "gateway-server"),
        }
    }
}

/// Supervises one configured authenticator: enforces the verdict deadline and
/// maps every failure mode to a closed connection.
pub struct AuthPluginHost {
    role: AuthRole,
    authenticator: Arc<dyn Authenticator>,
    deadline: Duration,
}

impl AuthPluginHost {
    /// Create a host for one role.
    #[must_use]
    pub fn new(role: AuthRole, authenticator: Arc<dyn Authenticator>, deadline: Duration) -> Self {
        Self {
            role,
            authenticator,
            deadline,
        }
    }

    /// The role this host serves.
    #[must_use]
    pub fn role(&self) -> AuthRole {
        self.role
    }

    /// Obtain a verdict for the credential, bounded by the configured
    /// deadline. A timeout is equivalent to a deny; it never blocks other
    /// connections' attempts.
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` when no verdict arrives in time, or whatever error
    /// the underlying transport produced.
    pub async fn verify(&self, credential: &Credential) -> AuthResult<AuthVerdict> {
        match timeout(self.deadline, self.authenticator.authenticate(credential)).await {
            Ok(Ok(verdict)) => {
                if verdict.allowed {
                    debug!(role = %self.role, identity = ?verdict.identity, "authentication allowed");
                } else {
                    warn!(
                        role = %self.role,
                        reason = ?verdict.failure_reason,
                        "authentication denied"
                    );
                }
                Ok(verdict)
            }
            Ok(Err(e)) => {
                warn!(role = %self.role, error = %e, "authentication error");
                Err(e)
            }
            Err(_) => {
                warn!(role = %self.role, deadline = ?self.deadline, "authentication timed out");
                Err(AuthError::TimedOut)
            }
        }
    }
}
