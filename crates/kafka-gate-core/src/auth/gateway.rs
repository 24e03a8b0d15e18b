//! Gateway (proxy-to-proxy) mutual authentication.
//!
//! When proxies are chained, the downstream proxy authenticates itself to the
//! upstream one before any Kafka traffic flows. The exchange is deliberately
//! minimal:
//!
//! ```text
//! client proxy                          server proxy
//!   magic tag (u64 BE)      ------->    compare; mismatch = immediate deny
//!   credential length (u32) ------->
//!   credential blob         ------->    verify via plugin
//!   status byte (0 = ok)    <-------
//! ```
//!
//! The magic check rejects non-gateway peers before the plugin is ever
//! invoked; the credential blob is opaque to the proxy on both sides.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};

use super::{AuthPluginHost, AuthVerdict, Credential, CredentialSource};

/// Upper bound for the credential blob; anything larger is malformed.
const MAX_CREDENTIAL_LEN: u32 = 64 * 1024;

const STATUS_OK: u8 = 0;
const STATUS_DENIED: u8 = 1;

/// Server side: verifies credentials presented by chained downstream proxies.
pub struct GatewayServerAuth {
    magic: u64,
    host: AuthPluginHost,
}

impl GatewayServerAuth {
    /// Create the server-side gateway authenticator.
    #[must_use]
    pub fn new(magic: u64, host: AuthPluginHost) -> Self {
        Self { magic, host }
    }

    /// Run the server side of the exchange on a freshly accepted socket.
    ///
    /// # Errors
    ///
    /// `MagicMismatch` when the peer is not a gateway (the plugin is never
    /// invoked), `Denied`/`TimedOut`/`PluginError` per the verdict, or an I/O
    /// error if the peer hangs up mid-exchange.
    pub async fn authenticate<S>(&self, stream: &mut S) -> AuthResult<AuthVerdict>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut magic = [0u8; 8];
        stream.read_exact(&mut magic).await?;
        if u64::from_be_bytes(magic) != self.magic {
            warn!("gateway peer presented wrong magic tag");
            return Err(AuthError::MagicMismatch);
        }

        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await?;
        let len = u32::from_be_bytes(len);
        if len == 0 || len > MAX_CREDENTIAL_LEN {
            return Err(AuthError::InvalidCredential(format!(
                "gateway credential length {len} out of bounds"
            )));
        }

        let mut bytes = vec![0u8; len as usize];
        stream.read_exact(&mut bytes).await?;

        let verdict = self.host.verify(&Credential::Raw { bytes }).await;
        match verdict {
            Ok(verdict) if verdict.allowed => {
                stream.write_all(&[STATUS_OK]).await?;
                stream.flush().await?;
                debug!(identity = ?verdict.identity, "gateway peer authenticated");
                Ok(verdict)
            }
            Ok(verdict) => {
                stream.write_all(&[STATUS_DENIED]).await?;
                stream.flush().await?;
                Err(AuthError::Denied(
                    verdict
                        .failure_reason
                        .unwrap_or_else(|| "gateway credential rejected".to_string()),
                ))
            }
            Err(e) => {
                // Best-effort denial notice; the verdict error is what counts.
                let _ = stream.write_all(&[STATUS_DENIED]).await;
                Err(e)
            }
        }
    }
}

/// Client side: presents this proxy's credential to a chained upstream proxy.
pub struct GatewayClientAuth {
    magic: u64,
    source: Arc<dyn CredentialSource>,
    deadline: Duration,
}

impl GatewayClientAuth {
    /// Create the client-side gateway authenticator.
    #[must_use]
    pub fn new(magic: u64, source: Arc<dyn CredentialSource>, deadline: Duration) -> Self {
        Self {
            magic,
            source,
            deadline,
        }
    }

    /// Run the client side of the exchange on a freshly dialed socket.
    ///
    /// # Errors
    ///
    /// `TimedOut` when the plugin does not produce a credential in time,
    /// `Denied` when the upstream proxy rejects it, or an I/O error.
    pub async fn authenticate<S>(&self, stream: &mut S) -> AuthResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let bytes = timeout(self.deadline, self.source.obtain())
            .await
            .map_err(|_| AuthError::TimedOut)??;
        if bytes.is_empty() || bytes.len() > MAX_CREDENTIAL_LEN as usize {
            return Err(AuthError::PluginError(format!(
                "plugin produced a credential of {} bytes",
                bytes.len()
            )));
        }

        stream.write_all(&self.magic.to_be_bytes()).await?;
        stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;

        let mut status = [0u8; 1];
        stream.read_exact(&mut status).await?;
        if status[0] != STATUS_OK {
            return Err(AuthError::Denied(
                "upstream gateway rejected credential".to_string(),
            ));
        }

        debug!("gateway client authentication accepted upstream");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthRole, Authenticator};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAuthenticator {
        allow: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn authenticate(&self, _credential: &Credential) -> AuthResult<AuthVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.allow {
                Ok(AuthVerdict::allow(Some("peer-proxy".to_string())))
            } else {
                Ok(AuthVerdict::deny("not on the list"))
            }
        }
    }

    struct StaticCredentialSource(Vec<u8>);

    #[async_trait]
    impl CredentialSource for StaticCredentialSource {
        async fn obtain(&self) -> AuthResult<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    fn server(allow: bool) -> (GatewayServerAuth, Arc<CountingAuthenticator>) {
        let authenticator = Arc::new(CountingAuthenticator {
            allow,
            calls: AtomicUsize::new(0),
        });
        let host = AuthPluginHost::new(
            AuthRole::GatewayServer,
            Arc::clone(&authenticator) as Arc<dyn Authenticator>,
            Duration::from_secs(1),
        );
        (GatewayServerAuth::new(0xCAFE_F00D, host), authenticator)
    }

    #[tokio::test]
    async fn test_mutual_exchange_succeeds() {
        let (server_auth, plugin) = server(true);
        let client_auth = GatewayClientAuth::new(
            0xCAFE_F00D,
            Arc::new(StaticCredentialSource(b"proxy-credential".to_vec())),
            Duration::from_secs(1),
        );

        let (mut client_side, mut server_side) = tokio::io::duplex(1024);

        let server_task =
            tokio::spawn(async move { server_auth.authenticate(&mut server_side).await });
        client_auth.authenticate(&mut client_side).await.unwrap();

        let verdict = server_task.await.unwrap().unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.identity.as_deref(), Some("peer-proxy"));
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_magic_mismatch_skips_plugin() {
        let (server_auth, plugin) = server(true);
        let (mut client_side, mut server_side) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move { server_auth.authenticate(&mut server_side).await });

        // A peer that is not a gateway writes the wrong tag.
        client_side.write_all(&0xDEAD_BEEFu64.to_be_bytes()).await.unwrap();

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(AuthError::MagicMismatch)));
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_denied_credential() {
        let (server_auth, _plugin) = server(false);
        let client_auth = GatewayClientAuth::new(
            0xCAFE_F00D,
            Arc::new(StaticCredentialSource(b"bad".to_vec())),
            Duration::from_secs(1),
        );

        let (mut client_side, mut server_side) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move { server_auth.authenticate(&mut server_side).await });

        let client_result = client_auth.authenticate(&mut client_side).await;
        assert!(matches!(client_result, Err(AuthError::Denied(_))));
        assert!(matches!(server_task.await.unwrap(), Err(AuthError::Denied(_))));
    }

    #[tokio::test]
    async fn test_oversized_credential_rejected() {
        let (server_auth, plugin) = server(true);
        let (mut client_side, mut server_side) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move { server_auth.authenticate(&mut server_side).await });

        client_side.write_all(&0xCAFE_F00Du64.to_be_bytes()).await.unwrap();
        client_side
            .write_all(&(MAX_CREDENTIAL_LEN + 1).to_be_bytes())
            .await
            .unwrap();

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(AuthError::InvalidCredential(_))));
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
    }
}
