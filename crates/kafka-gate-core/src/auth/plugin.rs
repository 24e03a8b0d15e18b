//! External auth plugin process transport.
//!
//! The configured command is spawned once and reused across connections.
//! Each authentication attempt is one logical call: a newline-delimited JSON
//! request on the plugin's stdin, answered by a JSON reply on its stdout.
//! Replies are correlated by a host-assigned id, so the plugin may answer
//! concurrent requests in any order.
//!
//! A dedicated reader task routes replies to their waiting callers. If the
//! plugin process exits or emits garbage, every pending call fails with
//! `PluginError` — a dead plugin can never let a connection through.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};

use super::{AuthVerdict, Authenticator, Credential, CredentialSource};

/// One request to the plugin process.
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    id: u64,
    op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    /// Base64-encoded opaque credential bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<String>,
}

/// One reply from the plugin process. Unknown fields are ignored so plugins
/// can evolve their side independently.
#[derive(Debug, Deserialize)]
struct WireReply {
    id: u64,
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    /// Base64-encoded credential produced by an `obtain` call.
    #[serde(default)]
    credential: Option<String>,
}

/// A supervised, long-lived auth plugin process.
pub struct PluginProcess {
    command: String,
    stdin: Mutex<ChildStdin>,
    pending: Arc<DashMap<u64, oneshot::Sender<WireReply>>>,
    next_id: AtomicU64,
    // Held so the child is reaped (and killed) when the host drops.
    _child: tokio::process::Child,
}

impl PluginProcess {
    /// Spawn the plugin command with its configured parameters.
    ///
    /// # Errors
    ///
    /// Returns `PluginError` if the process cannot be started or its stdio
    /// pipes are unavailable.
    pub fn spawn(command: &str, parameters: &[String]) -> AuthResult<Self> {
        let mut child = Command::new(command)
            .args(parameters)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AuthError::PluginError(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AuthError::PluginError("plugin stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AuthError::PluginError("plugin stdout unavailable".to_string()))?;

        let pending: Arc<DashMap<u64, oneshot::Sender<WireReply>>> = Arc::new(DashMap::new());
        let reader_pending = Arc::clone(&pending);
        let reader_command = command.to_string();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<WireReply>(&line) {
                        Ok(reply) => {
                            if let Some((_, tx)) = reader_pending.remove(&reply.id) {
                                let _ = tx.send(reply);
                            } else {
                                warn!(command = %reader_command, id = reply.id, "unmatched plugin reply");
                            }
                        }
                        Err(e) => {
                            warn!(command = %reader_command, error = %e, "unparseable plugin reply");
                        }
                    },
                    Ok(None) | Err(_) => break,
                }
            }
            debug!(command = %reader_command, "plugin stdout closed, failing pending calls");
            // Dropping the senders wakes every waiter with an error.
            reader_pending.clear();
        });

        debug!(command = %command, "auth plugin process started");

        Ok(Self {
            command: command.to_string(),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            _child: child,
        })
    }

    /// The command this process runs (log context).
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    async fn call(&self, mut request: WireRequest<'_>) -> AuthResult<WireReply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request.id = id;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let mut line = serde_json::to_vec(&request)
            .map_err(|e| AuthError::PluginError(format!("request encoding failed: {e}")))?;
        line.push(b'\n');

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(&line).await {
                self.pending.remove(&id);
                return Err(AuthError::PluginError(format!(
                    "write to plugin '{}' failed: {e}",
                    self.command
                )));
            }
            if let Err(e) = stdin.flush().await {
                self.pending.remove(&id);
                return Err(AuthError::PluginError(format!(
                    "flush to plugin '{}' failed: {e}",
                    self.command
                )));
            }
        }

        rx.await.map_err(|_| {
            AuthError::PluginError(format!("plugin process '{}' exited", self.command))
        })
    }

    fn request_for<'a>(op: &'static str, credential: &'a Credential) -> WireRequest<'a> {
        let mut request = WireRequest {
            id: 0,
            op,
            username: None,
            password: None,
            token: None,
            raw: None,
        };
        match credential {
            Credential::Plain { username, password } => {
                request.username = Some(username);
                request.password = Some(password);
            }
            Credential::Token { token } => {
                request.token = Some(token);
            }
            Credential::Raw { bytes } => {
                request.raw = Some(BASE64.encode(bytes));
            }
        }
        request
    }
}

#[async_trait]
impl Authenticator for PluginProcess {
    async fn authenticate(&self, credential: &Credential) -> AuthResult<AuthVerdict> {
        let reply = self
            .call(Self::request_for("authenticate", credential))
            .await?;

        if reply.allowed {
            Ok(AuthVerdict::allow(reply.identity))
        } else {
            Ok(AuthVerdict::deny(
                reply.reason.unwrap_or_else(|| "denied by plugin".to_string()),
            ))
        }
    }
}

#[async_trait]
impl CredentialSource for PluginProcess {
    async fn obtain(&self) -> AuthResult<Vec<u8>> {
        let reply = self
            .call(WireRequest {
                id: 0,
                op: "obtain",
                username: None,
                password: None,
                token: None,
                raw: None,
            })
            .await?;

        let encoded = reply.credential.ok_or_else(|| {
            AuthError::PluginError("obtain reply carried no credential".to_string())
        })?;
        BASE64
            .decode(encoded)
            .map_err(|e| AuthError::PluginError(format!("obtain reply not base64: {e}")))
    }
}
