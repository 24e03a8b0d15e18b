//! Proxy server wiring.
//!
//! Builds the directory, dialer, rewriter and auth stack from a validated
//! configuration, installs the per-connection service, binds the static
//! listeners and runs until shutdown. Configuration or bind failures here
//! are process-fatal; everything after startup is isolated per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::auth::{
    AuthPluginHost, AuthRole, Authenticator, CredentialSource, GatewayClientAuth,
    GatewayServerAuth, LocalAuthenticator, PluginProcess, TokenInfoAuthenticator,
    TokenInfoRegistry,
};
use crate::config::{LocalAuthMechanism, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::network::dialer::{BrokerDialer, SocketTuning};
use crate::network::directory::{ConnectionService, ListenerDirectory};
use crate::network::pipeline::{AuthStack, ConnectionPipeline};
use crate::rewrite::AddressRewriter;

/// The assembled proxy.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    directory: Arc<ListenerDirectory>,
    dialer: Arc<BrokerDialer>,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
}

impl ProxyServer {
    /// Build the proxy with the built-in token-info verifiers.
    ///
    /// # Errors
    ///
    /// Returns an error when an auth plugin cannot be spawned or a
    /// token-info verifier cannot be constructed. Must run inside a tokio
    /// runtime (plugin supervision spawns tasks).
    pub fn build(config: ProxyConfig) -> Result<Self> {
        Self::build_with_registry(config, &TokenInfoRegistry::with_builtins())
    }

    /// Build the proxy resolving token-info verifiers against the given
    /// registry.
    ///
    /// # Errors
    ///
    /// See [`ProxyServer::build`].
    pub fn build_with_registry(
        config: ProxyConfig,
        registry: &TokenInfoRegistry,
    ) -> Result<Self> {
        let config = Arc::new(config);

        let directory = Arc::new(ListenerDirectory::new(
            &config.proxy.default_listener_ip,
            &config.proxy.dynamic,
        )?);
        let shutdown_tx = directory.shutdown_handle();

        let dialer = Arc::new(BrokerDialer::new(
            &config.kafka,
            &config.proxy.dial_mappings,
            config.forward_proxy.clone(),
        ));

        let rewriter = Arc::new(AddressRewriter::new(
            Arc::clone(&directory),
            config.rewrite.strict,
        ));

        let auth = Arc::new(build_auth_stack(&config, registry)?);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let client_keep_alive = (config.proxy.keep_alive_secs > 0)
            .then(|| std::time::Duration::from_secs(config.proxy.keep_alive_secs));
        let service = PipelineService {
            rewriter,
            dialer: Arc::clone(&dialer),
            auth,
            max_frame_size: config.kafka.max_frame_size,
            tuning: SocketTuning {
                keep_alive: client_keep_alive,
                read_buffer_size: config.proxy.read_buffer_size,
                write_buffer_size: config.proxy.write_buffer_size,
            },
            shutdown_tx: shutdown_tx.clone(),
            active_connections: Arc::clone(&active_connections),
        };
        directory.set_service(Arc::new(service));

        Ok(Self {
            config,
            directory,
            dialer,
            shutdown_tx,
            active_connections,
        })
    }

    /// Handle used to stop the proxy.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// The listener directory (exposed for inspection and tests).
    #[must_use]
    pub fn directory(&self) -> &Arc<ListenerDirectory> {
        &self.directory
    }

    /// Number of broker dial attempts made so far (test hook).
    #[must_use]
    pub fn dial_attempts(&self) -> u64 {
        self.dialer.dial_attempts()
    }

    /// Current number of in-flight client connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind every static listener and serve until a shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns an error when any static listener cannot be bound — failing
    /// to serve a configured broker at startup is fatal.
    pub async fn run(&self) -> Result<()> {
        for mapping in self.config.static_mappings() {
            self.directory.bind_static(mapping).await?;
        }
        info!(
            static_listeners = self.config.proxy.bootstrap_servers.len()
                + self.config.proxy.external_servers.len(),
            dynamic = !self.config.proxy.dynamic.disabled,
            "proxy serving"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;

        info!("shutdown signal received");
        self.directory.shutdown().await;
        Ok(())
    }
}

/// Build the per-role authenticators from configuration.
fn build_auth_stack(config: &ProxyConfig, registry: &TokenInfoRegistry) -> Result<AuthStack> {
    let mut stack = AuthStack::default();

    if let Some(local) = &config.auth.local {
        if local.enabled {
            let authenticator: Arc<dyn Authenticator> = match (&local.token_info, local.mechanism)
            {
                (Some(token_info), LocalAuthMechanism::OauthBearer) => {
                    let verifier = registry.create(&token_info.name, &token_info.parameters)?;
                    Arc::new(TokenInfoAuthenticator::new(
                        verifier,
                        token_info.required_audiences.clone(),
                    ))
                }
                _ => Arc::new(
                    PluginProcess::spawn(&local.command, &local.parameters)
                        .map_err(ProxyError::Auth)?,
                ),
            };
            let host = AuthPluginHost::new(AuthRole::Local, authenticator, local.timeout());
            stack.local = Some(Arc::new(LocalAuthenticator::new(local.mechanism, host)));
            info!(mechanism = local.mechanism.mechanism_name(), "local auth enabled");
        }
    }

    if let Some(gateway) = &config.auth.gateway_server {
        if gateway.enabled {
            let plugin = PluginProcess::spawn(&gateway.command, &gateway.parameters)
                .map_err(ProxyError::Auth)?;
            let host = AuthPluginHost::new(
                AuthRole::GatewayServer,
                Arc::new(plugin),
                gateway.timeout(),
            );
            stack.gateway_server = Some(Arc::new(GatewayServerAuth::new(gateway.magic, host)));
            info!("gateway server auth enabled");
        }
    }

    if let Some(gateway) = &config.auth.gateway_client {
        if gateway.enabled {
            let plugin = PluginProcess::spawn(&gateway.command, &gateway.parameters)
                .map_err(ProxyError::Auth)?;
            let source: Arc<dyn CredentialSource> = Arc::new(plugin);
            stack.gateway_client = Some(Arc::new(GatewayClientAuth::new(
                gateway.magic,
                source,
                gateway.timeout(),
            )));
            info!("gateway client auth enabled");
        }
    }

    Ok(stack)
}

/// Connection service every listener (static and dynamic) dispatches to.
struct PipelineService {
    rewriter: Arc<AddressRewriter>,
    dialer: Arc<BrokerDialer>,
    auth: Arc<AuthStack>,
    max_frame_size: usize,
    tuning: SocketTuning,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
}

#[async_trait]
impl ConnectionService for PipelineService {
    async fn serve(&self, socket: TcpStream, peer: SocketAddr, broker_address: String) {
        self.tuning.apply(&socket);
        if let Err(e) = socket.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY on client socket");
        }

        let current = self.active_connections.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %peer, active = current + 1, "accepted connection");

        let pipeline = ConnectionPipeline::new(
            Arc::clone(&self.rewriter),
            Arc::clone(&self.dialer),
            Arc::clone(&self.auth),
            self.max_frame_size,
            self.shutdown_tx.subscribe(),
        );

        if let Err(e) = pipeline.run(socket, peer, broker_address).await {
            match &e {
                ProxyError::Shutdown => {
                    debug!(peer = %peer, "connection closed: shutdown");
                }
                ProxyError::Connection(io_err) | ProxyError::RelayIo(io_err)
                    if io_err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    debug!(peer = %peer, "client disconnected");
                }
                ProxyError::Auth(auth_err) => {
                    debug!(peer = %peer, error = %auth_err, "connection rejected");
                }
                _ => {
                    error!(peer = %peer, error = %e, "connection error");
                }
            }
        }

        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    fn base_config(listener_port: u16) -> ProxyConfig {
        ProxyConfig::from_str(&format!(
            r"
proxy:
  default_listener_ip: '127.0.0.1'
  bootstrap_servers:
    - broker_address: '127.0.0.1:19092'
      listener_address: '127.0.0.1:{listener_port}'
"
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_build_without_auth() {
        let server = ProxyServer::build(base_config(0)).unwrap();
        assert_eq!(server.active_connections(), 0);
        assert_eq!(server.dial_attempts(), 0);
    }

    #[tokio::test]
    async fn test_run_binds_static_listeners_and_stops() {
        let server = Arc::new(ProxyServer::build(base_config(0)).unwrap());
        let shutdown = server.shutdown_handle();

        let run_server = Arc::clone(&server);
        let task = tokio::spawn(async move { run_server.run().await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(server.directory().mapping_count().await, 1);

        shutdown.send(()).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
