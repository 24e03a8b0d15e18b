//! Listener directory: one local listening endpoint per broker.
//!
//! The directory owns the broker-id → listener mapping table and the
//! lifecycle of every listening socket. Mappings come from two places:
//!
//! - **static** — bound eagerly at startup from the configured
//!   bootstrap/external server mappings, keyed by broker address until the
//!   first discovery response names the broker id that owns them;
//! - **dynamic** — provisioned lazily the first time the address rewriter
//!   encounters an unmapped broker id, using a port leased from the pool.
//!
//! `provision` is idempotent per broker id and holds a single mutex across
//! the whole lookup-then-create sequence, so concurrent first discovery of
//! the same broker yields exactly one mapping and one bound listener.
//! Mappings persist until process shutdown; there is no mid-life eviction.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::config::{split_host_port, DynamicListenersConfig, StaticMapping};
use crate::error::{ProxyError, Result};

use super::port_pool::PortPool;

/// Identity of a cluster node as seen in discovery responses.
///
/// The broker id is the stable key; host and port may legitimately change
/// across rediscoveries (broker restart with a new IP).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerEndpoint {
    /// Create a new broker endpoint.
    #[must_use]
    pub fn new(id: i32, host: impl Into<String>, port: i32) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// The `host:port` form used for dialing and static-mapping adoption.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Address announced to clients in place of a broker's real address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedAddress {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for AdvertisedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Association of one broker with its proxy-side endpoints.
#[derive(Debug, Clone)]
pub struct ListenerMapping {
    /// Real broker address the listener relays to.
    pub broker_address: String,
    /// Address the proxy bound for this broker.
    pub listen_address: SocketAddr,
    /// Address announced back to clients (differs from `listen_address` for
    /// NAT / load-balancer setups).
    pub advertised: AdvertisedAddress,
}

/// Per-connection entry point the directory hands accepted sockets to.
///
/// Dynamically provisioned listeners reuse the same pipeline as static ones
/// through this seam; tests substitute lightweight doubles.
#[async_trait]
pub trait ConnectionService: Send + Sync + 'static {
    /// Serve one accepted client connection destined for `broker_address`.
    async fn serve(&self, socket: TcpStream, peer: SocketAddr, broker_address: String);
}

struct DirectoryState {
    by_id: HashMap<i32, ListenerMapping>,
    /// Static mappings not yet claimed by a discovered broker id.
    by_broker_address: HashMap<String, ListenerMapping>,
    pool: PortPool,
}

/// Maps broker identity to local listening endpoints and owns listener
/// lifecycle.
pub struct ListenerDirectory {
    state: Mutex<DirectoryState>,
    bind_ip: IpAddr,
    advertised_host: Option<String>,
    dynamic_enabled: bool,
    service: Arc<OnceCell<Arc<dyn ConnectionService>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ListenerDirectory {
    /// Create a directory from the dynamic-listener configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `bind_ip` does not parse (the validated
    /// configuration guarantees it does).
    pub fn new(bind_ip: &str, dynamic: &DynamicListenersConfig) -> Result<Self> {
        let bind_ip: IpAddr = bind_ip.parse().map_err(|_| ProxyError::Bind {
            address: bind_ip.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid bind IP"),
        })?;

        let pool = if dynamic.sequential() {
            PortPool::sequential(dynamic.sequential_min_port, dynamic.max_port())
        } else {
            PortPool::ephemeral()
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            state: Mutex::new(DirectoryState {
                by_id: HashMap::new(),
                by_broker_address: HashMap::new(),
                pool,
            }),
            bind_ip,
            advertised_host: dynamic.advertised_host.clone(),
            dynamic_enabled: !dynamic.disabled,
            service: Arc::new(OnceCell::new()),
            shutdown_tx,
        })
    }

    /// Install the connection service every accept loop dispatches to.
    /// Must be called before the first client can connect; sockets accepted
    /// earlier are dropped.
    pub fn set_service(&self, service: Arc<dyn ConnectionService>) {
        if self.service.set(service).is_err() {
            warn!("connection service already installed");
        }
    }

    /// Handle used to stop every accept loop the directory spawned.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Pure lookup of an existing mapping. No side effects.
    pub async fn resolve(&self, broker_id: i32) -> Option<ListenerMapping> {
        self.state.lock().await.by_id.get(&broker_id).cloned()
    }

    /// Number of active mappings (static ones count once adopted).
    pub async fn mapping_count(&self) -> usize {
        let state = self.state.lock().await;
        state.by_id.len() + state.by_broker_address.len()
    }

    /// Broker ids with an active id-keyed mapping, unordered.
    pub async fn mapped_broker_ids(&self) -> Vec<i32> {
        self.state.lock().await.by_id.keys().copied().collect()
    }

    /// Bind a statically configured listener and register it for adoption by
    /// the broker id that discovery later associates with its address.
    ///
    /// # Errors
    ///
    /// Returns `Bind` if the listener address cannot be bound.
    pub async fn bind_static(&self, mapping: &StaticMapping) -> Result<ListenerMapping> {
        let listener = TcpListener::bind(&mapping.listener_address)
            .await
            .map_err(|source| ProxyError::Bind {
                address: mapping.listener_address.clone(),
                source,
            })?;
        let listen_address = listener.local_addr().map_err(|source| ProxyError::Bind {
            address: mapping.listener_address.clone(),
            source,
        })?;

        let (advertised_host, advertised_port) = split_host_port(mapping.get_advertised_address())
            .map_err(|_| ProxyError::Bind {
                address: mapping.get_advertised_address().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid advertised address",
                ),
            })?;

        let entry = ListenerMapping {
            broker_address: mapping.broker_address.clone(),
            listen_address,
            advertised: AdvertisedAddress {
                host: advertised_host,
                port: advertised_port,
            },
        };

        self.state
            .lock()
            .await
            .by_broker_address
            .insert(mapping.broker_address.clone(), entry.clone());

        info!(
            broker = %mapping.broker_address,
            listen = %listen_address,
            advertised = %entry.advertised,
            "static listener bound"
        );

        self.spawn_accept_loop(listener, mapping.broker_address.clone());
        Ok(entry)
    }

    /// Look up or create the mapping for a discovered broker.
    ///
    /// Idempotent per broker id: a second call returns the existing mapping
    /// unchanged even when the broker's host/port drifted, so clients keep
    /// their proxy port across broker restarts.
    ///
    /// Callers that rely on deterministic port assignment must invoke this in
    /// a stable order (ascending broker id) — see the rewriter.
    ///
    /// # Errors
    ///
    /// Returns `UnknownBroker` when dynamic provisioning is disabled and the
    /// broker is not statically mapped, `PoolExhausted` when the sequential
    /// range is used up, or `ProvisionFailed` when the bind fails. A failed
    /// provision registers nothing.
    pub async fn provision(&self, endpoint: &BrokerEndpoint) -> Result<ListenerMapping> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.by_id.get(&endpoint.id) {
            return Ok(existing.clone());
        }

        // First discovery of a statically mapped broker: adopt the static
        // listener under the discovered id.
        if let Some(adopted) = state.by_broker_address.remove(&endpoint.address()) {
            debug!(
                broker_id = endpoint.id,
                broker = %endpoint.address(),
                listen = %adopted.listen_address,
                "static listener adopted by discovered broker id"
            );
            state.by_id.insert(endpoint.id, adopted.clone());
            return Ok(adopted);
        }

        if !self.dynamic_enabled {
            return Err(ProxyError::UnknownBroker(endpoint.id));
        }

        let lease = state.pool.lease(self.bind_ip).await?;
        let listener = match lease.socket {
            Some(socket) => socket,
            None => TcpListener::bind((self.bind_ip, lease.port))
                .await
                .map_err(|source| ProxyError::ProvisionFailed {
                    broker_id: endpoint.id,
                    source,
                })?,
        };
        let listen_address =
            listener
                .local_addr()
                .map_err(|source| ProxyError::ProvisionFailed {
                    broker_id: endpoint.id,
                    source,
                })?;

        let advertised_host = self
            .advertised_host
            .clone()
            .unwrap_or_else(|| self.bind_ip.to_string());

        let entry = ListenerMapping {
            broker_address: endpoint.address(),
            listen_address,
            advertised: AdvertisedAddress {
                host: advertised_host,
                port: lease.port,
            },
        };
        state.by_id.insert(endpoint.id, entry.clone());
        drop(state);

        info!(
            broker_id = endpoint.id,
            broker = %endpoint.address(),
            listen = %listen_address,
            advertised = %entry.advertised,
            "dynamic listener provisioned"
        );

        self.spawn_accept_loop(listener, endpoint.address());
        Ok(entry)
    }

    /// Spawn the accept loop for a bound listener. Every accepted socket is
    /// handed to the installed connection service with the broker address
    /// this listener fronts.
    fn spawn_accept_loop(&self, listener: TcpListener, broker_address: String) {
        let service_cell = Arc::clone(&self.service);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((socket, peer)) => {
                                let Some(service) = service_cell.get() else {
                                    warn!(peer = %peer, "no connection service installed, dropping connection");
                                    continue;
                                };
                                let service = Arc::clone(service);
                                let broker_address = broker_address.clone();
                                tokio::spawn(async move {
                                    service.serve(socket, peer, broker_address).await;
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "accept error");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(broker = %broker_address, "listener accept loop stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Stop all accept loops and release every leased port.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let mut state = self.state.lock().await;
        let ports: Vec<u16> = state
            .by_id
            .values()
            .map(|m| m.listen_address.port())
            .collect();
        for port in ports {
            state.pool.release(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DynamicListenersConfig;

    fn dynamic_config(min_port: u16) -> DynamicListenersConfig {
        DynamicListenersConfig {
            sequential_min_port: min_port,
            deterministic: min_port > 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_unknown_is_none() {
        let directory = ListenerDirectory::new("127.0.0.1", &dynamic_config(0)).unwrap();
        assert!(directory.resolve(7).await.is_none());
    }

    #[tokio::test]
    async fn test_provision_registers_mapping() {
        let directory = ListenerDirectory::new("127.0.0.1", &dynamic_config(0)).unwrap();
        let endpoint = BrokerEndpoint::new(1, "kafka-1.internal", 9092);

        let mapping = directory.provision(&endpoint).await.unwrap();
        assert_eq!(mapping.broker_address, "kafka-1.internal:9092");
        assert_eq!(
            directory.resolve(1).await.unwrap().listen_address,
            mapping.listen_address
        );
    }

    #[tokio::test]
    async fn test_provision_idempotent_across_address_drift() {
        let directory = ListenerDirectory::new("127.0.0.1", &dynamic_config(0)).unwrap();

        let first = directory
            .provision(&BrokerEndpoint::new(1, "kafka-1.internal", 9092))
            .await
            .unwrap();
        // Broker restarted with a new address; the mapping must not move.
        let second = directory
            .provision(&BrokerEndpoint::new(1, "10.0.0.99", 9095))
            .await
            .unwrap();

        assert_eq!(first.listen_address, second.listen_address);
        assert_eq!(first.advertised, second.advertised);
        assert_eq!(second.broker_address, "kafka-1.internal:9092");
    }

    #[tokio::test]
    async fn test_unknown_broker_when_dynamic_disabled() {
        let config = DynamicListenersConfig {
            disabled: true,
            ..Default::default()
        };
        let directory = ListenerDirectory::new("127.0.0.1", &config).unwrap();

        let result = directory
            .provision(&BrokerEndpoint::new(5, "kafka-5", 9092))
            .await;
        assert!(matches!(result, Err(ProxyError::UnknownBroker(5))));
    }

    #[tokio::test]
    async fn test_static_mapping_adopted_by_discovered_id() {
        let config = DynamicListenersConfig {
            disabled: true,
            ..Default::default()
        };
        let directory = ListenerDirectory::new("127.0.0.1", &config).unwrap();

        let bound = directory
            .bind_static(&StaticMapping {
                broker_address: "kafka-1.internal:9092".to_string(),
                listener_address: "127.0.0.1:0".to_string(),
                advertised_address: Some("proxy.example.com:30001".to_string()),
            })
            .await
            .unwrap();

        // Even with dynamic provisioning off, the statically mapped broker
        // resolves once discovery names its id.
        let adopted = directory
            .provision(&BrokerEndpoint::new(1, "kafka-1.internal", 9092))
            .await
            .unwrap();
        assert_eq!(adopted.listen_address, bound.listen_address);
        assert_eq!(adopted.advertised.host, "proxy.example.com");
        assert_eq!(adopted.advertised.port, 30001);
        assert!(directory.resolve(1).await.is_some());
    }

    #[tokio::test]
    async fn test_distinct_brokers_get_distinct_listeners() {
        let directory = ListenerDirectory::new("127.0.0.1", &dynamic_config(0)).unwrap();

        let a = directory
            .provision(&BrokerEndpoint::new(1, "kafka-1", 9092))
            .await
            .unwrap();
        let b = directory
            .provision(&BrokerEndpoint::new(2, "kafka-2", 9092))
            .await
            .unwrap();

        assert_ne!(a.listen_address, b.listen_address);
    }
}
