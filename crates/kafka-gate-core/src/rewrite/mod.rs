//! Address rewriting for discovery responses.
//!
//! The proxy only decodes the response types that enumerate broker
//! addresses — Metadata and FindCoordinator. Everything else relays as
//! opaque length-prefixed frames, which keeps the decoder small and immune
//! to unrelated protocol evolution.
//!
//! For each broker a decoded response references, the rewriter asks the
//! [`ListenerDirectory`] to resolve or provision a mapping (in ascending
//! broker-id order, so deterministic pools assign reproducible ports), then
//! substitutes the response's host/port fields with the mapping's advertised
//! address and re-encodes. The frame length prefix is recomputed by the
//! relay encoder from the new payload size.
//!
//! Decode/encode failures on a recognized type are non-fatal by default: the
//! frame is forwarded unmodified and the event logged — availability over
//! address correctness. In strict mode the connection is torn down instead.
//! Provisioning failures (pool exhausted, unknown broker, bind errors) always
//! abort the connection: forwarding a response whose brokers have no
//! listeners would strand the client.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, FindCoordinatorResponse, MetadataResponse, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::network::directory::{BrokerEndpoint, ListenerDirectory, ListenerMapping};

/// What the relay learned about the request a response answers.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationContext {
    pub api_key: ApiKey,
    pub api_version: i16,
}

/// Rewrites broker addresses inside discovery responses.
pub struct AddressRewriter {
    directory: Arc<ListenerDirectory>,
    strict: bool,
}

impl AddressRewriter {
    /// Create a rewriter over the given directory.
    #[must_use]
    pub fn new(directory: Arc<ListenerDirectory>, strict: bool) -> Self {
        Self { directory, strict }
    }

    /// Whether responses to this api key carry broker addresses.
    #[must_use]
    pub fn is_address_bearing(api_key: ApiKey) -> bool {
        matches!(api_key, ApiKey::MetadataKey | ApiKey::FindCoordinatorKey)
    }

    /// Rewrite one response payload (response header included, length prefix
    /// excluded). Returns the payload to forward and the brokers the
    /// response referenced.
    ///
    /// # Errors
    ///
    /// Provisioning failures always propagate. Decode/encode failures
    /// propagate as `RewriteFailed` only in strict mode; otherwise the
    /// original payload is forwarded unmodified.
    pub async fn rewrite(
        &self,
        payload: Bytes,
        context: &CorrelationContext,
    ) -> Result<(Bytes, Vec<BrokerEndpoint>)> {
        let result = match context.api_key {
            ApiKey::MetadataKey => {
                self.rewrite_metadata(payload.clone(), context.api_version)
                    .await
            }
            ApiKey::FindCoordinatorKey => {
                self.rewrite_find_coordinator(payload.clone(), context.api_version)
                    .await
            }
            _ => return Ok((payload, Vec::new())),
        };

        match result {
            Ok(rewritten) => Ok(rewritten),
            Err(
                e @ (ProxyError::PoolExhausted { .. }
                | ProxyError::UnknownBroker(_)
                | ProxyError::ProvisionFailed { .. }
                | ProxyError::Bind { .. }),
            ) => Err(e),
            Err(e) if self.strict => Err(ProxyError::RewriteFailed {
                message: e.to_string(),
            }),
            Err(e) => {
                warn!(
                    api_key = ?context.api_key,
                    api_version = context.api_version,
                    error = %e,
                    "forwarding malformed discovery response unmodified"
                );
                Ok((payload, Vec::new()))
            }
        }
    }

    /// Provision mappings for the referenced brokers, ascending by id.
    async fn provision_all(
        &self,
        mut endpoints: Vec<BrokerEndpoint>,
    ) -> Result<(Vec<BrokerEndpoint>, HashMap<i32, ListenerMapping>)> {
        endpoints.sort_by_key(|endpoint| endpoint.id);
        let mut mappings = HashMap::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let mapping = self.directory.provision(endpoint).await?;
            mappings.insert(endpoint.id, mapping);
        }
        Ok((endpoints, mappings))
    }

    async fn rewrite_metadata(
        &self,
        payload: Bytes,
        api_version: i16,
    ) -> Result<(Bytes, Vec<BrokerEndpoint>)> {
        let header_version = ApiKey::MetadataKey.response_header_version(api_version);
        let mut buf = payload;
        let header = ResponseHeader::decode(&mut buf, header_version).map_err(decode_error)?;
        let mut response = MetadataResponse::decode(&mut buf, api_version).map_err(decode_error)?;

        let endpoints: Vec<BrokerEndpoint> = response
            .brokers
            .iter()
            .map(|b| BrokerEndpoint::new(b.node_id.0, b.host.to_string(), b.port))
            .collect();
        let (discovered, mappings) = self.provision_all(endpoints).await?;

        for broker in &mut response.brokers {
            if let Some(mapping) = mappings.get(&broker.node_id.0) {
                broker.host = StrBytes::from_string(mapping.advertised.host.clone());
                broker.port = i32::from(mapping.advertised.port);
            }
        }

        debug!(
            brokers = discovered.len(),
            api_version, "rewrote metadata response"
        );

        let rewritten = encode_payload(&header, header_version, &response, api_version)?;
        Ok((rewritten, discovered))
    }

    async fn rewrite_find_coordinator(
        &self,
        payload: Bytes,
        api_version: i16,
    ) -> Result<(Bytes, Vec<BrokerEndpoint>)> {
        let header_version = ApiKey::FindCoordinatorKey.response_header_version(api_version);
        let mut buf = payload;
        let header = ResponseHeader::decode(&mut buf, header_version).map_err(decode_error)?;
        let mut response =
            FindCoordinatorResponse::decode(&mut buf, api_version).map_err(decode_error)?;

        let mut endpoints = Vec::new();

        // v0-3 carry a single coordinator in top-level fields; v4+ batch
        // them. Error entries (negative node id, unset port) stay untouched.
        if api_version < 4 {
            if response.node_id.0 >= 0 && response.port > 0 {
                endpoints.push(BrokerEndpoint::new(
                    response.node_id.0,
                    response.host.to_string(),
                    response.port,
                ));
            }
        } else {
            for coordinator in &response.coordinators {
                if coordinator.node_id.0 >= 0 && coordinator.port > 0 {
                    endpoints.push(BrokerEndpoint::new(
                        coordinator.node_id.0,
                        coordinator.host.to_string(),
                        coordinator.port,
                    ));
                }
            }
        }

        let (discovered, mappings) = self.provision_all(endpoints).await?;

        if api_version < 4 {
            if let Some(mapping) = mappings.get(&response.node_id.0) {
                response.host = StrBytes::from_string(mapping.advertised.host.clone());
                response.port = i32::from(mapping.advertised.port);
            }
        } else {
            for coordinator in &mut response.coordinators {
                if let Some(mapping) = mappings.get(&coordinator.node_id.0) {
                    coordinator.host = StrBytes::from_string(mapping.advertised.host.clone());
                    coordinator.port = i32::from(mapping.advertised.port);
                }
            }
        }

        debug!(
            coordinators = discovered.len(),
            api_version, "rewrote find-coordinator response"
        );

        let rewritten = encode_payload(&header, header_version, &response, api_version)?;
        Ok((rewritten, discovered))
    }
}

fn decode_error<E: std::fmt::Display>(e: E) -> ProxyError {
    ProxyError::ProtocolDecode {
        message: e.to_string(),
    }
}

fn encode_payload<T: Encodable>(
    header: &ResponseHeader,
    header_version: i16,
    body: &T,
    api_version: i16,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    header
        .encode(&mut buf, header_version)
        .map_err(|e| ProxyError::ProtocolEncode {
            message: e.to_string(),
        })?;
    body.encode(&mut buf, api_version)
        .map_err(|e| ProxyError::ProtocolEncode {
            message: e.to_string(),
        })?;
    Ok(buf.freeze())
}
