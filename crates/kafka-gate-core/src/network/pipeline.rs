//! Per-connection pipeline: authenticate, dial, relay.
//!
//! One pipeline runs per accepted client socket, independent of every other
//! connection. States:
//!
//! ```text
//! Accepted -> Authenticating -> Dialing -> Relaying -> Closed
//!                    \______________\___________\____> Aborted
//! ```
//!
//! Authentication happens before anything touches a broker: gateway-server
//! verification first (when this proxy fronts other proxies), then the local
//! SASL exchange (when end-client auth is enabled). Only an allowing verdict
//! reaches the dialing phase — fail closed, never fail open.
//!
//! During relaying, request frames flow client→broker unchanged while the
//! pipeline records which correlation ids belong to address-bearing requests;
//! response frames flow broker→client through the rewriter when their
//! correlation id matches. Either side closing, or a fatal error on either
//! leg, closes both legs: no half-open relaying.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use kafka_protocol::messages::ApiKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, FramedParts, FramedRead, FramedWrite};
use tracing::{debug, instrument, warn};

use crate::auth::{GatewayClientAuth, GatewayServerAuth, LocalAuthenticator};
use crate::error::{ProxyError, Result};
use crate::rewrite::{AddressRewriter, CorrelationContext};

use super::codec::{FrameEncoder, RequestCodec, ResponseCodec};
use super::dialer::BrokerDialer;

/// The configured authenticators a pipeline consults, all optional.
#[derive(Default)]
pub struct AuthStack {
    pub local: Option<Arc<LocalAuthenticator>>,
    pub gateway_client: Option<Arc<GatewayClientAuth>>,
    pub gateway_server: Option<Arc<GatewayServerAuth>>,
}

/// Handles one accepted connection end to end.
pub struct ConnectionPipeline {
    rewriter: Arc<AddressRewriter>,
    dialer: Arc<BrokerDialer>,
    auth: Arc<AuthStack>,
    max_frame_size: usize,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionPipeline {
    /// Create a pipeline for one connection.
    #[must_use]
    pub fn new(
        rewriter: Arc<AddressRewriter>,
        dialer: Arc<BrokerDialer>,
        auth: Arc<AuthStack>,
        max_frame_size: usize,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            rewriter,
            dialer,
            auth,
            max_frame_size,
            shutdown_rx,
        }
    }

    /// Run the connection to completion.
    ///
    /// # Errors
    ///
    /// Any error aborts this connection only; the caller closes the sockets
    /// by dropping them. Listener mappings provisioned along the way persist
    /// regardless of this connection's outcome.
    #[instrument(skip(self, client), fields(peer = %peer, broker = %broker_address))]
    pub async fn run<S>(mut self, client: S, peer: SocketAddr, broker_address: String) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        debug!("connection accepted");

        // Authenticating
        let (client, leftover) = self.authenticate(client).await?;

        // Dialing
        debug!("dialing broker");
        let mut broker = self.dialer.dial(&broker_address).await?;
        if let Some(gateway_client) = &self.auth.gateway_client {
            gateway_client.authenticate(&mut broker).await?;
        }

        // Relaying
        debug!("relaying");
        self.relay(client, leftover, broker).await
    }

    /// Run the authentication phase. Returns the client stream and any bytes
    /// read past the handshake that the relay must consume first.
    async fn authenticate<S>(&mut self, mut client: S) -> Result<(S, bytes::BytesMut)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Some(gateway_server) = &self.auth.gateway_server {
            gateway_server.authenticate(&mut client).await?;
        }

        let Some(local) = &self.auth.local else {
            return Ok((client, bytes::BytesMut::new()));
        };

        let mut framed = Framed::new(
            client,
            RequestCodec::with_max_frame_size(self.max_frame_size),
        );
        let verdict = local.authenticate(&mut framed).await?;
        debug!(identity = ?verdict.identity, "client authenticated");

        let FramedParts { io, read_buf, .. } = framed.into_parts();
        Ok((io, read_buf))
    }

    async fn relay<S>(&mut self, client: S, leftover: bytes::BytesMut, broker: TcpStream) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // Disjoint borrows: the response leg uses the rewriter while the
        // select arm polls the shutdown receiver.
        let Self {
            rewriter,
            max_frame_size,
            shutdown_rx,
            ..
        } = self;

        let (client_read, client_write) = tokio::io::split(client);
        let (broker_read, broker_write) = broker.into_split();

        let mut client_frames = FramedRead::new(
            client_read,
            RequestCodec::with_max_frame_size(*max_frame_size),
        );
        // Bytes the auth phase over-read belong to the first requests.
        client_frames.read_buffer_mut().unsplit(leftover);
        let mut broker_sink = FramedWrite::new(broker_write, FrameEncoder);

        let mut broker_frames = FramedRead::new(
            broker_read,
            ResponseCodec::with_max_frame_size(*max_frame_size),
        );
        let mut client_sink = FramedWrite::new(client_write, FrameEncoder);

        // Correlation ids of in-flight address-bearing requests only; other
        // traffic needs no response-side attention.
        let inflight: DashMap<i32, (ApiKey, i16)> = DashMap::new();

        let client_to_broker = async {
            while let Some(frame) = client_frames.next().await {
                let frame = frame.map_err(ProxyError::RelayIo)?;
                if let Some(api_key) = frame.parsed_key {
                    if AddressRewriter::is_address_bearing(api_key) {
                        inflight.insert(frame.correlation_id, (api_key, frame.api_version));
                    }
                }
                broker_sink
                    .send(frame.payload.freeze())
                    .await
                    .map_err(ProxyError::RelayIo)?;
            }
            Ok::<(), ProxyError>(())
        };

        let broker_to_client = async {
            while let Some(frame) = broker_frames.next().await {
                let frame = frame.map_err(ProxyError::RelayIo)?;
                let payload = frame.payload.freeze();

                let payload = match inflight.remove(&frame.correlation_id) {
                    Some((_, (api_key, api_version))) => {
                        let context = CorrelationContext {
                            api_key,
                            api_version,
                        };
                        // Provisioning completes (or fails) before the frame
                        // referencing the rewritten address reaches the client.
                        let (rewritten, discovered) =
                            rewriter.rewrite(payload, &context).await?;
                        if !discovered.is_empty() {
                            debug!(
                                brokers = discovered.len(),
                                api_key = ?context.api_key,
                                "discovery response rewritten"
                            );
                        }
                        rewritten
                    }
                    None => payload,
                };

                client_sink.send(payload).await.map_err(ProxyError::RelayIo)?;
            }
            Ok::<(), ProxyError>(())
        };

        let result = tokio::select! {
            r = client_to_broker => r,
            r = broker_to_client => r,
            () = wait_shutdown(shutdown_rx) => Err(ProxyError::Shutdown),
        };

        match &result {
            Ok(()) => debug!("relay closed"),
            Err(ProxyError::Shutdown) => debug!("relay stopped by shutdown"),
            Err(e) => warn!(error = %e, "relay aborted"),
        }
        // Both halves drop here; no half-open relaying survives.
        result
    }
}

/// Resolve only on an actual shutdown signal. A closed channel (sender gone
/// without signaling) must not masquerade as a shutdown.
async fn wait_shutdown(rx: &mut broadcast::Receiver<()>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match rx.recv().await {
            // Lagged still means a signal was sent.
            Ok(()) | Err(RecvError::Lagged(_)) => return,
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
