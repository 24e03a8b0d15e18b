//! Mock Kafka broker for integration testing.
//!
//! A lightweight mock broker that:
//! - Accepts Kafka protocol connections
//! - Records all requests received
//! - Returns configurable responses

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::metadata_response::MetadataResponseBroker;
use kafka_protocol::messages::{ApiKey, BrokerId, MetadataResponse, ResponseHeader};
use kafka_protocol::protocol::{Encodable, StrBytes};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};

/// API keys for the Kafka protocol.
pub mod api_keys {
    pub const PRODUCE: i16 = 0;
    pub const FETCH: i16 = 1;
    pub const METADATA: i16 = 3;
    pub const FIND_COORDINATOR: i16 = 10;
    pub const API_VERSIONS: i16 = 18;
}

/// A recorded broker call.
#[derive(Debug, Clone)]
pub struct BrokerCall {
    /// The API key of the request.
    pub api_key: i16,
    /// The API version of the request.
    pub api_version: i16,
    /// The correlation ID.
    pub correlation_id: i32,
    /// The raw request bytes (without length prefix).
    pub request_bytes: Bytes,
}

/// Response generator function type. Returns the response payload without
/// the length prefix; the broker adds it.
pub type ResponseGenerator = Arc<dyn Fn(&BrokerCall) -> Bytes + Send + Sync>;

/// Mock Kafka broker for testing.
pub struct MockBroker {
    address: String,
    shutdown_tx: Option<broadcast::Sender<()>>,
    call_log: Arc<RwLock<Vec<BrokerCall>>>,
    response_handlers: Arc<RwLock<HashMap<i16, ResponseGenerator>>>,
}

impl MockBroker {
    /// Create a new mock broker that will bind to the given address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            shutdown_tx: None,
            call_log: Arc::new(RwLock::new(Vec::new())),
            response_handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the mock broker.
    ///
    /// Returns the actual address the broker is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> std::io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        let actual_address = listener.local_addr()?.to_string();
        self.address = actual_address.clone();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let call_log = Arc::clone(&self.call_log);
        let response_handlers = Arc::clone(&self.response_handlers);
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                let call_log = Arc::clone(&call_log);
                                let response_handlers = Arc::clone(&response_handlers);
                                let shutdown_rx = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    Self::handle_connection(stream, call_log, response_handlers, shutdown_rx).await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Ok(actual_address)
    }

    /// Stop the mock broker.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Register a response handler for a specific API key.
    pub async fn register_handler(&self, api_key: i16, handler: ResponseGenerator) {
        self.response_handlers.write().await.insert(api_key, handler);
    }

    /// Get all recorded calls.
    pub async fn get_calls(&self) -> Vec<BrokerCall> {
        self.call_log.read().await.clone()
    }

    /// Get calls filtered by API key.
    pub async fn get_calls_for_api(&self, api_key: i16) -> Vec<BrokerCall> {
        self.call_log
            .read()
            .await
            .iter()
            .filter(|c| c.api_key == api_key)
            .cloned()
            .collect()
    }

    /// Get the broker address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Handle a single client connection.
    async fn handle_connection(
        mut stream: TcpStream,
        call_log: Arc<RwLock<Vec<BrokerCall>>>,
        response_handlers: Arc<RwLock<HashMap<i16, ResponseGenerator>>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = Self::read_frame(&mut stream) => {
                    match result {
                        Ok(Some(frame)) => {
                            if frame.len() < 8 {
                                continue;
                            }

                            let api_key = i16::from_be_bytes([frame[0], frame[1]]);
                            let api_version = i16::from_be_bytes([frame[2], frame[3]]);
                            let correlation_id =
                                i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);

                            let call = BrokerCall {
                                api_key,
                                api_version,
                                correlation_id,
                                request_bytes: Bytes::copy_from_slice(&frame),
                            };
                            call_log.write().await.push(call.clone());

                            let response = {
                                let handlers = response_handlers.read().await;
                                if let Some(handler) = handlers.get(&api_key) {
                                    handler(&call)
                                } else {
                                    Self::default_response(&call)
                                }
                            };

                            let mut framed = BytesMut::with_capacity(4 + response.len());
                            framed.extend_from_slice(&(response.len() as u32).to_be_bytes());
                            framed.extend_from_slice(&response);
                            if stream.write_all(&framed).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        }
    }

    /// Read one length-prefixed frame, or `None` on clean EOF.
    async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
        let mut len = [0u8; 4];
        match stream.read_exact(&mut len).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }

    /// Minimal response: the request's correlation id and nothing else.
    fn default_response(call: &BrokerCall) -> Bytes {
        Bytes::copy_from_slice(&call.correlation_id.to_be_bytes())
    }
}

/// Encode a complete metadata response payload (header + body, no length
/// prefix) naming the given `(id, host, port)` brokers.
#[must_use]
pub fn metadata_response_bytes(
    correlation_id: i32,
    api_version: i16,
    brokers: &[(i32, &str, i32)],
) -> Bytes {
    let mut response = MetadataResponse::default();
    for &(id, host, port) in brokers {
        let mut broker = MetadataResponseBroker::default();
        broker.node_id = BrokerId(id);
        broker.host = StrBytes::from_string(host.to_string());
        broker.port = port;
        response.brokers.push(broker);
    }

    let mut header = ResponseHeader::default();
    header.correlation_id = correlation_id;

    let mut buf = BytesMut::new();
    header
        .encode(
            &mut buf,
            ApiKey::MetadataKey.response_header_version(api_version),
        )
        .expect("header encodes");
    response
        .encode(&mut buf, api_version)
        .expect("metadata response encodes");
    buf.freeze()
}
