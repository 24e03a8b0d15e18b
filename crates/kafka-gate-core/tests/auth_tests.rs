//! Integration tests for the authentication framework: local SASL gating
//! and the gateway magic handshake, driven through the full pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kafka_protocol::messages::{ApiKey, SaslAuthenticateRequest, SaslHandshakeRequest};
use kafka_protocol::protocol::StrBytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;

use kafka_gate_core::auth::{
    AuthPluginHost, AuthRole, Authenticator, GatewayServerAuth, LocalAuthenticator,
};
use kafka_gate_core::config::{DynamicListenersConfig, KafkaConfig, LocalAuthMechanism};
use kafka_gate_core::network::dialer::BrokerDialer;
use kafka_gate_core::network::directory::ListenerDirectory;
use kafka_gate_core::network::pipeline::{AuthStack, ConnectionPipeline};
use kafka_gate_core::rewrite::AddressRewriter;
use kafka_gate_core::testing::{encode_request_frame, MockAuthenticator, MockBroker};
use kafka_gate_core::{AuthError, ProxyError};

const MAX_FRAME: usize = 1024 * 1024;
const MAGIC: u64 = 0x6741_7465_4B61_666B;

struct Harness {
    dialer: Arc<BrokerDialer>,
    plugin: Arc<MockAuthenticator>,
    pipeline: ConnectionPipeline,
    _shutdown: broadcast::Sender<()>,
}

fn harness(auth_role: AuthRole, allowed_secret: &str) -> Harness {
    let directory = Arc::new(
        ListenerDirectory::new("127.0.0.1", &DynamicListenersConfig::default()).unwrap(),
    );
    let rewriter = Arc::new(AddressRewriter::new(directory, false));
    let dialer = Arc::new(BrokerDialer::new(
        &KafkaConfig {
            dial_timeout_ms: 1000,
            ..Default::default()
        },
        &[],
        None,
    ));

    let plugin = Arc::new(MockAuthenticator::allowing([allowed_secret]));
    let host = AuthPluginHost::new(
        auth_role,
        Arc::clone(&plugin) as Arc<dyn Authenticator>,
        Duration::from_secs(1),
    );

    let mut auth = AuthStack::default();
    match auth_role {
        AuthRole::Local => {
            auth.local = Some(Arc::new(LocalAuthenticator::new(
                LocalAuthMechanism::Plain,
                host,
            )));
        }
        AuthRole::GatewayServer => {
            auth.gateway_server = Some(Arc::new(GatewayServerAuth::new(MAGIC, host)));
        }
        AuthRole::GatewayClient => unimplemented!("not used in these tests"),
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let pipeline = ConnectionPipeline::new(
        rewriter,
        Arc::clone(&dialer),
        Arc::new(auth),
        MAX_FRAME,
        shutdown_rx,
    );

    Harness {
        dialer,
        plugin,
        pipeline,
        _shutdown: shutdown_tx,
    }
}

async fn read_frame<S: AsyncReadExt + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

fn handshake_frame(correlation_id: i32) -> Bytes {
    let mut request = SaslHandshakeRequest::default();
    request.mechanism = StrBytes::from_static_str("PLAIN");
    encode_request_frame(ApiKey::SaslHandshakeKey, 0, correlation_id, &request)
}

fn authenticate_frame(correlation_id: i32, username: &str, password: &str) -> Bytes {
    let mut request = SaslAuthenticateRequest::default();
    request.auth_bytes = Bytes::from(format!("\0{username}\0{password}").into_bytes());
    encode_request_frame(ApiKey::SaslAuthenticateKey, 0, correlation_id, &request)
}

/// Error code sits right after the v0 response header (4-byte correlation).
fn response_error_code(payload: &[u8]) -> i16 {
    i16::from_be_bytes([payload[4], payload[5]])
}

#[tokio::test]
async fn test_bad_credential_closes_before_any_dial() {
    let harness = harness(AuthRole::Local, "good");
    let dialer = Arc::clone(&harness.dialer);
    let plugin = Arc::clone(&harness.plugin);

    let (mut client, proxy_side) = tokio::io::duplex(64 * 1024);
    let peer: SocketAddr = "127.0.0.1:41001".parse().unwrap();
    let pipeline_task = tokio::spawn(async move {
        harness
            .pipeline
            .run(proxy_side, peer, "127.0.0.1:19092".to_string())
            .await
    });

    client.write_all(&handshake_frame(1)).await.unwrap();
    let handshake = read_frame(&mut client).await;
    assert_eq!(response_error_code(&handshake), 0);

    client
        .write_all(&authenticate_frame(2, "alice", "bad"))
        .await
        .unwrap();
    let authenticate = read_frame(&mut client).await;
    assert_eq!(response_error_code(&authenticate), 58); // SASL_AUTHENTICATION_FAILED

    let result = pipeline_task.await.unwrap();
    assert!(matches!(
        result,
        Err(ProxyError::Auth(AuthError::Denied(_)))
    ));

    // The connection was closed before any broker dial occurred.
    assert_eq!(dialer.dial_attempts(), 0);
    assert_eq!(plugin.calls(), 1);
}

#[tokio::test]
async fn test_good_credential_proceeds_to_relaying() {
    let mut broker = MockBroker::new("127.0.0.1:0");
    let broker_address = broker.start().await.unwrap();

    let harness = harness(AuthRole::Local, "good");
    let dialer = Arc::clone(&harness.dialer);

    let (mut client, proxy_side) = tokio::io::duplex(64 * 1024);
    let peer: SocketAddr = "127.0.0.1:41002".parse().unwrap();
    let pipeline_task = tokio::spawn(async move {
        harness.pipeline.run(proxy_side, peer, broker_address).await
    });

    client.write_all(&handshake_frame(1)).await.unwrap();
    let handshake = read_frame(&mut client).await;
    assert_eq!(response_error_code(&handshake), 0);

    client
        .write_all(&authenticate_frame(2, "alice", "good"))
        .await
        .unwrap();
    let authenticate = read_frame(&mut client).await;
    assert_eq!(response_error_code(&authenticate), 0);

    // Relaying: an ordinary request reaches the broker and its response
    // comes back.
    let request: &[u8] = &[0, 18, 0, 0, 0, 0, 0, 9, 255, 255]; // ApiVersions, corr 9
    client
        .write_all(&(request.len() as u32).to_be_bytes())
        .await
        .unwrap();
    client.write_all(request).await.unwrap();
    let response = read_frame(&mut client).await;
    assert_eq!(&response, &9i32.to_be_bytes());

    assert_eq!(dialer.dial_attempts(), 1);
    assert_eq!(broker.get_calls().await.len(), 1);

    drop(client);
    pipeline_task.await.unwrap().unwrap();
    broker.stop();
}

#[tokio::test]
async fn test_non_sasl_request_rejected_before_auth() {
    let harness = harness(AuthRole::Local, "good");
    let dialer = Arc::clone(&harness.dialer);

    let (mut client, proxy_side) = tokio::io::duplex(64 * 1024);
    let peer: SocketAddr = "127.0.0.1:41003".parse().unwrap();
    let pipeline_task = tokio::spawn(async move {
        harness
            .pipeline
            .run(proxy_side, peer, "127.0.0.1:19092".to_string())
            .await
    });

    // A Produce request before authenticating.
    let request: &[u8] = &[0, 0, 0, 3, 0, 0, 0, 1, 255, 255];
    client
        .write_all(&(request.len() as u32).to_be_bytes())
        .await
        .unwrap();
    client.write_all(request).await.unwrap();

    let result = pipeline_task.await.unwrap();
    assert!(matches!(
        result,
        Err(ProxyError::Auth(AuthError::Denied(_)))
    ));
    assert_eq!(dialer.dial_attempts(), 0);
}

#[tokio::test]
async fn test_gateway_magic_mismatch_never_invokes_plugin() {
    let harness = harness(AuthRole::GatewayServer, "proxy-secret");
    let dialer = Arc::clone(&harness.dialer);
    let plugin = Arc::clone(&harness.plugin);

    let (mut client, proxy_side) = tokio::io::duplex(64 * 1024);
    let peer: SocketAddr = "127.0.0.1:41004".parse().unwrap();
    let pipeline_task = tokio::spawn(async move {
        harness
            .pipeline
            .run(proxy_side, peer, "127.0.0.1:19092".to_string())
            .await
    });

    // A peer that is not a gateway: wrong tag.
    client.write_all(&0x1111_2222u64.to_be_bytes()).await.unwrap();

    let result = pipeline_task.await.unwrap();
    assert!(matches!(
        result,
        Err(ProxyError::Auth(AuthError::MagicMismatch))
    ));
    assert_eq!(plugin.calls(), 0, "plugin command never invoked");
    assert_eq!(dialer.dial_attempts(), 0);
}

#[tokio::test]
async fn test_gateway_accepted_peer_relays() {
    let mut broker = MockBroker::new("127.0.0.1:0");
    let broker_address = broker.start().await.unwrap();

    let harness = harness(AuthRole::GatewayServer, "proxy-secret");
    let dialer = Arc::clone(&harness.dialer);

    let (mut client, proxy_side) = tokio::io::duplex(64 * 1024);
    let peer: SocketAddr = "127.0.0.1:41005".parse().unwrap();
    let pipeline_task = tokio::spawn(async move {
        harness.pipeline.run(proxy_side, peer, broker_address).await
    });

    // Correct magic, then the credential blob.
    client.write_all(&MAGIC.to_be_bytes()).await.unwrap();
    let blob = b"proxy-secret";
    client
        .write_all(&(blob.len() as u32).to_be_bytes())
        .await
        .unwrap();
    client.write_all(blob).await.unwrap();

    let mut status = [0u8; 1];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status[0], 0);

    // Downstream proxy traffic now relays.
    let request: &[u8] = &[0, 18, 0, 0, 0, 0, 0, 4, 255, 255];
    client
        .write_all(&(request.len() as u32).to_be_bytes())
        .await
        .unwrap();
    client.write_all(request).await.unwrap();
    let response = read_frame(&mut client).await;
    assert_eq!(&response, &4i32.to_be_bytes());
    assert_eq!(dialer.dial_attempts(), 1);

    drop(client);
    pipeline_task.await.unwrap().unwrap();
    broker.stop();
}
