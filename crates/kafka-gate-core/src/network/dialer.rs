//! Outbound broker dialing.
//!
//! Resolves the real dial target (applying static dial-address overrides),
//! establishes the TCP connection — directly or tunneled through an HTTP
//! CONNECT or SOCKS5 forward proxy — and applies the configured socket
//! tuning. Exposes a dial-attempt counter so tests can assert that denied
//! connections never reach the dialing phase.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{
    split_host_port, DialMapping, ForwardProxyConfig, ForwardProxyScheme, KafkaConfig,
};
use crate::error::{ProxyError, Result};

/// Socket tuning applied to a freshly established stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketTuning {
    pub keep_alive: Option<Duration>,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl SocketTuning {
    /// Apply the tuning to a stream. Failures are logged, not fatal: the
    /// relay works with OS defaults.
    pub fn apply(&self, stream: &TcpStream) {
        let sock = SockRef::from(stream);
        if let Some(interval) = self.keep_alive {
            let ka = socket2::TcpKeepalive::new().with_time(interval);
            if let Err(e) = sock.set_tcp_keepalive(&ka) {
                debug!(error = %e, "failed to set TCP keep-alive");
            }
        }
        if self.read_buffer_size > 0 {
            if let Err(e) = sock.set_recv_buffer_size(self.read_buffer_size) {
                debug!(error = %e, "failed to set SO_RCVBUF");
            }
        }
        if self.write_buffer_size > 0 {
            if let Err(e) = sock.set_send_buffer_size(self.write_buffer_size) {
                debug!(error = %e, "failed to set SO_SNDBUF");
            }
        }
    }
}

/// Dials broker-side connections for the relay.
pub struct BrokerDialer {
    dial_mappings: HashMap<String, String>,
    forward_proxy: Option<ForwardProxyConfig>,
    dial_timeout: Duration,
    tuning: SocketTuning,
    attempts: AtomicU64,
}

impl BrokerDialer {
    /// Create a dialer from the upstream configuration.
    #[must_use]
    pub fn new(
        kafka: &KafkaConfig,
        dial_mappings: &[DialMapping],
        forward_proxy: Option<ForwardProxyConfig>,
    ) -> Self {
        let dial_mappings = dial_mappings
            .iter()
            .map(|m| (m.source_address.clone(), m.destination_address.clone()))
            .collect();

        let keep_alive = (kafka.keep_alive_secs > 0)
            .then(|| Duration::from_secs(kafka.keep_alive_secs));

        Self {
            dial_mappings,
            forward_proxy,
            dial_timeout: kafka.dial_timeout(),
            tuning: SocketTuning {
                keep_alive,
                read_buffer_size: kafka.read_buffer_size,
                write_buffer_size: kafka.write_buffer_size,
            },
            attempts: AtomicU64::new(0),
        }
    }

    /// Number of dial attempts made so far (test hook).
    #[must_use]
    pub fn dial_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Resolve the actual address to dial, applying static overrides.
    #[must_use]
    pub fn resolve_target<'a>(&'a self, address: &'a str) -> &'a str {
        match self.dial_mappings.get(address) {
            Some(destination) => {
                debug!(source = %address, destination = %destination, "dial address override");
                destination
            }
            None => address,
        }
    }

    /// Establish the broker-side connection.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the dial (or the forward-proxy
    /// handshake) fails or exceeds the dial timeout.
    pub async fn dial(&self, address: &str) -> Result<TcpStream> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let target = self.resolve_target(address);

        let stream = timeout(self.dial_timeout, self.dial_inner(target))
            .await
            .map_err(|_| {
                ProxyError::Connection(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial timeout connecting to {target}"),
                ))
            })??;

        self.tuning.apply(&stream);
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        Ok(stream)
    }

    async fn dial_inner(&self, target: &str) -> Result<TcpStream> {
        match &self.forward_proxy {
            None => Ok(TcpStream::connect(target).await?),
            Some(proxy) => {
                let stream = TcpStream::connect(&proxy.address).await?;
                match proxy.scheme {
                    ForwardProxyScheme::Http => http_connect(stream, target, proxy).await,
                    ForwardProxyScheme::Socks5 => socks5_connect(stream, target, proxy).await,
                }
            }
        }
    }
}

/// Tunnel through an HTTP proxy with the CONNECT method.
async fn http_connect(
    mut stream: TcpStream,
    target: &str,
    proxy: &ForwardProxyConfig,
) -> Result<TcpStream> {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let (Some(username), Some(password)) = (proxy.username(), proxy.password()) {
        let credentials = BASE64.encode(format!("{username}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read the response head up to the blank line. The proxy sends nothing
    // else before the tunnel is established.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8192 {
            return Err(connect_error("oversized CONNECT response"));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(connect_error("proxy closed during CONNECT"));
        }
        head.push(byte[0]);
    }

    let status_line = head
        .split(|&b| b == b'\r')
        .next()
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    let status_ok = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2'));
    if !status_ok {
        warn!(status = %status_line, "HTTP CONNECT refused");
        return Err(connect_error(&format!("CONNECT refused: {status_line}")));
    }

    Ok(stream)
}

/// Tunnel through a SOCKS5 proxy (RFC 1928, optional RFC 1929 user/pass).
async fn socks5_connect(
    mut stream: TcpStream,
    target: &str,
    proxy: &ForwardProxyConfig,
) -> Result<TcpStream> {
    let (host, port) =
        split_host_port(target).map_err(|_| connect_error("invalid dial target"))?;

    let credentials = match (proxy.username(), proxy.password()) {
        (Some(u), Some(p)) => Some((u, p)),
        _ => None,
    };

    // Greeting: advertise no-auth or user/pass.
    let method: u8 = if credentials.is_some() { 0x02 } else { 0x00 };
    stream.write_all(&[0x05, 0x01, method]).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 || reply[1] != method {
        return Err(connect_error("SOCKS5 method negotiation failed"));
    }

    if let Some((username, password)) = credentials {
        let mut auth = Vec::with_capacity(3 + username.len() + password.len());
        auth.push(0x01);
        auth.push(username.len() as u8);
        auth.extend_from_slice(username.as_bytes());
        auth.push(password.len() as u8);
        auth.extend_from_slice(password.as_bytes());
        stream.write_all(&auth).await?;

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[1] != 0x00 {
            return Err(connect_error("SOCKS5 authentication rejected"));
        }
    }

    // CONNECT with domain addressing; the proxy resolves the name.
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != 0x00 {
        return Err(connect_error(&format!(
            "SOCKS5 connect rejected (code {})",
            header[1]
        )));
    }

    // Drain the bound address the reply carries.
    let addr_len = match header[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        _ => return Err(connect_error("SOCKS5 reply with unknown address type")),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

fn connect_error(message: &str) -> ProxyError {
    ProxyError::Connection(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        message.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_kafka_config() -> KafkaConfig {
        KafkaConfig {
            dial_timeout_ms: 500,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_target_applies_override() {
        let mappings = vec![DialMapping {
            source_address: "kafka-1.internal:9092".to_string(),
            destination_address: "10.1.2.3:9092".to_string(),
        }];
        let dialer = BrokerDialer::new(&test_kafka_config(), &mappings, None);

        assert_eq!(
            dialer.resolve_target("kafka-1.internal:9092"),
            "10.1.2.3:9092"
        );
        assert_eq!(
            dialer.resolve_target("kafka-2.internal:9092"),
            "kafka-2.internal:9092"
        );
    }

    #[tokio::test]
    async fn test_direct_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let dialer = BrokerDialer::new(&test_kafka_config(), &[], None);
        assert_eq!(dialer.dial_attempts(), 0);

        let stream = dialer.dial(&address).await.unwrap();
        assert_eq!(dialer.dial_attempts(), 1);
        assert_eq!(stream.peer_addr().unwrap().to_string(), address);
    }

    #[tokio::test]
    async fn test_dial_refused_counts_attempt() {
        let dialer = BrokerDialer::new(&test_kafka_config(), &[], None);
        let result = dialer.dial("127.0.0.1:1").await;
        assert!(matches!(result, Err(ProxyError::Connection(_))));
        assert_eq!(dialer.dial_attempts(), 1);
    }

    #[tokio::test]
    async fn test_http_connect_tunnel() {
        // Minimal CONNECT-speaking proxy: accept, read the request head,
        // answer 200, then echo one byte.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]);
            assert!(head.starts_with("CONNECT kafka-1:9092 HTTP/1.1"));
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let mut one = [0u8; 1];
            socket.read_exact(&mut one).await.unwrap();
            socket.write_all(&one).await.unwrap();
        });

        let proxy = ForwardProxyConfig {
            scheme: ForwardProxyScheme::Http,
            address: proxy_addr,
            username: None,
            password: None,
        };
        let dialer = BrokerDialer::new(&test_kafka_config(), &[], Some(proxy));

        let mut stream = dialer.dial("kafka-1:9092").await.unwrap();
        stream.write_all(&[42]).await.unwrap();
        let mut echoed = [0u8; 1];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed[0], 42);
    }

    #[tokio::test]
    async fn test_http_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });

        let proxy = ForwardProxyConfig {
            scheme: ForwardProxyScheme::Http,
            address: proxy_addr,
            username: None,
            password: None,
        };
        let dialer = BrokerDialer::new(&test_kafka_config(), &[], Some(proxy));

        let result = dialer.dial("kafka-1:9092").await;
        assert!(matches!(result, Err(ProxyError::Connection(_))));
    }

    #[tokio::test]
    async fn test_socks5_connect_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Greeting
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            socket.write_all(&[0x05, 0x00]).await.unwrap();
            // Connect request: ver cmd rsv atyp len host port
            let mut header = [0u8; 5];
            socket.read_exact(&mut header).await.unwrap();
            assert_eq!(header[3], 0x03); // domain
            let mut rest = vec![0u8; usize::from(header[4]) + 2];
            socket.read_exact(&mut rest).await.unwrap();
            // Success reply with a zero IPv4 bound address
            socket
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            let mut one = [0u8; 1];
            socket.read_exact(&mut one).await.unwrap();
            socket.write_all(&one).await.unwrap();
        });

        let proxy = ForwardProxyConfig {
            scheme: ForwardProxyScheme::Socks5,
            address: proxy_addr,
            username: None,
            password: None,
        };
        let dialer = BrokerDialer::new(&test_kafka_config(), &[], Some(proxy));

        let mut stream = dialer.dial("kafka-1:9092").await.unwrap();
        stream.write_all(&[7]).await.unwrap();
        let mut echoed = [0u8; 1];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed[0], 7);
    }
}
