//! Test utilities for integration testing.
//!
//! [`MockBroker`] stands in for a real Kafka broker: it records every
//! request it receives and answers with configurable responses.
//! [`MockAuthenticator`] and [`MockCredentialSource`] replace the external
//! plugin process with scripted, counted verdicts.

pub mod mock_broker;

pub use mock_broker::{api_keys, BrokerCall, MockBroker, ResponseGenerator};

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader};
use kafka_protocol::protocol::Encodable;

use crate::auth::{AuthVerdict, Authenticator, Credential, CredentialSource};
use crate::error::AuthResult;

/// In-process authenticator double: allows a fixed set of secrets and counts
/// invocations.
#[derive(Debug, Default)]
pub struct MockAuthenticator {
    allowed_secrets: Vec<String>,
    calls: AtomicUsize,
}

impl MockAuthenticator {
    /// Allow any credential whose password/token equals one of `secrets`.
    #[must_use]
    pub fn allowing<I: IntoIterator<Item = S>, S: Into<String>>(secrets: I) -> Self {
        Self {
            allowed_secrets: secrets.into_iter().map(Into::into).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of authentication attempts made against this double.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn secret_of(credential: &Credential) -> &str {
        match credential {
            Credential::Plain { password, .. } => password,
            Credential::Token { token } => token,
            Credential::Raw { bytes } => std::str::from_utf8(bytes).unwrap_or(""),
        }
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn authenticate(&self, credential: &Credential) -> AuthResult<AuthVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let secret = Self::secret_of(credential);
        if self.allowed_secrets.iter().any(|s| s == secret) {
            let identity = match credential {
                Credential::Plain { username, .. } => Some(username.clone()),
                _ => None,
            };
            Ok(AuthVerdict::allow(identity))
        } else {
            Ok(AuthVerdict::deny("credential not allowed"))
        }
    }
}

/// Credential source double producing a fixed blob.
#[derive(Debug)]
pub struct MockCredentialSource(pub Vec<u8>);

#[async_trait]
impl CredentialSource for MockCredentialSource {
    async fn obtain(&self) -> AuthResult<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// Encode a complete request frame (length prefix included) the way a Kafka
/// client would.
#[must_use]
pub fn encode_request_frame<T: Encodable>(
    api_key: ApiKey,
    api_version: i16,
    correlation_id: i32,
    body: &T,
) -> Bytes {
    let mut payload = BytesMut::new();
    let mut header = RequestHeader::default();
    header.request_api_key = api_key as i16;
    header.request_api_version = api_version;
    header.correlation_id = correlation_id;
    header
        .encode(&mut payload, api_key.request_header_version(api_version))
        .expect("request header encodes");
    body.encode(&mut payload, api_version)
        .expect("request body encodes");

    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame.freeze()
}
