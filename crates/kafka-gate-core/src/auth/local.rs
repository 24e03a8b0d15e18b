//! End-client authentication over the SASL handshake.
//!
//! When local auth is enabled, the proxy answers the client's
//! ApiVersions / SaslHandshake / SaslAuthenticate frames itself — the broker
//! never sees the exchange — and extracts the credential according to the
//! single configured mechanism:
//!
//! - **PLAIN**: `[authzid] \0 username \0 password`
//! - **OAUTHBEARER**: RFC 7628 framing, `n,a=...,^Aauth=Bearer <token>^A^A`
//!
//! The extracted credential goes to the [`AuthPluginHost`]; anything other
//! than an allowing verdict closes the connection before any broker dial.
//! Any non-handshake request arriving before authentication completes is
//! rejected outright.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use kafka_protocol::messages::api_versions_response::ApiVersion;
use kafka_protocol::messages::{
    ApiKey, ApiVersionsResponse, RequestHeader, ResponseHeader, SaslAuthenticateRequest,
    SaslAuthenticateResponse, SaslHandshakeRequest, SaslHandshakeResponse,
};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::config::LocalAuthMechanism;
use crate::error::{AuthError, ProxyError, Result};
use crate::network::codec::{RequestCodec, RequestFrame};

use super::{AuthPluginHost, AuthVerdict, Credential};

/// SOH delimiter used in OAUTHBEARER client messages.
const SOH: u8 = 0x01;

/// UNSUPPORTED_SASL_MECHANISM
const ERR_UNSUPPORTED_MECHANISM: i16 = 33;
/// SASL_AUTHENTICATION_FAILED
const ERR_AUTHENTICATION_FAILED: i16 = 58;

/// Conservative version ranges advertised to clients before authentication.
/// The proxy answers ApiVersions itself (no broker connection exists yet), so
/// it caps versions at levels any supported broker handles.
const ADVERTISED_APIS: &[(ApiKey, i16, i16)] = &[
    (ApiKey::ProduceKey, 0, 9),
    (ApiKey::FetchKey, 0, 13),
    (ApiKey::ListOffsetsKey, 0, 7),
    (ApiKey::MetadataKey, 0, 12),
    (ApiKey::OffsetCommitKey, 0, 8),
    (ApiKey::OffsetFetchKey, 0, 8),
    (ApiKey::FindCoordinatorKey, 0, 4),
    (ApiKey::JoinGroupKey, 0, 9),
    (ApiKey::HeartbeatKey, 0, 4),
    (ApiKey::LeaveGroupKey, 0, 5),
    (ApiKey::SyncGroupKey, 0, 5),
    (ApiKey::SaslHandshakeKey, 0, 1),
    (ApiKey::ApiVersionsKey, 0, 3),
    (ApiKey::SaslAuthenticateKey, 0, 2),
];

/// Drives the client-side SASL exchange for one connection.
pub struct LocalAuthenticator {
    mechanism: LocalAuthMechanism,
    host: AuthPluginHost,
}

impl LocalAuthenticator {
    /// Create an authenticator for the configured mechanism.
    #[must_use]
    pub fn new(mechanism: LocalAuthMechanism, host: AuthPluginHost) -> Self {
        Self { mechanism, host }
    }

    /// Run the handshake until a verdict is reached.
    ///
    /// # Errors
    ///
    /// Returns an auth error (denied, timed out, plugin failure) or a
    /// connection error. The caller closes the socket on any error.
    pub async fn authenticate<S>(
        &self,
        framed: &mut Framed<S, RequestCodec>,
    ) -> Result<AuthVerdict>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut handshake_done = false;

        loop {
            let frame = match framed.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(ProxyError::Connection(e)),
                None => {
                    return Err(ProxyError::Auth(AuthError::Denied(
                        "client disconnected during authentication".to_string(),
                    )))
                }
            };

            match frame.parsed_key {
                Some(ApiKey::ApiVersionsKey) => {
                    let response = api_versions_response();
                    framed
                        .send(encode_response(
                            ApiKey::ApiVersionsKey,
                            frame.api_version,
                            frame.correlation_id,
                            &response,
                        )?)
                        .await
                        .map_err(ProxyError::Connection)?;
                }
                Some(ApiKey::SaslHandshakeKey) => {
                    handshake_done = self.handle_handshake(framed, &frame).await?;
                }
                Some(ApiKey::SaslAuthenticateKey) => {
                    return self.handle_authenticate(framed, &frame, handshake_done).await;
                }
                _ => {
                    warn!(
                        api_key = frame.api_key,
                        "request rejected: authentication required"
                    );
                    return Err(ProxyError::Auth(AuthError::Denied(
                        "authentication required".to_string(),
                    )));
                }
            }
        }
    }

    async fn handle_handshake<S>(
        &self,
        framed: &mut Framed<S, RequestCodec>,
        frame: &RequestFrame,
    ) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request: SaslHandshakeRequest = decode_request(frame)?;
        let requested = request.mechanism.to_string();
        let supported = requested == self.mechanism.mechanism_name();
        debug!(mechanism = %requested, supported, "SASL handshake");

        let mut response = SaslHandshakeResponse::default();
        response.error_code = if supported { 0 } else { ERR_UNSUPPORTED_MECHANISM };
        response
            .mechanisms
            .push(StrBytes::from_static_str(self.mechanism.mechanism_name()));

        framed
            .send(encode_response(
                ApiKey::SaslHandshakeKey,
                frame.api_version,
                frame.correlation_id,
                &response,
            )?)
            .await
            .map_err(ProxyError::Connection)?;

        Ok(supported)
    }

    async fn handle_authenticate<S>(
        &self,
        framed: &mut Framed<S, RequestCodec>,
        frame: &RequestFrame,
        handshake_done: bool,
    ) -> Result<AuthVerdict>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !handshake_done {
            self.send_authenticate_error(framed, frame, "send SaslHandshake first")
                .await?;
            return Err(ProxyError::Auth(AuthError::InvalidCredential(
                "SaslAuthenticate without handshake".to_string(),
            )));
        }

        let request: SaslAuthenticateRequest = decode_request(frame)?;
        let credential = match self.extract_credential(request.auth_bytes.as_ref()) {
            Ok(credential) => credential,
            Err(e) => {
                self.send_authenticate_error(framed, frame, &e.to_string())
                    .await?;
                return Err(ProxyError::Auth(e));
            }
        };

        let verdict = match self.host.verify(&credential).await {
            Ok(verdict) => verdict,
            Err(e) => {
                self.send_authenticate_error(framed, frame, "authentication failed")
                    .await?;
                return Err(ProxyError::Auth(e));
            }
        };

        if verdict.allowed {
            let mut response = SaslAuthenticateResponse::default();
            response.error_code = 0;
            framed
                .send(encode_response(
                    ApiKey::SaslAuthenticateKey,
                    frame.api_version,
                    frame.correlation_id,
                    &response,
                )?)
                .await
                .map_err(ProxyError::Connection)?;
            Ok(verdict)
        } else {
            let reason = verdict
                .failure_reason
                .unwrap_or_else(|| "authentication failed".to_string());
            self.send_authenticate_error(framed, frame, &reason).await?;
            Err(ProxyError::Auth(AuthError::Denied(reason)))
        }
    }

    async fn send_authenticate_error<S>(
        &self,
        framed: &mut Framed<S, RequestCodec>,
        frame: &RequestFrame,
        message: &str,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut response = SaslAuthenticateResponse::default();
        response.error_code = ERR_AUTHENTICATION_FAILED;
        response.error_message = Some(StrBytes::from_string(message.to_string()));
        framed
            .send(encode_response(
                ApiKey::SaslAuthenticateKey,
                frame.api_version,
                frame.correlation_id,
                &response,
            )?)
            .await
            .map_err(ProxyError::Connection)
    }

    /// Extract the credential from the SaslAuthenticate payload according to
    /// the configured mechanism.
    fn extract_credential(&self, auth_bytes: &[u8]) -> std::result::Result<Credential, AuthError> {
        match self.mechanism {
            LocalAuthMechanism::Plain => parse_plain(auth_bytes),
            LocalAuthMechanism::OauthBearer => parse_oauthbearer(auth_bytes),
        }
    }
}

/// Parse a SASL/PLAIN message: `[authzid] \0 username \0 password`.
fn parse_plain(message: &[u8]) -> std::result::Result<Credential, AuthError> {
    let parts: Vec<&[u8]> = message.split(|&b| b == 0).collect();
    if parts.len() != 3 {
        return Err(AuthError::InvalidCredential(format!(
            "PLAIN message has {} parts, expected 3",
            parts.len()
        )));
    }
    // parts[0] is the authorization identity; ignored.
    Ok(Credential::Plain {
        username: String::from_utf8_lossy(parts[1]).to_string(),
        password: String::from_utf8_lossy(parts[2]).to_string(),
    })
}

/// Parse an OAUTHBEARER client message (RFC 7628):
/// `n,a=<authzid>,\x01auth=Bearer <token>\x01[extensions]\x01`.
fn parse_oauthbearer(message: &[u8]) -> std::result::Result<Credential, AuthError> {
    let text = std::str::from_utf8(message)
        .map_err(|_| AuthError::InvalidCredential("OAUTHBEARER message is not UTF-8".to_string()))?;

    let mut parts = text.split(SOH as char);
    let gs2 = parts.next().unwrap_or_default();
    if !gs2.starts_with("n,") && !gs2.starts_with("y,") {
        return Err(AuthError::InvalidCredential(
            "invalid GS2 header in OAUTHBEARER message".to_string(),
        ));
    }

    for part in parts {
        if let Some(value) = part.strip_prefix("auth=") {
            let token = value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
                .ok_or_else(|| {
                    AuthError::InvalidCredential("auth field must use the Bearer scheme".to_string())
                })?
                .trim();
            if token.is_empty() {
                return Err(AuthError::InvalidCredential("empty bearer token".to_string()));
            }
            return Ok(Credential::Token {
                token: token.to_string(),
            });
        }
    }

    Err(AuthError::InvalidCredential(
        "missing auth=Bearer field in OAUTHBEARER message".to_string(),
    ))
}

/// Decode a request body, skipping the request header at the version the api
/// key dictates.
fn decode_request<T: Decodable>(frame: &RequestFrame) -> Result<T> {
    let api_key = frame
        .parsed_key
        .ok_or_else(|| ProxyError::ProtocolDecode {
            message: format!("unknown api key {}", frame.api_key),
        })?;
    let mut buf = frame.payload.clone().freeze();
    RequestHeader::decode(&mut buf, api_key.request_header_version(frame.api_version)).map_err(
        |e| ProxyError::ProtocolDecode {
            message: format!("request header: {e}"),
        },
    )?;
    T::decode(&mut buf, frame.api_version).map_err(|e| ProxyError::ProtocolDecode {
        message: format!("request body: {e}"),
    })
}

/// Encode a response frame payload: header (at the right version) plus body.
fn encode_response<T: Encodable>(
    api_key: ApiKey,
    api_version: i16,
    correlation_id: i32,
    body: &T,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    let mut header = ResponseHeader::default();
    header.correlation_id = correlation_id;
    header
        .encode(&mut buf, api_key.response_header_version(api_version))
        .map_err(|e| ProxyError::ProtocolEncode {
            message: format!("response header: {e}"),
        })?;
    body.encode(&mut buf, api_version)
        .map_err(|e| ProxyError::ProtocolEncode {
            message: format!("response body: {e}"),
        })?;
    Ok(buf.freeze())
}

fn api_versions_response() -> ApiVersionsResponse {
    let mut response = ApiVersionsResponse::default();
    for &(api_key, min, max) in ADVERTISED_APIS {
        let mut version = ApiVersion::default();
        version.api_key = api_key as i16;
        version.min_version = min;
        version.max_version = max;
        response.api_keys.push(version);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_valid() {
        let credential = parse_plain(b"\0alice\0secret").unwrap();
        match credential {
            Credential::Plain { username, password } => {
                assert_eq!(username, "alice");
                assert_eq!(password, "secret");
            }
            other => panic!("unexpected credential: {other:?}"),
        }
    }

    #[test]
    fn test_parse_plain_with_authzid() {
        let credential = parse_plain(b"admin\0alice\0secret").unwrap();
        match credential {
            Credential::Plain { username, .. } => assert_eq!(username, "alice"),
            other => panic!("unexpected credential: {other:?}"),
        }
    }

    #[test]
    fn test_parse_plain_invalid() {
        assert!(matches!(
            parse_plain(b"no-separators"),
            Err(AuthError::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_parse_oauthbearer_valid() {
        let message = b"n,,\x01auth=Bearer token123\x01\x01";
        let credential = parse_oauthbearer(message).unwrap();
        match credential {
            Credential::Token { token } => assert_eq!(token, "token123"),
            other => panic!("unexpected credential: {other:?}"),
        }
    }

    #[test]
    fn test_parse_oauthbearer_case_insensitive_scheme() {
        let message = b"n,,\x01auth=bearer token123\x01\x01";
        assert!(parse_oauthbearer(message).is_ok());
    }

    #[test]
    fn test_parse_oauthbearer_bad_gs2() {
        let message = b"x,,\x01auth=Bearer token\x01\x01";
        assert!(matches!(
            parse_oauthbearer(message),
            Err(AuthError::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_parse_oauthbearer_missing_auth() {
        let message = b"n,,\x01scope=read\x01\x01";
        assert!(matches!(
            parse_oauthbearer(message),
            Err(AuthError::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_parse_oauthbearer_empty_token() {
        let message = b"n,,\x01auth=Bearer \x01\x01";
        assert!(matches!(
            parse_oauthbearer(message),
            Err(AuthError::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_api_versions_response_covers_sasl() {
        let response = api_versions_response();
        let keys: Vec<i16> = response.api_keys.iter().map(|v| v.api_key).collect();
        assert!(keys.contains(&(ApiKey::SaslHandshakeKey as i16)));
        assert!(keys.contains(&(ApiKey::SaslAuthenticateKey as i16)));
        assert!(keys.contains(&(ApiKey::MetadataKey as i16)));
    }
}
