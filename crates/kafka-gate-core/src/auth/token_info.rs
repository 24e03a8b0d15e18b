//! Token-info collaborator for the bearer-token mechanism.
//!
//! A [`TokenInfo`] verifier resolves a bearer token to a verified identity.
//! Verifiers are selected by name from an explicit [`TokenInfoRegistry`]
//! built once at startup and passed by reference — no global
//! self-registration. Each factory parses its own flag-style string
//! parameters (`--audience=...`), analogous to plugin command-line flags
//! rather than structured configuration.
//!
//! The built-in `jwt-claims` verifier checks token structure, expiry,
//! audience membership and an email-claim allow-list. It does not fetch
//! remote key sets; deployments that need signature verification against an
//! identity provider register their own factory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{AuthError, AuthResult, ConfigError, ConfigResult};

use super::{AuthVerdict, Authenticator, Credential};

/// Resolves a bearer token to a verified identity.
#[async_trait]
pub trait TokenInfo: Send + Sync {
    /// Verify the token, requiring it to satisfy `required_audiences`.
    /// Returns the verified principal (e.g. an email claim).
    async fn verify(&self, token: &str, required_audiences: &[String]) -> AuthResult<String>;
}

/// Factory building a verifier from its flag-style parameters.
pub type TokenInfoFactory = fn(&[String]) -> ConfigResult<Arc<dyn TokenInfo>>;

/// Explicit name → factory mapping for the available verifiers.
pub struct TokenInfoRegistry {
    factories: HashMap<&'static str, TokenInfoFactory>,
}

impl TokenInfoRegistry {
    /// Registry carrying the built-in verifiers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("jwt-claims", |params| {
            Ok(Arc::new(JwtClaimsVerifier::from_params(params)?))
        });
        registry
    }

    /// Register an additional verifier factory under a name.
    pub fn register(&mut self, name: &'static str, factory: TokenInfoFactory) {
        self.factories.insert(name, factory);
    }

    /// Build the named verifier from its parameters.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names or unparseable parameters.
    pub fn create(&self, name: &str, parameters: &[String]) -> ConfigResult<Arc<dyn TokenInfo>> {
        let factory = self.factories.get(name).ok_or_else(|| ConfigError::TokenInfo {
            name: name.to_string(),
            reason: "not registered".to_string(),
        })?;
        factory(parameters)
    }
}

/// Parse `--key=value` / `-key=value` flag parameters into a multimap.
///
/// # Errors
///
/// Returns a description of the first malformed parameter.
pub(crate) fn parse_flag_params(
    parameters: &[String],
) -> Result<HashMap<String, Vec<String>>, String> {
    let mut parsed: HashMap<String, Vec<String>> = HashMap::new();
    for parameter in parameters {
        let stripped = parameter
            .strip_prefix("--")
            .or_else(|| parameter.strip_prefix('-'))
            .ok_or_else(|| format!("'{parameter}' is not a flag"))?;
        let (key, value) = stripped
            .split_once('=')
            .ok_or_else(|| format!("'{parameter}' has no '=value'"))?;
        if key.is_empty() || value.is_empty() {
            return Err(format!("'{parameter}' has an empty key or value"));
        }
        parsed.entry(key.to_string()).or_default().push(value.to_string());
    }
    Ok(parsed)
}

/// Verifier over the token's own claims: structure, expiry, audience and an
/// email allow-list.
pub struct JwtClaimsVerifier {
    audiences: Vec<String>,
    email_patterns: Vec<Regex>,
}

impl JwtClaimsVerifier {
    /// Build from `--audience=` (repeatable) and `--email-regex=`
    /// (repeatable) parameters.
    ///
    /// # Errors
    ///
    /// Returns an error on unknown parameters or invalid regexes.
    pub fn from_params(parameters: &[String]) -> ConfigResult<Self> {
        let mut parsed = parse_flag_params(parameters).map_err(|reason| ConfigError::TokenInfo {
            name: "jwt-claims".to_string(),
            reason,
        })?;

        let audiences = parsed.remove("audience").unwrap_or_default();
        let email_patterns = parsed
            .remove("email-regex")
            .unwrap_or_default()
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| ConfigError::TokenInfo {
                    name: "jwt-claims".to_string(),
                    reason: format!("invalid email regex '{pattern}': {e}"),
                })
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        if let Some(unknown) = parsed.keys().next() {
            return Err(ConfigError::TokenInfo {
                name: "jwt-claims".to_string(),
                reason: format!("unknown parameter '--{unknown}'"),
            });
        }

        Ok(Self {
            audiences,
            email_patterns,
        })
    }

    fn decode_claims(token: &str) -> AuthResult<Value> {
        let mut parts = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Denied("malformed token".to_string()));
        };

        let decoded = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|_| AuthError::Denied("token payload is not base64url".to_string()))?;
        serde_json::from_slice(&decoded)
            .map_err(|_| AuthError::Denied("token payload is not JSON".to_string()))
    }

    fn token_audiences(claims: &Value) -> Vec<String> {
        match claims.get("aud") {
            Some(Value::String(aud)) => vec![aud.clone()],
            Some(Value::Array(auds)) => auds
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl TokenInfo for JwtClaimsVerifier {
    async fn verify(&self, token: &str, required_audiences: &[String]) -> AuthResult<String> {
        let claims = Self::decode_claims(token)?;

        if let Some(exp) = claims.get("exp").and_then(Value::as_i64) {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            if exp <= now {
                return Err(AuthError::Denied("token expired".to_string()));
            }
        }

        // Any-of match against the union of configured and caller-required
        // audiences, when either is non-empty.
        let mut expected: Vec<&String> = self.audiences.iter().collect();
        expected.extend(required_audiences.iter());
        if !expected.is_empty() {
            let token_audiences = Self::token_audiences(&claims);
            if !token_audiences.iter().any(|aud| expected.contains(&aud)) {
                return Err(AuthError::Denied(format!(
                    "audience mismatch: token carries {token_audiences:?}"
                )));
            }
        }

        let email = claims.get("email").and_then(Value::as_str);
        if !self.email_patterns.is_empty() {
            let Some(email) = email else {
                return Err(AuthError::Denied("token has no email claim".to_string()));
            };
            if !self.email_patterns.iter().any(|re| re.is_match(email)) {
                return Err(AuthError::Denied(format!(
                    "email '{email}' not in allow-list"
                )));
            }
        }

        let identity = email
            .map(str::to_string)
            .or_else(|| claims.get("sub").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| AuthError::Denied("token has no subject claim".to_string()))?;

        debug!(identity = %identity, "token verified");
        Ok(identity)
    }
}

/// Adapts a token-info verifier to the [`Authenticator`] capability.
///
/// Any verification failure — malformed token, backend error, rejection — is
/// a deny, never an open door.
pub struct TokenInfoAuthenticator {
    verifier: Arc<dyn TokenInfo>,
    required_audiences: Vec<String>,
}

impl TokenInfoAuthenticator {
    /// Wrap a verifier with the audiences every token must satisfy.
    #[must_use]
    pub fn new(verifier: Arc<dyn TokenInfo>, required_audiences: Vec<String>) -> Self {
        Self {
            verifier,
            required_audiences,
        }
    }
}

#[async_trait]
impl Authenticator for TokenInfoAuthenticator {
    async fn authenticate(&self, credential: &Credential) -> AuthResult<AuthVerdict> {
        let Credential::Token { token } = credential else {
            return Err(AuthError::InvalidCredential(
                "token-info verifier requires a bearer token".to_string(),
            ));
        };

        match self.verifier.verify(token, &self.required_audiences).await {
            Ok(identity) => Ok(AuthVerdict::allow(Some(identity))),
            Err(e) => Ok(AuthVerdict::deny(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_token(payload: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(payload);
        format!("{header}.{payload}.sig")
    }

    fn far_future() -> i64 {
        4_102_444_800 // 2100-01-01
    }

    #[tokio::test]
    async fn test_verify_extracts_email_identity() {
        let verifier = JwtClaimsVerifier::from_params(&[]).unwrap();
        let token = make_token(&format!(
            r#"{{"sub":"u1","email":"alice@corp.example","exp":{}}}"#,
            far_future()
        ));

        let identity = verifier.verify(&token, &[]).await.unwrap();
        assert_eq!(identity, "alice@corp.example");
    }

    #[tokio::test]
    async fn test_verify_falls_back_to_sub() {
        let verifier = JwtClaimsVerifier::from_params(&[]).unwrap();
        let token = make_token(r#"{"sub":"service-account-7"}"#);

        let identity = verifier.verify(&token, &[]).await.unwrap();
        assert_eq!(identity, "service-account-7");
    }

    #[tokio::test]
    async fn test_expired_token_denied() {
        let verifier = JwtClaimsVerifier::from_params(&[]).unwrap();
        let token = make_token(r#"{"sub":"u1","exp":1000000}"#);

        let result = verifier.verify(&token, &[]).await;
        assert!(matches!(result, Err(AuthError::Denied(_))));
    }

    #[tokio::test]
    async fn test_audience_any_of_match() {
        let verifier =
            JwtClaimsVerifier::from_params(&["--audience=kafka".to_string()]).unwrap();

        let good = make_token(r#"{"sub":"u1","aud":["other","kafka"]}"#);
        assert!(verifier.verify(&good, &[]).await.is_ok());

        let bad = make_token(r#"{"sub":"u1","aud":"elsewhere"}"#);
        assert!(matches!(
            verifier.verify(&bad, &[]).await,
            Err(AuthError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn test_caller_required_audience() {
        let verifier = JwtClaimsVerifier::from_params(&[]).unwrap();
        let token = make_token(r#"{"sub":"u1","aud":"kafka"}"#);

        assert!(verifier
            .verify(&token, &["kafka".to_string()])
            .await
            .is_ok());
        assert!(verifier
            .verify(&token, &["payments".to_string()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_email_allow_list() {
        let verifier = JwtClaimsVerifier::from_params(&[
            "--email-regex=^.+@corp\\.example$".to_string(),
        ])
        .unwrap();

        let good = make_token(r#"{"email":"bob@corp.example"}"#);
        assert_eq!(verifier.verify(&good, &[]).await.unwrap(), "bob@corp.example");

        let outsider = make_token(r#"{"email":"mallory@evil.example"}"#);
        assert!(verifier.verify(&outsider, &[]).await.is_err());

        let no_email = make_token(r#"{"sub":"u1"}"#);
        assert!(verifier.verify(&no_email, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_token_denied() {
        let verifier = JwtClaimsVerifier::from_params(&[]).unwrap();
        assert!(verifier.verify("not-a-jwt", &[]).await.is_err());
        assert!(verifier.verify("a.b", &[]).await.is_err());
    }

    #[test]
    fn test_registry_builds_builtin() {
        let registry = TokenInfoRegistry::with_builtins();
        assert!(registry
            .create("jwt-claims", &["--audience=kafka".to_string()])
            .is_ok());
        assert!(matches!(
            registry.create("nonexistent", &[]),
            Err(ConfigError::TokenInfo { .. })
        ));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let result = JwtClaimsVerifier::from_params(&["--certs-url=http://x".to_string()]);
        assert!(matches!(result, Err(ConfigError::TokenInfo { .. })));
    }

    #[test]
    fn test_parse_flag_params() {
        let parsed = parse_flag_params(&[
            "--audience=a".to_string(),
            "--audience=b".to_string(),
            "-email-regex=.*".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed["audience"], vec!["a", "b"]);
        assert_eq!(parsed["email-regex"], vec![".*"]);

        assert!(parse_flag_params(&["audience=a".to_string()]).is_err());
        assert!(parse_flag_params(&["--audience".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_authenticator_adapter_denies_on_error() {
        let verifier: Arc<dyn TokenInfo> = Arc::new(JwtClaimsVerifier::from_params(&[]).unwrap());
        let authenticator = TokenInfoAuthenticator::new(verifier, vec![]);

        let verdict = authenticator
            .authenticate(&Credential::Token {
                token: "garbage".to_string(),
            })
            .await
            .unwrap();
        assert!(!verdict.allowed);

        let result = authenticator
            .authenticate(&Credential::Plain {
                username: "u".to_string(),
                password: "p".to_string(),
            })
            .await;
        assert!(matches!(result, Err(AuthError::InvalidCredential(_))));
    }
}
