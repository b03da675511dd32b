//! Bearer-token authentication.
//!
//! Callers present an HS256 JWT issued by the auth provider. The verified
//! claims are carried as-is into caller-scoped database work, where they are
//! installed as `request.jwt.claims` so row-level security applies.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::errors::AppError;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed token: {0}")]
    Malformed(&'static str),

    #[error("unsupported signing algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("signature mismatch")]
    BadSignature,

    #[error("token expired")]
    Expired,
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct Caller {
    /// `sub` claim: the auth user id.
    pub user_id: String,
    /// Full verified claim set, forwarded to the data layer.
    pub claims: Value,
}

impl Caller {
    /// A UUID claim, read from the top level or from `app_metadata`, where the
    /// auth provider puts server-assigned attributes. `Ok(None)` when absent.
    pub fn claimed_uuid(&self, key: &str) -> Result<Option<Uuid>, AuthError> {
        let value = self
            .claims
            .get(key)
            .or_else(|| self.claims.get("app_metadata").and_then(|m| m.get(key)))
            .filter(|v| !v.is_null());
        match value {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .and_then(|s| Uuid::parse_str(s.trim()).ok())
                .map(Some)
                .ok_or(AuthError::Malformed("claim is not a UUID")),
        }
    }
}

#[derive(Clone)]
pub struct JwtVerifier {
    secret: Vec<u8>,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Caller, AuthError> {
        self.verify_at(token, chrono::Utc::now().timestamp())
    }

    fn verify_at(&self, token: &str, now: i64) -> Result<Caller, AuthError> {
        let token = token.trim();
        let (signing_input, signature) = token
            .rsplit_once('.')
            .ok_or(AuthError::Malformed("expected three segments"))?;
        let (header, payload) = signing_input
            .split_once('.')
            .filter(|(_, p)| !p.contains('.'))
            .ok_or(AuthError::Malformed("expected three segments"))?;

        let header: Value = decode_segment(header)?;
        let alg = header["alg"].as_str().unwrap_or_default();
        if alg != "HS256" {
            return Err(AuthError::UnsupportedAlgorithm(alg.to_string()));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature.trim_end_matches('='))
            .map_err(|_| AuthError::Malformed("signature is not base64url"))?;

        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| AuthError::Malformed("unusable secret"))?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Value = decode_segment(payload)?;
        if let Some(exp) = claims["exp"].as_i64() {
            if exp <= now {
                return Err(AuthError::Expired);
            }
        }

        let user_id = claims["sub"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::Malformed("missing sub claim"))?
            .to_string();

        Ok(Caller { user_id, claims })
    }
}

fn decode_segment(segment: &str) -> Result<Value, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| AuthError::Malformed("segment is not base64url"))?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::Malformed("segment is not JSON"))
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.strip_prefix("Bearer ")
                    .or_else(|| v.strip_prefix("bearer "))
            })
            .filter(|t| !t.trim().is_empty())
            .ok_or(AuthError::MissingToken)?;

        Ok(state.jwt.verify(token)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Builds a signed HS256 token; shared with handler tests.
    pub(crate) fn sign(secret: &str, claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{header}.{payload}").as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{header}.{payload}.{signature}")
    }

    #[test]
    fn test_valid_token_yields_caller() {
        let verifier = JwtVerifier::new("secret");
        let token = sign(
            "secret",
            &json!({"sub": "user-1", "role": "authenticated", "exp": 2_000}),
        );
        let caller = verifier.verify_at(&token, 1_000).unwrap();
        assert_eq!(caller.user_id, "user-1");
        assert_eq!(caller.claims["role"], json!("authenticated"));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let verifier = JwtVerifier::new("secret");
        let token = sign("other", &json!({"sub": "user-1"}));
        assert!(matches!(
            verifier.verify_at(&token, 0),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let verifier = JwtVerifier::new("secret");
        let token = sign("secret", &json!({"sub": "user-1", "exp": 999}));
        assert!(matches!(
            verifier.verify_at(&token, 1_000),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let verifier = JwtVerifier::new("secret");
        let token = sign("secret", &json!({"sub": "user-1"}));
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(json!({"sub": "admin"}).to_string());
        parts[1] = &forged;
        assert!(matches!(
            verifier.verify_at(&parts.join("."), 0),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn test_claimed_uuid_reads_top_level_and_app_metadata() {
        let org = Uuid::new_v4();
        let specialist = Uuid::new_v4();
        let caller = Caller {
            user_id: "user-1".into(),
            claims: json!({
                "sub": "user-1",
                "organization_id": org.to_string(),
                "app_metadata": {"hr_specialist_id": specialist.to_string()},
                "role_hint": "not-a-uuid"
            }),
        };
        assert_eq!(caller.claimed_uuid("organization_id").unwrap(), Some(org));
        assert_eq!(caller.claimed_uuid("hr_specialist_id").unwrap(), Some(specialist));
        assert!(matches!(
            caller.claimed_uuid("role_hint"),
            Err(AuthError::Malformed(_))
        ));
        assert_eq!(caller.claimed_uuid("conversation_id").unwrap(), None);
    }

    #[test]
    fn test_garbage_token_is_malformed() {
        let verifier = JwtVerifier::new("secret");
        assert!(matches!(
            verifier.verify_at("not-a-jwt", 0),
            Err(AuthError::Malformed(_))
        ));
    }
}
