//! Bearer token validation for the realtime handshake.
//!
//! Token format: `base64url(claims_json) "." base64url(hmac_sha256(secret, first_part))`,
//! both parts unpadded. The hub only validates tokens; [`TokenValidator::sign`]
//! exists for provisioning tools and tests.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::hmac;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sl_core::config::{AuthConfig, ConfigError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: node name, observer user id, etc.
    pub sub: String,
    /// Identity a node connection acts as. Absent for observer tokens.
    #[serde(rename = "nodeId", default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<Uuid>,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

impl Claims {
    pub fn node(sub: impl Into<String>, node_id: Uuid, ttl: chrono::Duration) -> Self {
        Self {
            sub: sub.into(),
            node_id: Some(node_id),
            exp: (chrono::Utc::now() + ttl).timestamp(),
        }
    }

    pub fn observer(sub: impl Into<String>, ttl: chrono::Duration) -> Self {
        Self {
            sub: sub.into(),
            node_id: None,
            exp: (chrono::Utc::now() + ttl).timestamp(),
        }
    }

    pub fn require_node_id(&self) -> Result<Uuid, AuthError> {
        self.node_id.ok_or(AuthError::MissingNodeClaim)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no access token presented")]
    MissingToken,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token carries no nodeId claim")]
    MissingNodeClaim,
}

/// HMAC-SHA256 token checker keyed with the hub secret.
pub struct TokenValidator {
    key: hmac::Key,
    leeway_secs: i64,
}

impl TokenValidator {
    pub fn new(secret: &[u8], leeway_secs: u64) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            leeway_secs: i64::try_from(leeway_secs).unwrap_or(i64::MAX),
        }
    }

    /// Read the secret from the environment variable named in `auth`.
    pub fn from_config(auth: &AuthConfig) -> Result<Self, ConfigError> {
        let secret = auth.token_secret()?;
        Ok(Self::new(secret.as_bytes(), auth.leeway_secs))
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let json = serde_json::to_vec(claims).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let body = URL_SAFE_NO_PAD.encode(json);
        let tag = hmac::sign(&self.key, body.as_bytes());
        Ok(format!("{body}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }

    /// Verify signature and expiry, returning the claims.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let (body, sig) = token
            .split_once('.')
            .ok_or_else(|| AuthError::Malformed("expected <claims>.<signature>".into()))?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|e| AuthError::Malformed(format!("signature: {e}")))?;
        hmac::verify(&self.key, body.as_bytes(), &sig).map_err(|_| AuthError::BadSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| AuthError::Malformed(format!("claims: {e}")))?;
        let claims: Claims =
            serde_json::from_slice(&json).map_err(|e| AuthError::Malformed(e.to_string()))?;

        if claims.exp.saturating_add(self.leeway_secs) < chrono::Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    /// Validate an optional query-string token.
    pub fn validate_opt(&self, token: Option<&str>) -> Result<Claims, AuthError> {
        self.validate(token.ok_or(AuthError::MissingToken)?)
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("leeway_secs", &self.leeway_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(b"test-secret", 0)
    }

    #[test]
    fn sign_then_validate() {
        let v = validator();
        let node = Uuid::new_v4();
        let token = v.sign(&Claims::node("node-a", node, chrono::Duration::minutes(5))).unwrap();
        let claims = v.validate(&token).unwrap();
        assert_eq!(claims.node_id, Some(node));
        assert_eq!(claims.require_node_id().unwrap(), node);
    }

    #[test]
    fn observer_token_has_no_node_claim() {
        let v = validator();
        let token = v.sign(&Claims::observer("dash", chrono::Duration::minutes(5))).unwrap();
        let claims = v.validate(&token).unwrap();
        assert_eq!(claims.require_node_id(), Err(AuthError::MissingNodeClaim));
        assert!(!token.contains("nodeId"));
    }

    #[test]
    fn expired_token_rejected() {
        let v = validator();
        let token = v.sign(&Claims::observer("dash", chrono::Duration::minutes(-5))).unwrap();
        assert_eq!(v.validate(&token), Err(AuthError::Expired));
    }

    #[test]
    fn leeway_tolerates_small_skew() {
        let v = TokenValidator::new(b"test-secret", 120);
        let token = v.sign(&Claims::observer("dash", chrono::Duration::seconds(-30))).unwrap();
        assert!(v.validate(&token).is_ok());
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = validator()
            .sign(&Claims::observer("dash", chrono::Duration::minutes(5)))
            .unwrap();
        let other = TokenValidator::new(b"other", 0);
        assert_eq!(other.validate(&token), Err(AuthError::BadSignature));
    }

    #[test]
    fn tampered_claims_rejected() {
        let v = validator();
        let token = v.sign(&Claims::node("a", Uuid::new_v4(), chrono::Duration::minutes(5))).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged_claims = Claims::node("a", Uuid::new_v4(), chrono::Duration::minutes(5));
        let forged_body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        assert_eq!(
            v.validate(&format!("{forged_body}.{sig}")),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn garbage_is_malformed_or_missing() {
        let v = validator();
        assert_eq!(v.validate(""), Err(AuthError::MissingToken));
        assert_eq!(v.validate_opt(None), Err(AuthError::MissingToken));
        assert!(matches!(v.validate("no-dot"), Err(AuthError::Malformed(_))));
        assert!(matches!(v.validate("abc.!!!"), Err(AuthError::Malformed(_))));
    }

    #[test]
    fn unparsable_node_claim_is_malformed() {
        let v = validator();
        let body = URL_SAFE_NO_PAD.encode(br#"{"sub":"x","nodeId":"not-a-uuid","exp":99999999999}"#);
        let tag = hmac::sign(&v.key, body.as_bytes());
        let token = format!("{body}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref()));
        assert!(matches!(v.validate(&token), Err(AuthError::Malformed(_))));
    }
}
