//! The token service: short-lived JWT access tokens and opaque rotating
//! refresh tokens.
//!
//! Access tokens are capability tokens: a contextual token carries the
//! active company/branch scope and a permission snapshot taken at issue
//! time, so protected calls do not re-derive authorization from the
//! database. Refresh tokens are 512-bit random values; only their SHA-256
//! hash is ever persisted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use atelier_core::{BranchId, CompanyId, Role, SessionId, UserId};

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// User id.
    pub sub: String,
    /// Session id, for activity tracking on authenticated requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Active company scope, when contextual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    /// Active branch scope, when contextual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Role snapshot, when contextual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Permission snapshot, when contextual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Company/branch scope baked into a contextual token.
#[derive(Debug, Clone)]
pub struct CompanyContext {
    /// The active company.
    pub company_id: CompanyId,
    /// The active branch, if one is selected.
    pub branch_id: Option<BranchId>,
    /// Role snapshot.
    pub role: Role,
    /// Permission snapshot.
    pub permissions: Vec<String>,
}

/// Token signing/verification errors.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Signing failed.
    #[error("failed to sign token: {0}")]
    Sign(jsonwebtoken::errors::Error),

    /// Signature or expiry check failed.
    #[error("invalid token")]
    Invalid,
}

/// Issues and verifies access tokens.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenService {
    /// Create a token service from the configured HS256 secret.
    #[must_use]
    pub fn new(secret: &str, ttl_seconds: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Issue an access token for a user, optionally scoped to a company
    /// context and bound to a session for activity tracking.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Sign`] if signing fails.
    pub fn generate_access_token(
        &self,
        user_id: UserId,
        session_id: Option<SessionId>,
        context: Option<&CompanyContext>,
    ) -> Result<(String, i64), TokenError> {
        let now = Utc::now();
        let exp = (now + self.ttl).timestamp();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            sid: session_id.map(|s| s.to_string()),
            company_id: context.map(|c| c.company_id.to_string()),
            branch_id: context.and_then(|c| c.branch_id.map(|b| b.to_string())),
            role: context.map(|c| c.role.as_str().to_string()),
            permissions: context.map(|c| c.permissions.clone()),
            iat: now.timestamp(),
            exp,
        };

        encode(&Header::default(), &claims, &self.encoding)
            .map(|token| (token, exp))
            .map_err(TokenError::Sign)
    }

    /// Verify an access token.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Invalid`] on any signature or expiry failure;
    /// callers map this to a 401 with `ACCESS_TOKEN_EXPIRED_OR_INVALID`.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let mut validation = Validation::default();
        validation.validate_exp = true;

        decode::<AccessClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|_| TokenError::Invalid)
    }
}

/// Generate a 512-bit random refresh token, URL-safe base64 encoded.
/// The raw value goes to the cookie; storage only ever sees its hash.
#[must_use]
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate an invitation token (256-bit, URL-safe base64).
#[must_use]
pub fn generate_invitation_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a 6-digit verification code.
#[must_use]
pub fn generate_verification_code() -> String {
    let n = rand::Rng::gen_range(&mut rand::thread_rng(), 0..1_000_000u32);
    format!("{n:06}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret", 900)
    }

    #[test]
    fn naked_token_roundtrip() {
        let user_id = UserId::generate();
        let (token, exp) = service()
            .generate_access_token(user_id, None, None)
            .unwrap();

        let claims = service().verify_access_token(&token).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert!(claims.company_id.is_none());
        assert!(claims.permissions.is_none());
        assert_eq!(claims.exp, exp);
    }

    #[test]
    fn contextual_token_carries_scope() {
        let user_id = UserId::generate();
        let session_id = SessionId::generate();
        let context = CompanyContext {
            company_id: CompanyId::generate(),
            branch_id: Some(BranchId::generate()),
            role: Role::Owner,
            permissions: Role::Owner.default_permissions(),
        };

        let (token, _) = service()
            .generate_access_token(user_id, Some(session_id), Some(&context))
            .unwrap();
        let claims = service().verify_access_token(&token).unwrap();

        assert_eq!(claims.company_id, Some(context.company_id.to_string()));
        assert_eq!(
            claims.branch_id,
            context.branch_id.map(|b| b.to_string())
        );
        assert_eq!(claims.role.as_deref(), Some("owner"));
        assert_eq!(claims.sid, Some(session_id.to_string()));
        assert!(claims
            .permissions
            .unwrap()
            .contains(&"billing:manage".to_string()));
    }

    #[test]
    fn wrong_secret_rejected() {
        let (token, _) = service()
            .generate_access_token(UserId::generate(), None, None)
            .unwrap();
        let other = TokenService::new("other-secret", 900);
        assert!(other.verify_access_token(&token).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let expired = TokenService::new("test-secret", -120);
        let (token, _) = expired
            .generate_access_token(UserId::generate(), None, None)
            .unwrap();
        assert!(expired.verify_access_token(&token).is_err());
    }

    #[test]
    fn refresh_tokens_are_unique_and_long() {
        let a = generate_refresh_token();
        let b = generate_refresh_token();
        assert_ne!(a, b);
        // 64 bytes -> 86 base64url chars, no padding
        assert_eq!(a.len(), 86);
    }

    #[test]
    fn verification_code_is_six_digits() {
        for _ in 0..50 {
            let code = generate_verification_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
