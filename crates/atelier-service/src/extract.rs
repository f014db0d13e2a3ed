//! Request extractors: authenticated user, company scope and client IP.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use atelier_core::{BranchId, CompanyId, SessionId, UserId};

use crate::error::ApiError;
use crate::state::AppState;
use crate::tokens::AccessClaims;

/// An authenticated user extracted from a Bearer access token.
///
/// Extraction also fires a non-blocking `last_activity_at` touch for the
/// session the token was minted on; failures there are logged and never
/// affect the request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The user id from `sub`.
    pub user_id: UserId,
    /// The session the token belongs to, when present.
    pub session_id: Option<SessionId>,
    /// The full claim set.
    pub claims: AccessClaims,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::NotAuthenticated)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::NotAuthenticated)?;

        let claims = state
            .tokens
            .verify_access_token(token)
            .map_err(|_| ApiError::TokenInvalid)?;

        let user_id = UserId::from_str(&claims.sub).map_err(|_| ApiError::TokenInvalid)?;
        let session_id = claims
            .sid
            .as_deref()
            .and_then(|s| SessionId::from_str(s).ok());

        // Fire-and-forget activity touch; must never block or fail the
        // request.
        if let Some(session_id) = session_id {
            let store = Arc::clone(&state.store);
            tokio::spawn(async move {
                if let Err(e) = store.touch_session_activity(session_id).await {
                    tracing::debug!(error = %e, "Failed to touch session activity");
                }
            });
        }

        Ok(AuthUser {
            user_id,
            session_id,
            claims,
        })
    }
}

/// An authenticated user with an active company context.
///
/// Requires a contextual access token; the scope is read from the token's
/// claim snapshot, not re-derived from the database.
#[derive(Debug, Clone)]
pub struct CompanyScope {
    /// The user id.
    pub user_id: UserId,
    /// The active company.
    pub company_id: CompanyId,
    /// The active branch, if one is selected.
    pub branch_id: Option<BranchId>,
    /// Role snapshot from the token.
    pub role: String,
    /// Permission snapshot from the token.
    pub permissions: Vec<String>,
    /// The session the token belongs to.
    pub session_id: Option<SessionId>,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CompanyScope {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth = AuthUser::from_request_parts(parts, state).await?;

        let company_id = auth
            .claims
            .company_id
            .as_deref()
            .and_then(|s| CompanyId::from_str(s).ok())
            .ok_or_else(|| ApiError::Forbidden("no active company context".into()))?;

        let branch_id = auth
            .claims
            .branch_id
            .as_deref()
            .and_then(|s| BranchId::from_str(s).ok());

        Ok(CompanyScope {
            user_id: auth.user_id,
            company_id,
            branch_id,
            role: auth.claims.role.unwrap_or_default(),
            permissions: auth.claims.permissions.unwrap_or_default(),
            session_id: auth.session_id,
        })
    }
}

impl CompanyScope {
    /// Whether the permission snapshot carries a permission.
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// Require a permission, mapping absence to 403.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Forbidden`] when the snapshot lacks it.
    pub fn require_permission(&self, permission: &str) -> Result<(), ApiError> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "missing permission: {permission}"
            )))
        }
    }
}

/// Best-effort client IP for rate limiting: `X-Forwarded-For` first hop,
/// then `X-Real-Ip`, else a fixed local key.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .or_else(|| {
                parts
                    .headers
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| "local".to_string());

        Ok(Self(ip))
    }
}
