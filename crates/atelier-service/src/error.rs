//! API error type and the stable response envelope.
//!
//! Every JSON response, success or failure, is
//! `{success, message, code?, data?}`. The `code` field is the stable
//! machine-readable discriminator clients branch on; it never changes once
//! shipped. Data-layer errors are translated at this boundary and never
//! cross it as raw stack traces.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use atelier_core::ErrorCode;
use atelier_store::StoreError;

/// The response envelope shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    /// Whether the request succeeded.
    pub success: bool,
    /// Human-readable message.
    pub message: String,
    /// Stable machine-readable discriminator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    /// Payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    /// A success envelope with data.
    pub fn ok(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            code: None,
            data: Some(data),
        })
    }

    /// A success envelope with data and a code the client branches on.
    pub fn ok_with_code(message: impl Into<String>, code: ErrorCode, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            code: Some(code.as_str()),
            data: Some(data),
        })
    }
}

impl ApiResponse<()> {
    /// A success envelope without payload.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            code: None,
            data: None,
        })
    }
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Client-supplied data rejected.
    #[error("validation error: {0}")]
    Validation(String),

    /// A numeric field outside its allowed range.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// No credentials presented.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Access token failed signature or expiry checks.
    #[error("access token expired or invalid")]
    TokenInvalid,

    /// Wrong password at login.
    #[error("wrong password")]
    WrongPassword,

    /// Refresh session revoked or past its expiry.
    #[error("session expired")]
    SessionExpired,

    /// A rotated refresh token was presented again.
    #[error("refresh token reused")]
    RefreshTokenReused,

    /// Refresh called without an allow-listed Origin.
    #[error("origin not allowed")]
    OriginNotAllowed,

    /// Fixed-window rate limit tripped.
    #[error("rate limited")]
    RateLimited,

    /// Valid credentials but insufficient permissions.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource lookup failed; the code names the entity.
    #[error("{1}")]
    NotFound(ErrorCode, String),

    /// Conflicting state; the code names the conflict.
    #[error("{1}")]
    Conflict(ErrorCode, String),

    /// Onboarding must be completed first.
    #[error("onboarding incomplete")]
    OnboardingIncomplete,

    /// Paid plan selected but no confirmed subscription exists.
    #[error("payment required before completing onboarding")]
    PaymentRequired,

    /// OTP verification failed; the code says why.
    #[error("{1}")]
    CodeRejected(ErrorCode, String),

    /// Stripe call failed.
    #[error("stripe error: {0}")]
    Stripe(String),

    /// Email provider call failed.
    #[error("email error: {0}")]
    Email(String),

    /// Store operation failed.
    #[error("database error: {0}")]
    Db(String),

    /// Unhandled error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status and stable code for this error.
    #[must_use]
    pub fn status_and_code(&self) -> (StatusCode, ErrorCode) {
        match self {
            Self::Validation(_) => (StatusCode::BAD_REQUEST, ErrorCode::ValidationError),
            Self::InvalidRange(_) => (StatusCode::BAD_REQUEST, ErrorCode::InvalidRange),
            Self::NotAuthenticated => (StatusCode::UNAUTHORIZED, ErrorCode::NotAuthenticated),
            Self::TokenInvalid => (
                StatusCode::UNAUTHORIZED,
                ErrorCode::AccessTokenExpiredOrInvalid,
            ),
            Self::WrongPassword => (StatusCode::UNAUTHORIZED, ErrorCode::WrongPassword),
            Self::SessionExpired => (StatusCode::UNAUTHORIZED, ErrorCode::SessionExpired),
            Self::RefreshTokenReused => (StatusCode::UNAUTHORIZED, ErrorCode::RefreshTokenReused),
            Self::OriginNotAllowed => (StatusCode::FORBIDDEN, ErrorCode::OriginNotAllowed),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, ErrorCode::RateLimited),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, ErrorCode::MembershipNotFound),
            Self::NotFound(code, _) => (StatusCode::NOT_FOUND, *code),
            Self::Conflict(code, _) => (StatusCode::CONFLICT, *code),
            Self::OnboardingIncomplete => (StatusCode::FORBIDDEN, ErrorCode::OnboardingIncomplete),
            Self::PaymentRequired => (
                StatusCode::PAYMENT_REQUIRED,
                ErrorCode::OnboardingPaymentRequired,
            ),
            Self::CodeRejected(code, _) => (StatusCode::BAD_REQUEST, *code),
            Self::Stripe(_) => (StatusCode::BAD_GATEWAY, ErrorCode::StripeError),
            Self::Email(_) => (StatusCode::BAD_GATEWAY, ErrorCode::EmailError),
            Self::Db(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::DbError),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::ServerError),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Internal details are logged, not shipped to the client.
        let message = match &self {
            Self::Db(detail) => {
                tracing::error!(error = %detail, "Store operation failed");
                "A database error occurred".to_string()
            }
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "Internal server error");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ApiResponse::<()> {
            success: false,
            message,
            code: Some(code.as_str()),
            data: None,
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity } => match entity {
                "user" => Self::NotFound(ErrorCode::UserNotFound, "user not found".into()),
                "company" => Self::NotFound(ErrorCode::CompanyNotFound, "company not found".into()),
                "onboarding" => Self::NotFound(
                    ErrorCode::OnboardingIncomplete,
                    "onboarding record not found".into(),
                ),
                "invitation" => {
                    Self::NotFound(ErrorCode::InvitationNotFound, "invitation not found".into())
                }
                other => Self::NotFound(ErrorCode::ValidationError, format!("{other} not found")),
            },
            StoreError::Conflict { entity, detail } => match entity {
                "user" => Self::Conflict(ErrorCode::UserFound, detail),
                "onboarding" => Self::Conflict(ErrorCode::OnboardingAlreadyCompleted, detail),
                _ => Self::Conflict(ErrorCode::ValidationError, detail),
            },
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Db(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let Json(body) = ApiResponse::ok("done", serde_json::json!({"x": 1}));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "done");
        assert!(json.get("code").is_none());
        assert_eq!(json["data"]["x"], 1);
    }

    #[test]
    fn error_codes_are_stable() {
        let (status, code) = ApiError::TokenInvalid.status_and_code();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(code.as_str(), "ACCESS_TOKEN_EXPIRED_OR_INVALID");

        let (status, code) = ApiError::RateLimited.status_and_code();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(code.as_str(), "RATE_LIMITED");
    }

    #[test]
    fn store_conflict_maps_to_user_found() {
        let err: ApiError = StoreError::conflict("user", "email already registered").into();
        let (status, code) = err.status_and_code();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, ErrorCode::UserFound);
    }
}
