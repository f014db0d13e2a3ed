//! Authentication handlers: signup with email OTP, login, refresh-token
//! rotation with theft detection, logout and contextual tokens.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::{ORIGIN, SET_COOKIE};
use axum::http::HeaderMap;
use axum::response::{AppendHeaders, IntoResponse};
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::{
    BranchId, Company, CompanyId, ErrorCode, Membership, MembershipStatus, Session, SessionId,
    User, VerificationCode, VerificationPurpose,
};

use crate::cookies::{build_refresh_cookie, clear_refresh_cookie, refresh_token_from_headers};
use crate::crypto::{constant_time_eq, hash_password, sha256_hex, verify_password};
use crate::error::{ApiError, ApiResponse};
use crate::extract::{AuthUser, ClientIp};
use crate::rate_limit::{LOGIN_LIMIT_PER_MIN, REFRESH_LIMIT_PER_MIN};
use crate::state::AppState;
use crate::tokens::{generate_refresh_token, generate_verification_code, CompanyContext};

/// Verification codes are valid for ten minutes.
const CODE_TTL_MINUTES: i64 = 10;

/// Minimum accepted password length.
const MIN_PASSWORD_LEN: usize = 8;

// ============================================================================
// check-user
// ============================================================================

/// Request body for `check-user`.
#[derive(Debug, Deserialize)]
pub struct CheckUserRequest {
    /// Email to look up.
    pub email: String,
}

/// Payload of `check-user`.
#[derive(Debug, Serialize)]
pub struct CheckUserResponse {
    /// Whether a user with this email exists.
    pub exists: bool,
}

/// Report whether an email is already registered. The `code` field is the
/// discriminator the signup wizard branches on.
pub async fn check_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CheckUserRequest>,
) -> Result<Json<ApiResponse<CheckUserResponse>>, ApiError> {
    let email = normalize_email(&body.email)?;
    let exists = state.store.get_user_by_email(&email).await?.is_some();

    let (message, code) = if exists {
        ("User already registered", ErrorCode::UserFound)
    } else {
        ("Email is available", ErrorCode::UserNotFound)
    };
    Ok(ApiResponse::ok_with_code(
        message,
        code,
        CheckUserResponse { exists },
    ))
}

// ============================================================================
// send-code
// ============================================================================

/// Request body for `send-code`.
#[derive(Debug, Deserialize)]
pub struct SendCodeRequest {
    /// Email to verify.
    pub email: String,
}

/// Issue a signup verification code and email it.
pub async fn send_code(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendCodeRequest>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let email = normalize_email(&body.email)?;

    if state.store.get_user_by_email(&email).await?.is_some() {
        return Err(ApiError::Conflict(
            ErrorCode::UserFound,
            "email already registered".into(),
        ));
    }

    let code = generate_verification_code();
    let record = VerificationCode {
        email: email.clone(),
        purpose: VerificationPurpose::Signup,
        code_hash: sha256_hex(&code),
        attempts: 0,
        expires_at: Utc::now() + Duration::minutes(CODE_TTL_MINUTES),
        created_at: Utc::now(),
    };
    state.store.put_verification_code(&record).await?;

    if let Some(mailer) = &state.mailer {
        mailer
            .send_verification_code(&email, &code)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to send verification code");
                ApiError::Email("failed to send verification code".into())
            })?;
    } else {
        tracing::warn!(email = %email, "Mailer not configured - verification code not delivered");
    }

    Ok(ApiResponse::message("Verification code sent"))
}

// ============================================================================
// signup
// ============================================================================

/// Request body for `signup`.
#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    /// Email being registered.
    pub email: String,
    /// Chosen password.
    pub password: String,
    /// OTP from the verification email.
    pub code: String,
}

/// Payload of `signup`.
#[derive(Debug, Serialize)]
pub struct SignupResponse {
    /// The created user.
    pub user: User,
}

/// Create a user after verifying email ownership via OTP.
pub async fn signup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignupRequest>,
) -> Result<Json<ApiResponse<SignupResponse>>, ApiError> {
    let email = normalize_email(&body.email)?;
    if body.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    consume_verification_code(&state, &email, &body.code).await?;

    let password_hash = hash_password(&body.password)
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))?;

    let user = state
        .store
        .create_user(atelier_store::NewUser {
            email: email.clone(),
            password_hash,
            verified: true,
        })
        .await?;

    state
        .store
        .delete_verification_code(&email, VerificationPurpose::Signup)
        .await?;

    tracing::info!(user_id = %user.id, "User registered");
    Ok(ApiResponse::ok("Account created", SignupResponse { user }))
}

/// Check a presented OTP against the stored hash, burning attempts.
async fn consume_verification_code(
    state: &AppState,
    email: &str,
    code: &str,
) -> Result<(), ApiError> {
    let record = state
        .store
        .get_verification_code(email, VerificationPurpose::Signup)
        .await?
        .ok_or_else(|| {
            ApiError::CodeRejected(ErrorCode::InvalidCode, "no code issued for this email".into())
        })?;

    if record.expires_at <= Utc::now() {
        return Err(ApiError::CodeRejected(
            ErrorCode::CodeExpired,
            "verification code expired".into(),
        ));
    }
    if record.attempts >= atelier_core::user::MAX_CODE_ATTEMPTS {
        return Err(ApiError::CodeRejected(
            ErrorCode::TooManyAttempts,
            "too many attempts, request a new code".into(),
        ));
    }

    if !constant_time_eq(&record.code_hash, &sha256_hex(code)) {
        state
            .store
            .increment_code_attempts(email, VerificationPurpose::Signup)
            .await?;
        return Err(ApiError::CodeRejected(
            ErrorCode::InvalidCode,
            "wrong verification code".into(),
        ));
    }

    Ok(())
}

// ============================================================================
// login
// ============================================================================

/// Request body for `login`.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Login email.
    pub email: String,
    /// Password.
    pub password: String,
    /// Client-generated device fingerprint.
    pub fingerprint: String,
}

/// Payload of the token-issuing endpoints.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    /// The access token.
    pub access_token: String,
    /// Token expiry (unix seconds).
    pub expires_at: i64,
    /// The authenticated user, on login.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

/// Password login. Creates or rotates the device session and sets the
/// refresh cookie.
pub async fn login(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.limiter.check(&ip, "login", LOGIN_LIMIT_PER_MIN) {
        return Err(ApiError::RateLimited);
    }

    let email = normalize_email(&body.email)?;
    if body.fingerprint.trim().is_empty() {
        return Err(ApiError::Validation("fingerprint is required".into()));
    }

    let user = state
        .store
        .get_user_by_email(&email)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(ErrorCode::UserNotFound, "no account for this email".into())
        })?;

    if !verify_password(&body.password, &user.password_hash) {
        return Err(ApiError::WrongPassword);
    }

    let refresh_token = generate_refresh_token();
    let now = Utc::now();
    let session = state
        .store
        .upsert_login_session(Session {
            id: SessionId::generate(),
            user_id: user.id,
            fingerprint: body.fingerprint.clone(),
            refresh_token_hash: sha256_hex(&refresh_token),
            revoked: false,
            expires_at: now + Duration::days(state.config.refresh_token_lifetime_days),
            last_activity_at: now,
            created_at: now,
        })
        .await?;

    let (access_token, expires_at) = state
        .tokens
        .generate_access_token(user.id, Some(session.id), None)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let cookie = build_refresh_cookie(
        &refresh_token,
        state.config.refresh_token_lifetime_days,
        state.config.production,
    );

    tracing::info!(user_id = %user.id, fingerprint = %body.fingerprint, "Login");

    Ok((
        AppendHeaders([(SET_COOKIE, cookie)]),
        ApiResponse::ok(
            "Logged in",
            TokenResponse {
                access_token,
                expires_at,
                user: Some(user),
            },
        ),
    ))
}

// ============================================================================
// refresh
// ============================================================================

/// Request body for `refresh`.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    /// Client-generated device fingerprint.
    pub fingerprint: String,
}

/// Single-use refresh-token rotation with theft detection.
///
/// The presented token must hash to the stored value; a mismatch is
/// treated as token theft and revokes every session of the user. The
/// rotation itself is a conditional update, so a legitimate double-refresh
/// race has exactly one winner and the loser fails with 401 without
/// tripping theft detection.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Json(body): Json<RefreshRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Lightweight anti-CSRF: refresh only from allow-listed origins.
    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::OriginNotAllowed)?;
    if !state.config.origin_allowed(origin) {
        return Err(ApiError::OriginNotAllowed);
    }

    if !state.limiter.check(&ip, "refresh", REFRESH_LIMIT_PER_MIN) {
        return Err(ApiError::RateLimited);
    }

    let presented = refresh_token_from_headers(&headers).ok_or(ApiError::NotAuthenticated)?;

    let session = state
        .store
        .find_session_by_fingerprint(&body.fingerprint)
        .await?
        .ok_or(ApiError::SessionExpired)?;

    if !session.is_usable(Utc::now()) {
        return Err(ApiError::SessionExpired);
    }

    let presented_hash = sha256_hex(&presented);
    if !constant_time_eq(&presented_hash, &session.refresh_token_hash) {
        // A token that does not match the live session was rotated away
        // earlier: someone is replaying it. Fail closed for the whole user.
        let revoked = state
            .store
            .revoke_all_sessions_for_user(session.user_id)
            .await?;
        tracing::warn!(
            user_id = %session.user_id,
            fingerprint = %body.fingerprint,
            sessions_revoked = revoked,
            "Refresh token reuse detected - all sessions revoked"
        );
        return Err(ApiError::RefreshTokenReused);
    }

    let new_token = generate_refresh_token();
    let new_expiry = Utc::now() + Duration::days(state.config.refresh_token_lifetime_days);
    let rotated = state
        .store
        .rotate_session(session.id, &presented_hash, &sha256_hex(&new_token), new_expiry)
        .await?;

    if !rotated {
        // Lost a concurrent rotation race; the other request holds the new
        // token. Not theft.
        return Err(ApiError::SessionExpired);
    }

    let (access_token, expires_at) = state
        .tokens
        .generate_access_token(session.user_id, Some(session.id), None)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let cookie = build_refresh_cookie(
        &new_token,
        state.config.refresh_token_lifetime_days,
        state.config.production,
    );

    Ok((
        AppendHeaders([(SET_COOKIE, cookie)]),
        ApiResponse::ok(
            "Token refreshed",
            TokenResponse {
                access_token,
                expires_at,
                user: None,
            },
        ),
    ))
}

// ============================================================================
// logout / logout-all
// ============================================================================

/// Request body for `logout`.
#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    /// Client-generated device fingerprint.
    pub fingerprint: String,
}

/// Revoke the presented device session and clear the cookie.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LogoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(presented) = refresh_token_from_headers(&headers) {
        if let Some(session) = state
            .store
            .find_session_by_fingerprint(&body.fingerprint)
            .await?
        {
            if constant_time_eq(&sha256_hex(&presented), &session.refresh_token_hash) {
                state.store.revoke_session(session.id).await?;
            }
        }
    }

    Ok((
        AppendHeaders([(SET_COOKIE, clear_refresh_cookie(state.config.production))]),
        ApiResponse::message("Logged out"),
    ))
}

/// Revoke every session of the authenticated user.
pub async fn logout_all(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let revoked = state
        .store
        .revoke_all_sessions_for_user(auth.user_id)
        .await?;
    tracing::info!(user_id = %auth.user_id, sessions_revoked = revoked, "Logout all");

    Ok((
        AppendHeaders([(SET_COOKIE, clear_refresh_cookie(state.config.production))]),
        ApiResponse::message("All sessions revoked"),
    ))
}

// ============================================================================
// me
// ============================================================================

/// One membership with its company.
#[derive(Debug, Serialize)]
pub struct MembershipView {
    /// The membership row.
    pub membership: Membership,
    /// The company it belongs to.
    pub company: Company,
}

/// Payload of `me`.
#[derive(Debug, Serialize)]
pub struct MeResponse {
    /// The authenticated user.
    pub user: User,
    /// Their memberships.
    pub memberships: Vec<MembershipView>,
}

/// The authenticated user with their memberships.
pub async fn me(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<ApiResponse<MeResponse>>, ApiError> {
    let user = state
        .store
        .get_user(auth.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(ErrorCode::UserNotFound, "user not found".into()))?;

    let memberships = state
        .store
        .list_memberships_for_user(auth.user_id)
        .await?
        .into_iter()
        .map(|(membership, company)| MembershipView {
            membership,
            company,
        })
        .collect();

    Ok(ApiResponse::ok("OK", MeResponse { user, memberships }))
}

// ============================================================================
// context-token
// ============================================================================

/// Request body for `context-token`.
#[derive(Debug, Deserialize)]
pub struct ContextTokenRequest {
    /// The company to scope the token to.
    pub company_id: CompanyId,
    /// Optional branch scope.
    pub branch_id: Option<BranchId>,
}

/// Issue a contextual access token for an active company/branch selection.
///
/// Membership is verified here, once; the resulting token carries the
/// role/permission snapshot and is not re-checked against the database on
/// every protected call.
pub async fn context_token(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<ContextTokenRequest>,
) -> Result<Json<ApiResponse<TokenResponse>>, ApiError> {
    let membership = state
        .store
        .get_membership(auth.user_id, body.company_id)
        .await?
        .ok_or_else(|| ApiError::Forbidden("not a member of this company".into()))?;

    if membership.status != MembershipStatus::Active {
        return Err(ApiError::Forbidden("membership is not active".into()));
    }

    if let Some(branch_id) = body.branch_id {
        let branch = state
            .store
            .get_branch(branch_id)
            .await?
            .filter(|b| b.company_id == body.company_id)
            .ok_or_else(|| {
                ApiError::NotFound(ErrorCode::BranchNotFound, "branch not found".into())
            })?;
        tracing::debug!(branch_id = %branch.id, "Branch scope selected");
    }

    let context = CompanyContext {
        company_id: body.company_id,
        branch_id: body.branch_id,
        role: membership.role,
        permissions: membership.permissions.clone(),
    };

    let (access_token, expires_at) = state
        .tokens
        .generate_access_token(auth.user_id, auth.session_id, Some(&context))
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(ApiResponse::ok(
        "Context token issued",
        TokenResponse {
            access_token,
            expires_at,
            user: None,
        },
    ))
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Lowercase and minimally validate an email address.
fn normalize_email(email: &str) -> Result<String, ApiError> {
    let email = email.trim().to_lowercase();
    let valid = email.contains('@')
        && !email.starts_with('@')
        && !email.ends_with('@')
        && email.len() <= 255;
    if valid {
        Ok(email)
    } else {
        Err(ApiError::Validation("invalid email address".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::UserId;
    use std::str::FromStr;

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email(" A@B.co ").unwrap(), "a@b.co");
        assert!(normalize_email("not-an-email").is_err());
        assert!(normalize_email("@b.co").is_err());
        assert!(normalize_email("a@").is_err());
    }

    #[test]
    fn user_id_parse_helper() {
        // UserId FromStr is exercised by the extractor; keep a local guard.
        assert!(UserId::from_str("not-a-uuid").is_err());
    }
}
