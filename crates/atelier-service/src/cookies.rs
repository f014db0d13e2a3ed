//! Refresh-token cookie handling.
//!
//! The refresh token travels only in an HttpOnly cookie scoped to the auth
//! routes. `Secure` is set in production; SameSite=Lax keeps the cookie off
//! cross-site POSTs while still surviving top-level navigation.

use axum::http::header::COOKIE;
use axum::http::HeaderMap;

/// Cookie name for the refresh token.
pub const REFRESH_COOKIE: &str = "refresh_token";

/// Path the cookie is scoped to.
const COOKIE_PATH: &str = "/api/auth";

/// Build the `Set-Cookie` value carrying a fresh refresh token.
#[must_use]
pub fn build_refresh_cookie(token: &str, lifetime_days: i64, production: bool) -> String {
    let max_age = lifetime_days * 24 * 60 * 60;
    let mut cookie = format!(
        "{REFRESH_COOKIE}={token}; HttpOnly; SameSite=Lax; Path={COOKIE_PATH}; Max-Age={max_age}"
    );
    if production {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Build the `Set-Cookie` value that clears the refresh cookie.
#[must_use]
pub fn clear_refresh_cookie(production: bool) -> String {
    let mut cookie =
        format!("{REFRESH_COOKIE}=; HttpOnly; SameSite=Lax; Path={COOKIE_PATH}; Max-Age=0");
    if production {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Extract the refresh token from the request's `Cookie` header.
#[must_use]
pub fn refresh_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(REFRESH_COOKIE) {
            if let Some(value) = value.strip_prefix('=') {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}
