//! Service configuration.

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// PostgreSQL connection string.
    pub database_url: String,

    /// HS256 secret for access tokens.
    pub access_token_secret: String,

    /// Access token lifetime in seconds (default: 900).
    pub access_token_ttl_seconds: i64,

    /// Refresh token / cookie lifetime in days (default: 30).
    pub refresh_token_lifetime_days: i64,

    /// Allowed origins for CORS and the refresh anti-CSRF check.
    pub allowed_origins: Vec<String>,

    /// Whether the service runs in production (secure cookies).
    pub production: bool,

    /// Stripe API key (optional).
    pub stripe_secret_key: Option<String>,

    /// Stripe webhook signing secret (optional).
    pub stripe_webhook_secret: Option<String>,

    /// Resend API key (optional).
    pub resend_api_key: Option<String>,

    /// Sender address for outgoing email.
    pub resend_email: String,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/atelier".into()),
            access_token_secret: std::env::var("ACCESS_TOKEN_SECRET")
                .unwrap_or_else(|_| "dev-access-token-secret-change-me".into()),
            access_token_ttl_seconds: std::env::var("ACCESS_TOKEN_TTL_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(900),
            refresh_token_lifetime_days: std::env::var("REFRESH_TOKEN_LIFETIME_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:5173".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            production: std::env::var("PRODUCTION")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            stripe_secret_key: std::env::var("STRIPE_SECRET_KEY").ok(),
            stripe_webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            resend_email: std::env::var("RESEND_EMAIL")
                .unwrap_or_else(|_| "no-reply@atelier.dev".into()),
            max_body_bytes: std::env::var("MAX_BODY_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1024 * 1024), // 1MB
            request_timeout_seconds: std::env::var("REQUEST_TIMEOUT_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        }
    }

    /// Whether an `Origin` header value is on the allow-list.
    #[must_use]
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: "postgres://localhost/atelier".into(),
            access_token_secret: "dev-access-token-secret-change-me".into(),
            access_token_ttl_seconds: 900,
            refresh_token_lifetime_days: 30,
            allowed_origins: vec!["http://localhost:5173".into()],
            production: false,
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            resend_api_key: None,
            resend_email: "no-reply@atelier.dev".into(),
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_allow_list() {
        let config = ServiceConfig::default();
        assert!(config.origin_allowed("http://localhost:5173"));
        assert!(!config.origin_allowed("https://evil.example"));
    }
}
