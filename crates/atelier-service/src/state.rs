//! Application state.

use std::sync::Arc;

use atelier_store::Store;

use crate::config::ServiceConfig;
use crate::email::ResendClient;
use crate::rate_limit::RateLimiter;
use crate::stripe::StripeClient;
use crate::tokens::TokenService;

/// Application state shared across handlers.
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Access-token issuing/verification.
    pub tokens: TokenService,

    /// Per-IP fixed-window limiter for login/refresh.
    pub limiter: RateLimiter,

    /// Stripe client (optional).
    pub stripe: Option<Arc<StripeClient>>,

    /// Resend mailer (optional).
    pub mailer: Option<Arc<ResendClient>>,
}

impl AppState {
    /// Create application state, wiring optional integrations from config.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        let stripe = config.stripe_secret_key.as_ref().map(|key| {
            tracing::info!("Stripe integration enabled");
            Arc::new(StripeClient::new(key, config.stripe_webhook_secret.clone()))
        });
        if stripe.is_none() {
            tracing::warn!("Stripe not configured - billing endpoints will be unavailable");
        }

        let mailer = config.resend_api_key.as_ref().map(|key| {
            tracing::info!("Resend integration enabled");
            Arc::new(ResendClient::new(key, &config.resend_email))
        });
        if mailer.is_none() {
            tracing::warn!("Resend not configured - emails will be logged, not sent");
        }

        Self::with_clients(store, config, stripe, mailer)
    }

    /// Create application state with explicit clients (used by tests to
    /// point Stripe/Resend at mock servers).
    #[must_use]
    pub fn with_clients(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        stripe: Option<Arc<StripeClient>>,
        mailer: Option<Arc<ResendClient>>,
    ) -> Self {
        let tokens = TokenService::new(
            &config.access_token_secret,
            config.access_token_ttl_seconds,
        );
        Self {
            store,
            config,
            tokens,
            limiter: RateLimiter::new(),
            stripe,
            mailer,
        }
    }
}
