//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{auth, billing, onboarding, webhooks};
use crate::state::AppState;

/// Maximum concurrent requests for the JSON API.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Auth (`/api/auth`)
/// - `POST /check-user`, `POST /send-code`, `POST /signup`
/// - `POST /login` (rate limited), `POST /refresh` (rate limited,
///   origin-checked), `POST /logout`, `POST /logout-all`
/// - `GET /me`, `POST /context-token`
///
/// ## Shared (`/api/shared`)
/// - `POST /companies` - company bootstrap
/// - `GET /onboarding/sync-step`, `GET /onboarding/data`
/// - `POST /onboarding/next`, `POST /onboarding/back`,
///   `POST /onboarding/update-draft`
/// - `GET /plans`, `GET /plugins`
/// - `POST /invitations`, `POST /invitations/accept`
///
/// ## Billing (`/api/billing`)
/// - `POST /price-preview`, `POST /create-payment-intent`,
///   `POST /create-setup-intent`, `POST /confirm-and-subscribe`,
///   `POST /onboarding-complete`, `POST /check-plan-change`
///
/// ## Webhooks
/// - `POST /api/webhook/stripe` (raw body, signature-verified)
pub fn create_router(state: AppState) -> Router {
    let allowed_origins = state.config.allowed_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&allowed_origins);
    let state = Arc::new(state);

    let auth_routes = Router::new()
        .route("/check-user", post(auth::check_user))
        .route("/send-code", post(auth::send_code))
        .route("/signup", post(auth::signup))
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/logout-all", post(auth::logout_all))
        .route("/me", get(auth::me))
        .route("/context-token", post(auth::context_token));

    let shared_routes = Router::new()
        .route("/companies", post(onboarding::create_company))
        .route("/onboarding/sync-step", get(onboarding::sync_step))
        .route("/onboarding/data", get(onboarding::data))
        .route("/onboarding/next", post(onboarding::next))
        .route("/onboarding/back", post(onboarding::back))
        .route("/onboarding/update-draft", post(onboarding::update_draft))
        .route("/plans", get(onboarding::plans))
        .route("/plugins", get(onboarding::plugins))
        .route("/invitations", post(onboarding::create_invitation))
        .route("/invitations/accept", post(onboarding::accept_invitation));

    let billing_routes = Router::new()
        .route("/price-preview", post(billing::price_preview))
        .route("/create-payment-intent", post(billing::create_payment_intent))
        .route("/create-setup-intent", post(billing::create_setup_intent))
        .route("/confirm-and-subscribe", post(billing::confirm_and_subscribe))
        .route("/onboarding-complete", post(billing::onboarding_complete))
        .route("/check-plan-change", post(billing::check_plan_change));

    let api_routes = Router::new()
        .nest("/auth", auth_routes)
        .nest("/shared", shared_routes)
        .nest("/billing", billing_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS))
        // Added after the limit layer: webhook delivery pacing is
        // controlled by Stripe, not by us.
        .route("/webhook/stripe", post(webhooks::stripe_webhook));

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
///
/// Credentials are always allowed (the refresh cookie), which rules out
/// wildcard origins: unparseable entries are dropped.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}
