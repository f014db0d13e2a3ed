//! Atelier HTTP API service.
//!
//! This crate provides the backend for the atelier platform:
//!
//! - Authentication: signup with email OTP, login, refresh-token rotation
//!   with theft detection, per-device sessions
//! - Company onboarding: the server-authoritative step machine
//! - Billing: price previews from the cached catalog, Stripe subscription
//!   provisioning, webhook reconciliation
//!
//! # Authentication
//!
//! Access tokens are short-lived HS256 JWTs. A naked token carries only the
//! user id; a contextual token additionally carries the active company and
//! branch scope with a permission snapshot. Refresh tokens are opaque,
//! single-use and stored hashed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers need async for consistency

pub mod config;
pub mod cookies;
pub mod crypto;
pub mod email;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod stripe;
pub mod tokens;

pub use config::ServiceConfig;
pub use error::{ApiError, ApiResponse};
pub use routes::create_router;
pub use state::AppState;
pub use stripe::{StripeClient, StripeError};
