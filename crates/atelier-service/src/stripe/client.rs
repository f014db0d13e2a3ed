//! Stripe API client implementation.

use std::time::Duration;

use reqwest::Client;

use crate::crypto::{constant_time_eq, hmac_sha256_hex};

use super::types::{
    Customer, PaymentIntent, SetupIntent, StripeErrorResponse, StripeSubscription,
};

/// Error type for Stripe operations.
#[derive(Debug, thiserror::Error)]
pub enum StripeError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Stripe API returned an error.
    #[error("Stripe API error: {error_type} - {message}")]
    Api {
        /// Error type.
        error_type: String,
        /// Error message.
        message: String,
        /// Error code.
        code: Option<String>,
    },

    /// Invalid webhook signature.
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Stripe API client.
#[derive(Debug, Clone)]
pub struct StripeClient {
    client: Client,
    base_url: String,
    api_key: String,
    webhook_secret: Option<String>,
}

impl StripeClient {
    /// Stripe API base URL.
    const BASE_URL: &'static str = "https://api.stripe.com/v1";

    /// Create a new Stripe client.
    ///
    /// # Arguments
    ///
    /// * `api_key` - Stripe secret API key (`sk_test_...` or `sk_live_...`)
    /// * `webhook_secret` - Optional webhook signing secret (`whsec_...`)
    #[must_use]
    pub fn new(api_key: impl Into<String>, webhook_secret: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: Self::BASE_URL.to_string(),
            api_key: api_key.into(),
            webhook_secret,
        }
    }

    /// Point the client at a different base URL (mock servers in tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create a Stripe customer for a company.
    pub async fn create_customer(
        &self,
        company_id: &str,
        name: &str,
        email: Option<&str>,
    ) -> Result<Customer, StripeError> {
        let mut params = vec![
            ("name", name.to_string()),
            ("metadata[company_id]", company_id.to_string()),
        ];
        if let Some(email) = email {
            params.push(("email", email.to_string()));
        }

        let response = self
            .client
            .post(format!("{}/customers", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Create a payment intent for the first charge of a paid plan.
    pub async fn create_payment_intent(
        &self,
        customer_id: &str,
        amount_cents: i64,
        currency: &str,
        company_id: &str,
    ) -> Result<PaymentIntent, StripeError> {
        let params = vec![
            ("customer", customer_id.to_string()),
            ("amount", amount_cents.to_string()),
            ("currency", currency.to_string()),
            ("metadata[company_id]", company_id.to_string()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];

        let response = self
            .client
            .post(format!("{}/payment_intents", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Create a setup intent to save a payment method without charging.
    pub async fn create_setup_intent(
        &self,
        customer_id: &str,
        company_id: &str,
    ) -> Result<SetupIntent, StripeError> {
        let params = vec![
            ("customer", customer_id.to_string()),
            ("metadata[company_id]", company_id.to_string()),
        ];

        let response = self
            .client
            .post(format!("{}/setup_intents", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Create a subscription from confirmed payment details.
    ///
    /// `items` are (price id, quantity) pairs; the default payment method
    /// must already be confirmed client-side.
    pub async fn create_subscription(
        &self,
        customer_id: &str,
        items: &[(String, i64)],
        default_payment_method: &str,
        company_id: &str,
    ) -> Result<StripeSubscription, StripeError> {
        let mut params: Vec<(String, String)> = vec![
            ("customer".into(), customer_id.to_string()),
            (
                "default_payment_method".into(),
                default_payment_method.to_string(),
            ),
            ("metadata[company_id]".into(), company_id.to_string()),
        ];
        for (i, (price_id, quantity)) in items.iter().enumerate() {
            params.push((format!("items[{i}][price]"), price_id.clone()));
            params.push((format!("items[{i}][quantity]"), quantity.to_string()));
        }

        let response = self
            .client
            .post(format!("{}/subscriptions", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Verify a webhook signature header against the raw payload.
    ///
    /// The header format is `t=timestamp,v1=signature[,v1=...]`; the signed
    /// payload is `{timestamp}.{body}` with HMAC-SHA256 under the webhook
    /// secret. Comparison is constant-time.
    pub fn verify_webhook_signature(
        &self,
        payload: &str,
        signature: &str,
    ) -> Result<(), StripeError> {
        let secret = self
            .webhook_secret
            .as_deref()
            .ok_or_else(|| StripeError::Configuration("webhook secret not configured".into()))?;
        verify_signature(payload, signature, secret)
    }

    /// Handle an API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StripeError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let error_body: Result<StripeErrorResponse, _> = response.json().await;
        match error_body {
            Ok(stripe_error) => Err(StripeError::Api {
                error_type: stripe_error.error.error_type,
                message: stripe_error.error.message,
                code: stripe_error.error.code,
            }),
            Err(_) => Err(StripeError::Api {
                error_type: "unknown".to_string(),
                message: format!("HTTP {status}"),
                code: None,
            }),
        }
    }
}

/// Verify a Stripe webhook signature with an explicit secret.
///
/// # Errors
///
/// Returns [`StripeError::InvalidSignature`] when no `v1` signature
/// matches, [`StripeError::Configuration`] on a malformed header.
pub fn verify_signature(payload: &str, signature: &str, secret: &str) -> Result<(), StripeError> {
    // Header format: t=timestamp,v1=signature,v1=signature2,...
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature.split(',') {
        let mut kv = part.splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(ts)) => timestamp = Some(ts),
            (Some("v1"), Some(sig)) => signatures.push(sig),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| StripeError::Configuration("missing timestamp".into()))?;

    if signatures.is_empty() {
        return Err(StripeError::InvalidSignature);
    }

    let signed_payload = format!("{timestamp}.{payload}");
    let expected = hmac_sha256_hex(secret, &signed_payload);

    if signatures.iter().any(|sig| constant_time_eq(&expected, sig)) {
        Ok(())
    } else {
        Err(StripeError::InvalidSignature)
    }
}

/// Build a signature header for a payload. Test helper; mirrors what
/// Stripe's CLI does for fixture events.
#[must_use]
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> String {
    let signed_payload = format!("{timestamp}.{payload}");
    let signature = hmac_sha256_hex(secret, &signed_payload);
    format!("t={timestamp},v1={signature}")
}
