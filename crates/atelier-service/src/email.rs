//! Resend email client.
//!
//! Request-path sends (the OTP email) are awaited and surfaced on failure.
//! Webhook-path sends (welcome, receipt) are fire-and-forget: logged, never
//! retried, never failing the webhook.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;

/// Error type for email operations.
#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Resend returned a non-success status.
    #[error("Resend API error: HTTP {status}: {body}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },
}

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// Resend API client.
#[derive(Debug, Clone)]
pub struct ResendClient {
    client: Client,
    base_url: String,
    api_key: String,
    from: String,
}

impl ResendClient {
    /// Resend API base URL.
    const BASE_URL: &'static str = "https://api.resend.com";

    /// Create a new client.
    #[must_use]
    pub fn new(api_key: impl Into<String>, from: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: Self::BASE_URL.to_string(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }

    /// Point the client at a different base URL (mock servers in tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Send one email.
    pub async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), EmailError> {
        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&SendRequest {
                from: &self.from,
                to: [to],
                subject,
                html,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(EmailError::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// Send the signup verification code.
    pub async fn send_verification_code(&self, to: &str, code: &str) -> Result<(), EmailError> {
        let html = format!(
            "<p>Your verification code is: <strong>{code}</strong></p>\
             <p>The code expires in 10 minutes.</p>"
        );
        self.send(to, "Your verification code", &html).await
    }

    /// Send the welcome email after the first successful invoice.
    pub async fn send_welcome(&self, to: &str, company_name: &str) -> Result<(), EmailError> {
        let html = format!(
            "<p>Welcome aboard!</p>\
             <p>Your subscription for <strong>{company_name}</strong> is active.</p>"
        );
        self.send(to, "Welcome to Atelier", &html).await
    }

    /// Send a payment receipt.
    pub async fn send_receipt(
        &self,
        to: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<(), EmailError> {
        #[allow(clippy::cast_precision_loss)]
        let amount = amount_cents as f64 / 100.0;
        let html = format!(
            "<p>We received your payment of <strong>{amount:.2} {currency}</strong>.</p>"
        );
        self.send(to, "Payment received", &html).await
    }
}
