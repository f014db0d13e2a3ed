//! Stripe webhook ingestion.
//!
//! The webhook is the sole writer of billing status and period bounds
//! (the request path only writes placeholder rows), and every write here
//! is an upsert keyed by Stripe ids, so redelivery is safe. Signature
//! verification runs against the raw body before any parsing.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::{BillingStatus, PaymentId, PaymentRecord, PaymentStatus, PriceInterval};
use atelier_store::SubscriptionReconciliation;

use crate::error::ApiError;
use crate::state::AppState;
use crate::stripe::verify_signature;

/// Stripe webhook payload (the envelope Stripe posts).
#[derive(Debug, Deserialize)]
pub struct StripeWebhook {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event id.
    pub id: String,
    /// Event data.
    pub data: StripeEventData,
}

/// Stripe event data container.
#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    /// The event object.
    pub object: serde_json::Value,
}

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was processed.
    pub received: bool,
}

/// Handle Stripe webhooks.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    if let Some(secret) = &state.config.stripe_webhook_secret {
        let signature = headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Validation("missing Stripe signature".into()))?;

        verify_signature(&body, signature, secret).map_err(|e| {
            tracing::warn!(error = %e, "Invalid Stripe webhook signature");
            ApiError::Validation("invalid webhook signature".into())
        })?;
    } else {
        // Development mode only; production config always carries a secret.
        tracing::warn!("Stripe webhook secret not configured - skipping signature verification");
    }

    let webhook: StripeWebhook =
        serde_json::from_str(&body).map_err(|e| ApiError::Validation(e.to_string()))?;

    tracing::info!(
        event_type = %webhook.event_type,
        event_id = %webhook.id,
        "Received Stripe webhook"
    );

    match webhook.event_type.as_str() {
        "invoice.paid" => handle_invoice_paid(&state, &webhook.data.object).await?,
        "invoice.payment_failed" => {
            handle_invoice_payment_failed(&state, &webhook.data.object).await?;
        }
        "customer.subscription.updated" => {
            handle_subscription_updated(&state, &webhook.data.object).await?;
        }
        "customer.subscription.deleted" => {
            handle_subscription_deleted(&state, &webhook.data.object).await?;
        }
        "price.created" | "price.updated" => {
            handle_price_event(&state, &webhook.data.object).await?;
        }
        _ => {
            tracing::debug!(event_type = %webhook.event_type, "Unhandled Stripe event");
        }
    }

    Ok(Json(WebhookResponse { received: true }))
}

fn str_field<'a>(data: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(|v| v.as_str())
}

fn i64_field(data: &serde_json::Value, key: &str) -> Option<i64> {
    data.get(key).and_then(serde_json::Value::as_i64)
}

fn timestamp_field(data: &serde_json::Value, key: &str) -> Option<DateTime<Utc>> {
    i64_field(data, key).and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

/// `invoice.paid`: upsert the ledger row, reconcile the subscription to
/// active with the invoice's period bounds, and send the welcome email
/// exactly once per subscription creation.
async fn handle_invoice_paid(state: &AppState, data: &serde_json::Value) -> Result<(), ApiError> {
    let invoice_id = str_field(data, "id")
        .ok_or_else(|| ApiError::Validation("invoice without id".into()))?;
    let subscription_id = str_field(data, "subscription");
    let billing_reason = str_field(data, "billing_reason");

    let Some(subscription_id) = subscription_id else {
        tracing::debug!(invoice_id, "Invoice without subscription - ignoring");
        return Ok(());
    };

    let Some(subscription) = state
        .store
        .get_subscription_by_stripe_id(subscription_id)
        .await?
    else {
        tracing::warn!(
            invoice_id,
            subscription_id,
            "Invoice for unknown subscription - nothing to reconcile"
        );
        return Ok(());
    };

    let payment = PaymentRecord {
        id: PaymentId::generate(),
        company_id: subscription.company_id,
        stripe_invoice_id: invoice_id.to_string(),
        amount_cents: i64_field(data, "amount_paid").unwrap_or(0),
        currency: str_field(data, "currency").unwrap_or("eur").to_string(),
        status: PaymentStatus::Paid,
        billing_reason: billing_reason.map(ToString::to_string),
        created_at: Utc::now(),
    };

    // The insert outcome is the idempotency marker for the emails below:
    // redelivered events update the row and send nothing.
    let newly_recorded = state.store.upsert_payment(&payment).await?;

    state
        .store
        .reconcile_subscription(
            subscription_id,
            SubscriptionReconciliation {
                status: BillingStatus::Active,
                current_period_start: timestamp_field(data, "period_start"),
                current_period_end: timestamp_field(data, "period_end"),
                cancel_at_period_end: None,
            },
        )
        .await?;

    tracing::info!(
        invoice_id,
        subscription_id,
        company_id = %subscription.company_id,
        amount_cents = payment.amount_cents,
        newly_recorded,
        "Invoice paid"
    );

    if newly_recorded {
        let is_welcome = billing_reason == Some("subscription_create");
        send_billing_email(state, subscription.company_id, is_welcome, &payment);
    }

    Ok(())
}

/// `invoice.payment_failed`: record the failure, mark the subscription
/// past due. Stripe drives retries; nothing to do locally beyond state.
async fn handle_invoice_payment_failed(
    state: &AppState,
    data: &serde_json::Value,
) -> Result<(), ApiError> {
    let invoice_id = str_field(data, "id")
        .ok_or_else(|| ApiError::Validation("invoice without id".into()))?;
    let Some(subscription_id) = str_field(data, "subscription") else {
        tracing::debug!(invoice_id, "Failed invoice without subscription - ignoring");
        return Ok(());
    };

    let Some(subscription) = state
        .store
        .get_subscription_by_stripe_id(subscription_id)
        .await?
    else {
        tracing::warn!(invoice_id, subscription_id, "Failed invoice for unknown subscription");
        return Ok(());
    };

    let payment = PaymentRecord {
        id: PaymentId::generate(),
        company_id: subscription.company_id,
        stripe_invoice_id: invoice_id.to_string(),
        amount_cents: i64_field(data, "amount_due").unwrap_or(0),
        currency: str_field(data, "currency").unwrap_or("eur").to_string(),
        status: PaymentStatus::Failed,
        billing_reason: str_field(data, "billing_reason").map(ToString::to_string),
        created_at: Utc::now(),
    };
    state.store.upsert_payment(&payment).await?;

    state
        .store
        .reconcile_subscription(
            subscription_id,
            SubscriptionReconciliation {
                status: BillingStatus::PastDue,
                current_period_start: None,
                current_period_end: None,
                cancel_at_period_end: None,
            },
        )
        .await?;

    tracing::warn!(
        invoice_id,
        subscription_id,
        company_id = %subscription.company_id,
        "Invoice payment failed"
    );
    Ok(())
}

/// `customer.subscription.updated`: reconcile status, period bounds and
/// the cancellation flag.
async fn handle_subscription_updated(
    state: &AppState,
    data: &serde_json::Value,
) -> Result<(), ApiError> {
    let subscription_id = str_field(data, "id")
        .ok_or_else(|| ApiError::Validation("subscription without id".into()))?;
    let status = str_field(data, "status").unwrap_or("unknown");

    let matched = state
        .store
        .reconcile_subscription(
            subscription_id,
            SubscriptionReconciliation {
                status: BillingStatus::from_stripe(status),
                current_period_start: timestamp_field(data, "current_period_start"),
                current_period_end: timestamp_field(data, "current_period_end"),
                cancel_at_period_end: data
                    .get("cancel_at_period_end")
                    .and_then(serde_json::Value::as_bool),
            },
        )
        .await?;

    tracing::info!(subscription_id, status, matched, "Subscription updated");
    Ok(())
}

/// `customer.subscription.deleted`: terminal cancellation.
async fn handle_subscription_deleted(
    state: &AppState,
    data: &serde_json::Value,
) -> Result<(), ApiError> {
    let subscription_id = str_field(data, "id")
        .ok_or_else(|| ApiError::Validation("subscription without id".into()))?;

    let matched = state
        .store
        .reconcile_subscription(
            subscription_id,
            SubscriptionReconciliation {
                status: BillingStatus::Canceled,
                current_period_start: None,
                current_period_end: None,
                cancel_at_period_end: None,
            },
        )
        .await?;

    tracing::info!(subscription_id, matched, "Subscription deleted");
    Ok(())
}

/// `price.created` / `price.updated`: refresh the cached catalog amounts.
/// This cache is what price previews are computed from, so it must track
/// Stripe exactly.
async fn handle_price_event(state: &AppState, data: &serde_json::Value) -> Result<(), ApiError> {
    let price_id = str_field(data, "id")
        .ok_or_else(|| ApiError::Validation("price without id".into()))?;

    let Some(amount) = i64_field(data, "unit_amount") else {
        tracing::debug!(price_id, "Price without unit_amount - ignoring");
        return Ok(());
    };

    let interval = data
        .get("recurring")
        .and_then(|r| r.get("interval"))
        .and_then(|v| v.as_str());
    let interval = match interval {
        Some("month") => PriceInterval::Month,
        Some("year") => PriceInterval::Year,
        other => {
            tracing::debug!(price_id, interval = ?other, "Non-recurring price - ignoring");
            return Ok(());
        }
    };

    let changed = state
        .store
        .update_cached_price(price_id, interval, amount)
        .await?;

    if changed {
        tracing::info!(price_id, amount, "Cached catalog price updated");
    } else {
        tracing::debug!(price_id, "Price does not match any catalog row");
    }
    Ok(())
}

/// Fire-and-forget billing email to the company owner. Failures are
/// logged, never retried, never surfaced to Stripe.
fn send_billing_email(
    state: &AppState,
    company_id: atelier_core::CompanyId,
    is_welcome: bool,
    payment: &PaymentRecord,
) {
    let Some(mailer) = state.mailer.clone() else {
        return;
    };
    let store = Arc::clone(&state.store);
    let amount_cents = payment.amount_cents;
    let currency = payment.currency.clone();

    tokio::spawn(async move {
        let owner = match store.get_company_owner(company_id).await {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                tracing::warn!(company_id = %company_id, "No owner to email");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Owner lookup failed for billing email");
                return;
            }
        };

        let company_name = match store.get_company(company_id).await {
            Ok(Some(company)) => company.name,
            _ => "your company".to_string(),
        };

        let result = if is_welcome {
            mailer.send_welcome(&owner.email, &company_name).await
        } else {
            mailer.send_receipt(&owner.email, amount_cents, &currency).await
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, company_id = %company_id, "Billing email failed");
        }
    });
}
