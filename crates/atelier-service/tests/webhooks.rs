//! Stripe webhook integration tests: signature verification, idempotent
//! reconciliation and price-cache sync.

mod common;

use std::time::Duration;

use common::{TestHarness, WEBHOOK_SECRET};
use serde_json::{json, Value};

use atelier_core::{BillingStatus, CompanyId, PaymentStatus};
use atelier_service::stripe::sign_payload;
use atelier_store::Store as _;

async fn post_event(harness: &TestHarness, payload: &Value) -> axum_test::TestResponse {
    let body = payload.to_string();
    let signature = sign_payload(&body, WEBHOOK_SECRET, 1_700_000_000);
    harness
        .server
        .post("/api/webhook/stripe")
        .add_header("stripe-signature", signature)
        .add_header("content-type", "application/json")
        .text(body)
        .await
}

fn invoice_paid_event(invoice_id: &str, subscription_id: &str, reason: &str) -> Value {
    json!({
        "id": "evt_1",
        "type": "invoice.paid",
        "data": {"object": {
            "id": invoice_id,
            "subscription": subscription_id,
            "amount_paid": 3708,
            "currency": "eur",
            "billing_reason": reason,
            "period_start": 1_700_000_000,
            "period_end": 1_702_592_000,
        }},
    })
}

/// Register, create a company and seed its paid-subscription placeholder.
async fn company_with_placeholder(harness: &TestHarness, stripe_sub: &str) -> CompanyId {
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (company_id, _context) = harness.create_company(&token, "Acme").await;
    harness
        .insert_placeholder_subscription(company_id, stripe_sub)
        .await;
    company_id
}

// ============================================================================
// Signature verification
// ============================================================================

#[tokio::test]
async fn webhook_requires_valid_signature() {
    let harness = TestHarness::new().await;
    let payload = invoice_paid_event("in_1", "sub_x", "subscription_create").to_string();

    // Missing header.
    let response = harness
        .server
        .post("/api/webhook/stripe")
        .add_header("content-type", "application/json")
        .text(payload.clone())
        .await;
    assert_eq!(response.status_code(), 400);

    // Signed with the wrong secret.
    let bad = sign_payload(&payload, "whsec_wrong", 1_700_000_000);
    let response = harness
        .server
        .post("/api/webhook/stripe")
        .add_header("stripe-signature", bad)
        .add_header("content-type", "application/json")
        .text(payload)
        .await;
    assert_eq!(response.status_code(), 400);
}

// ============================================================================
// invoice.paid reconciliation + replay idempotency
// ============================================================================

#[tokio::test]
async fn invoice_paid_reconciles_and_replay_is_idempotent() {
    let harness = TestHarness::new().await;
    let company_id = company_with_placeholder(&harness, "sub_1").await;

    let event = invoice_paid_event("in_100", "sub_1", "subscription_create");
    post_event(&harness, &event).await.assert_status_ok();

    // Ledger row recorded once, subscription reconciled to active with
    // period bounds.
    let payments = harness
        .store
        .list_payments_for_company(company_id)
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Paid);
    assert_eq!(payments[0].amount_cents, 3708);

    let subscription = harness
        .store
        .get_subscription_by_stripe_id("sub_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.billing_status, BillingStatus::Active);
    assert!(subscription.current_period_start.is_some());
    assert!(subscription.current_period_end.is_some());

    // Give the fire-and-forget welcome email time to land.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.emails_with_subject("Welcome to Atelier").await, 1);

    // Stripe redelivers the same event: no duplicate ledger row, no
    // second welcome email.
    post_event(&harness, &event).await.assert_status_ok();
    post_event(&harness, &event).await.assert_status_ok();

    let payments = harness
        .store
        .list_payments_for_company(company_id)
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.emails_with_subject("Welcome to Atelier").await, 1);
}

#[tokio::test]
async fn renewal_invoice_sends_receipt_not_welcome() {
    let harness = TestHarness::new().await;
    let _company = company_with_placeholder(&harness, "sub_2").await;

    let event = invoice_paid_event("in_200", "sub_2", "subscription_cycle");
    post_event(&harness, &event).await.assert_status_ok();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.emails_with_subject("Welcome to Atelier").await, 0);
    assert_eq!(harness.emails_with_subject("Payment received").await, 1);
}

#[tokio::test]
async fn unknown_subscription_invoice_is_acknowledged() {
    let harness = TestHarness::new().await;
    // Stripe expects a 2xx even when there is nothing to reconcile;
    // otherwise it retries forever.
    let event = invoice_paid_event("in_300", "sub_unknown", "subscription_create");
    post_event(&harness, &event).await.assert_status_ok();
}

// ============================================================================
// invoice.payment_failed
// ============================================================================

#[tokio::test]
async fn payment_failure_marks_past_due() {
    let harness = TestHarness::new().await;
    let company_id = company_with_placeholder(&harness, "sub_3").await;

    // First invoice settles.
    post_event(
        &harness,
        &invoice_paid_event("in_400", "sub_3", "subscription_create"),
    )
    .await
    .assert_status_ok();

    // Renewal fails.
    let event = json!({
        "id": "evt_2",
        "type": "invoice.payment_failed",
        "data": {"object": {
            "id": "in_401",
            "subscription": "sub_3",
            "amount_due": 3708,
            "currency": "eur",
            "billing_reason": "subscription_cycle",
        }},
    });
    post_event(&harness, &event).await.assert_status_ok();

    let subscription = harness
        .store
        .get_subscription_by_stripe_id("sub_3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.billing_status, BillingStatus::PastDue);

    let payments = harness
        .store
        .list_payments_for_company(company_id)
        .await
        .unwrap();
    assert_eq!(payments.len(), 2);
    assert!(payments.iter().any(|p| p.status == PaymentStatus::Failed));
}

// ============================================================================
// Status ownership guard
// ============================================================================

#[tokio::test]
async fn settled_status_never_regresses() {
    let harness = TestHarness::new().await;
    let _company = company_with_placeholder(&harness, "sub_4").await;

    post_event(
        &harness,
        &invoice_paid_event("in_500", "sub_4", "subscription_create"),
    )
    .await
    .assert_status_ok();

    // An update with a status Stripe never settled (maps to pending) must
    // not regress the active subscription.
    let event = json!({
        "id": "evt_3",
        "type": "customer.subscription.updated",
        "data": {"object": {
            "id": "sub_4",
            "status": "some-unknown-status",
            "cancel_at_period_end": true,
        }},
    });
    post_event(&harness, &event).await.assert_status_ok();

    let subscription = harness
        .store
        .get_subscription_by_stripe_id("sub_4")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.billing_status, BillingStatus::Active);
    // Non-status fields still reconcile.
    assert!(subscription.cancel_at_period_end);
}

#[tokio::test]
async fn subscription_deleted_is_terminal() {
    let harness = TestHarness::new().await;
    let _company = company_with_placeholder(&harness, "sub_5").await;

    let event = json!({
        "id": "evt_4",
        "type": "customer.subscription.deleted",
        "data": {"object": {"id": "sub_5"}},
    });
    post_event(&harness, &event).await.assert_status_ok();

    // A late "active" update cannot resurrect it.
    let event = json!({
        "id": "evt_5",
        "type": "customer.subscription.updated",
        "data": {"object": {"id": "sub_5", "status": "active"}},
    });
    post_event(&harness, &event).await.assert_status_ok();

    let subscription = harness
        .store
        .get_subscription_by_stripe_id("sub_5")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.billing_status, BillingStatus::Canceled);
}

// ============================================================================
// Price cache sync
// ============================================================================

#[tokio::test]
async fn price_updated_refreshes_the_cached_catalog() {
    let harness = TestHarness::new().await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (_company, context) = harness.create_company(&token, "Acme").await;

    let event = json!({
        "id": "evt_6",
        "type": "price.updated",
        "data": {"object": {
            "id": "price_studio_base_m",
            "unit_amount": 3490,
            "recurring": {"interval": "month"},
        }},
    });
    post_event(&harness, &event).await.assert_status_ok();

    // The preview path reads the refreshed cache: 34.90 * 1.24 = 43.28.
    let response = harness
        .server
        .post("/api/billing/price-preview")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({
            "plan_id": harness.catalog.paid_plan,
            "billing": "monthly",
            "branches": 0,
            "plugins": [],
        }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["subtotal_cents"], 3490);
    assert_eq!(body["data"]["total_cents"], 4328);

    // The yearly snapshot is untouched.
    let response = harness
        .server
        .post("/api/billing/price-preview")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({
            "plan_id": harness.catalog.paid_plan,
            "billing": "yearly",
            "branches": 0,
            "plugins": [],
        }))
        .await;
    let body: Value = response.json();
    assert_eq!(body["data"]["subtotal_cents"], 29_900);
}

#[tokio::test]
async fn unmatched_price_event_is_ignored() {
    let harness = TestHarness::new().await;

    let event = json!({
        "id": "evt_7",
        "type": "price.updated",
        "data": {"object": {
            "id": "price_not_ours",
            "unit_amount": 100,
            "recurring": {"interval": "month"},
        }},
    });
    post_event(&harness, &event).await.assert_status_ok();

    let plans = harness.store.list_plans().await.unwrap();
    let studio = plans.iter().find(|p| p.key == "studio").unwrap();
    assert_eq!(studio.base_price.monthly_cents, 2990);
}
