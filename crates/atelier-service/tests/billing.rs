//! Billing integration tests: price previews, Stripe-backed checkout and
//! plan-change checks. Stripe is a wiremock server.

mod common;

use common::TestHarness;
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup_paid_draft(harness: &TestHarness, context: &str, plugins: Value, branches: i64) {
    harness
        .server
        .post("/api/shared/onboarding/update-draft")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({
            "company": {"name": "Acme"},
            "industries": ["clothing"],
            "plan": {"id": harness.catalog.paid_plan, "billing": "monthly"},
        }))
        .await
        .assert_status_ok();
    // Plugins go in after the plan so the reset rules do not clear them.
    harness
        .server
        .post("/api/shared/onboarding/update-draft")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({"plugins": plugins, "branches": branches}))
        .await
        .assert_status_ok();
}

fn mock_stripe_customer() -> Mock {
    Mock::given(method("POST"))
        .and(path("/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cus_test",
            "email": "owner@example.com",
            "name": "Acme",
        })))
}

// ============================================================================
// price-preview
// ============================================================================

#[tokio::test]
async fn price_preview_free_plan_is_all_zero() {
    let harness = TestHarness::new().await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (_company, context) = harness.create_company(&token, "Acme").await;

    let response = harness
        .server
        .post("/api/billing/price-preview")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({
            "plan_id": harness.catalog.free_plan,
            "billing": "monthly",
            "branches": 0,
            "plugins": [],
        }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["subtotal_cents"], 0);
    assert_eq!(body["data"]["vat_cents"], 0);
    assert_eq!(body["data"]["total_cents"], 0);
}

#[tokio::test]
async fn price_preview_paid_plan_vat_is_exact() {
    let harness = TestHarness::new().await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (_company, context) = harness.create_company(&token, "Acme").await;

    // 29.90 + 2 * 5.00 + 9.90 = 49.80; * 1.24 = 61.75 (63 would be drift)
    let response = harness
        .server
        .post("/api/billing/price-preview")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({
            "plan_id": harness.catalog.paid_plan,
            "billing": "monthly",
            "branches": 2,
            "plugins": ["pattern-cutting"],
        }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["subtotal_cents"], 4980);
    assert_eq!(body["data"]["total_cents"], 6175);
    assert_eq!(body["data"]["vat_cents"], 1195);
    assert_eq!(body["data"]["currency"], "eur");
    assert_eq!(body["data"]["lines"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn price_preview_rejects_out_of_range_branches() {
    let harness = TestHarness::new().await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (_company, context) = harness.create_company(&token, "Acme").await;

    let response = harness
        .server
        .post("/api/billing/price-preview")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({
            "plan_id": harness.catalog.paid_plan,
            "billing": "monthly",
            "branches": 10,
            "plugins": [],
        }))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["code"], "INVALID_RANGE");
}

#[tokio::test]
async fn price_preview_rejects_unknown_plugins() {
    let harness = TestHarness::new().await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (_company, context) = harness.create_company(&token, "Acme").await;

    let response = harness
        .server
        .post("/api/billing/price-preview")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({
            "plan_id": harness.catalog.paid_plan,
            "billing": "monthly",
            "branches": 0,
            "plugins": ["no-such-plugin"],
        }))
        .await;
    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert_eq!(body["code"], "PLUGIN_NOT_FOUND");
}

// ============================================================================
// Intents
// ============================================================================

#[tokio::test]
async fn payment_intent_amount_is_server_computed() {
    let stripe_mock = MockServer::start().await;
    mock_stripe_customer().mount(&stripe_mock).await;

    // The matcher pins the server-computed gross amount: 29.90 * 1.24.
    Mock::given(method("POST"))
        .and(path("/payment_intents"))
        .and(body_string_contains("amount=3708"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pi_test",
            "client_secret": "pi_test_secret",
            "status": "requires_confirmation",
            "amount": 3708,
            "currency": "eur",
        })))
        .expect(1)
        .mount(&stripe_mock)
        .await;

    let harness = TestHarness::with_stripe(&stripe_mock).await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (_company, context) = harness.create_company(&token, "Acme").await;
    setup_paid_draft(&harness, &context, json!([]), 0).await;

    let response = harness
        .server
        .post("/api/billing/create-payment-intent")
        .add_header("authorization", format!("Bearer {context}"))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["client_secret"], "pi_test_secret");
}

#[tokio::test]
async fn setup_intent_returns_client_secret() {
    let stripe_mock = MockServer::start().await;
    mock_stripe_customer().mount(&stripe_mock).await;
    Mock::given(method("POST"))
        .and(path("/setup_intents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "seti_test",
            "client_secret": "seti_test_secret",
            "status": "requires_confirmation",
        })))
        .mount(&stripe_mock)
        .await;

    let harness = TestHarness::with_stripe(&stripe_mock).await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (_company, context) = harness.create_company(&token, "Acme").await;

    let response = harness
        .server
        .post("/api/billing/create-setup-intent")
        .add_header("authorization", format!("Bearer {context}"))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["client_secret"], "seti_test_secret");
}

// ============================================================================
// confirm-and-subscribe
// ============================================================================

#[tokio::test]
async fn confirm_and_subscribe_records_pending_placeholder() {
    let stripe_mock = MockServer::start().await;
    mock_stripe_customer().mount(&stripe_mock).await;
    Mock::given(method("POST"))
        .and(path("/subscriptions"))
        .and(body_string_contains("price_studio_base_m"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sub_test_1",
            "status": "active",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "items": {"data": [
                {"id": "si_base", "price": {"id": "price_studio_base_m"}, "quantity": 1}
            ]},
        })))
        .expect(1)
        .mount(&stripe_mock)
        .await;

    let harness = TestHarness::with_stripe(&stripe_mock).await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (company_id, context) = harness.create_company(&token, "Acme").await;
    setup_paid_draft(&harness, &context, json!([]), 0).await;

    let response = harness
        .server
        .post("/api/billing/confirm-and-subscribe")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({"payment_method_id": "pm_card_visa"}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["stripe_subscription_id"], "sub_test_1");
    // The request path never settles billing status; the webhook does.
    assert_eq!(body["data"]["billing_status"], "pending");

    use atelier_store::Store as _;
    let subscription = harness
        .store
        .get_subscription_for_company(company_id)
        .await
        .unwrap()
        .expect("placeholder not recorded");
    assert_eq!(
        subscription.billing_status,
        atelier_core::BillingStatus::Pending
    );
    assert!(subscription.current_period_start.is_none());

    let items = harness
        .store
        .list_subscription_items(subscription.id)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].stripe_item_id.as_deref(), Some("si_base"));
    assert_eq!(items[0].unit_amount_cents, 2990);
}

#[tokio::test]
async fn paid_completion_requires_confirmed_subscription() {
    let harness = TestHarness::new().await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (company_id, context) = harness.create_company(&token, "Acme").await;
    setup_paid_draft(&harness, &context, json!([]), 0).await;

    let response = harness
        .server
        .post("/api/billing/onboarding-complete")
        .add_header("authorization", format!("Bearer {context}"))
        .await;
    assert_eq!(response.status_code(), 402);
    let body: Value = response.json();
    assert_eq!(body["code"], "ONBOARDING_PAYMENT_REQUIRED");

    // Once the subscription row exists, completion proceeds.
    harness
        .insert_placeholder_subscription(company_id, "sub_manual_1")
        .await;
    let response = harness
        .server
        .post("/api/billing/onboarding-complete")
        .add_header("authorization", format!("Bearer {context}"))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["onboarding"]["is_completed"], true);
}

// ============================================================================
// check-plan-change
// ============================================================================

#[tokio::test]
async fn plan_change_blocked_while_pending_and_reports_preview() {
    let harness = TestHarness::new().await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (company_id, context) = harness.create_company(&token, "Acme").await;
    harness
        .insert_placeholder_subscription(company_id, "sub_pending")
        .await;

    let response = harness
        .server
        .post("/api/billing/check-plan-change")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({"plan_id": harness.catalog.free_plan, "billing": "monthly"}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["allowed"], false);
    assert!(body["data"]["reason"]
        .as_str()
        .unwrap()
        .contains("awaiting payment"));
    // The preview is still computed for the target plan.
    assert_eq!(body["data"]["preview"]["total_cents"], 0);
}

#[tokio::test]
async fn plan_change_from_active_free_subscription_is_allowed() {
    let harness = TestHarness::new().await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (company_id, context) = harness.create_company(&token, "Acme").await;

    use atelier_store::Store as _;
    let free = atelier_core::Subscription::free(
        company_id,
        harness.catalog.free_plan,
        atelier_core::BillingPeriod::Monthly,
    );
    harness.store.create_subscription(&free, &[]).await.unwrap();

    let response = harness
        .server
        .post("/api/billing/check-plan-change")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({"plan_id": harness.catalog.paid_plan, "billing": "monthly"}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["allowed"], true);
    // 29.90 * 1.24 = 37.08, no branches or plugins yet.
    assert_eq!(body["data"]["preview"]["total_cents"], 3708);

    // Same plan, same cadence: nothing to change.
    let response = harness
        .server
        .post("/api/billing/check-plan-change")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({"plan_id": harness.catalog.free_plan, "billing": "monthly"}))
        .await;
    let body: Value = response.json();
    assert_eq!(body["data"]["allowed"], false);
}

#[tokio::test]
async fn plan_change_without_subscription_is_not_found() {
    let harness = TestHarness::new().await;
    let (token, _) = harness.register_and_login("owner@example.com", "fp-1").await;
    let (_company, context) = harness.create_company(&token, "Acme").await;

    let response = harness
        .server
        .post("/api/billing/check-plan-change")
        .add_header("authorization", format!("Bearer {context}"))
        .json(&json!({"plan_id": harness.catalog.paid_plan, "billing": "monthly"}))
        .await;
    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert_eq!(body["code"], "SUBSCRIPTION_NOT_FOUND");
}
