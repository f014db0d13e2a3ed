//! Shared test harness.
//!
//! Spins the full router up against the in-memory store, with Resend (and
//! optionally Stripe) pointed at wiremock servers.

#![allow(dead_code)] // each integration test binary uses a subset

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use atelier_core::{
    BillingPeriod, CompanyId, Plan, PlanId, PlanTier, Plugin, PluginId, PriceSnapshot,
    Subscription, SubscriptionItem,
};
use atelier_core::catalog::StripePriceIds;
use atelier_service::email::ResendClient;
use atelier_service::{create_router, AppState, ServiceConfig, StripeClient};
use atelier_store::{MemStore, Store};

/// Allow-listed origin used by every test request that needs one.
pub const ORIGIN: &str = "http://app.test";

/// Webhook signing secret wired into the test config.
pub const WEBHOOK_SECRET: &str = "whsec_test";

/// Password used by the auth helpers.
pub const PASSWORD: &str = "correct-horse-battery";

/// Ids of the seeded catalog rows.
pub struct SeededCatalog {
    /// Free plan (tier free, both base prices zero).
    pub free_plan: PlanId,
    /// Paid plan: 29.90/mo base, 5.00/mo per extra branch.
    pub paid_plan: PlanId,
    /// Paid clothing-only plugin, standard tier: 9.90/mo.
    pub plugin_pattern: PluginId,
    /// Free any-industry plugin.
    pub plugin_reports: PluginId,
}

/// Full-service test harness.
pub struct TestHarness {
    pub server: TestServer,
    pub store: Arc<MemStore>,
    pub catalog: SeededCatalog,
    pub mailer_mock: MockServer,
}

impl TestHarness {
    /// Harness without Stripe (auth/onboarding/webhook tests).
    pub async fn new() -> Self {
        Self::build(None).await
    }

    /// Harness with the Stripe client pointed at a wiremock server.
    pub async fn with_stripe(stripe_mock: &MockServer) -> Self {
        Self::build(Some(stripe_mock.uri())).await
    }

    async fn build(stripe_base_url: Option<String>) -> Self {
        let store = Arc::new(MemStore::new());
        let catalog = seed_catalog(store.as_ref()).await;

        let mailer_mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "email_1"})))
            .mount(&mailer_mock)
            .await;

        let config = ServiceConfig {
            allowed_origins: vec![ORIGIN.into()],
            production: false,
            stripe_webhook_secret: Some(WEBHOOK_SECRET.into()),
            ..ServiceConfig::default()
        };

        let mailer =
            Arc::new(ResendClient::new("re_test", "test@atelier.dev").with_base_url(mailer_mock.uri()));
        let stripe = stripe_base_url.map(|base| {
            Arc::new(
                StripeClient::new("sk_test_xxx", Some(WEBHOOK_SECRET.into()))
                    .with_base_url(base),
            )
        });

        let state = AppState::with_clients(
            Arc::clone(&store) as Arc<dyn Store>,
            config,
            stripe,
            Some(mailer),
        );
        let server = TestServer::new(create_router(state)).expect("Failed to create test server");

        Self {
            server,
            store,
            catalog,
            mailer_mock,
        }
    }

    /// The last 6-digit code the mailer mock saw.
    pub async fn last_emailed_code(&self) -> String {
        let requests = self
            .mailer_mock
            .received_requests()
            .await
            .expect("mailer mock recording disabled");
        let body: Value = requests
            .last()
            .map(|r| serde_json::from_slice(&r.body).expect("mailer body not json"))
            .expect("no email sent");
        let html = body["html"].as_str().expect("email without html");
        extract_digits(html, 6).expect("no code in email body")
    }

    /// How many emails with this subject the mailer mock saw.
    pub async fn emails_with_subject(&self, subject: &str) -> usize {
        let requests = self
            .mailer_mock
            .received_requests()
            .await
            .unwrap_or_default();
        requests
            .iter()
            .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
            .filter(|b| b["subject"].as_str() == Some(subject))
            .count()
    }

    /// Register a user through the OTP flow. Returns the user id.
    pub async fn register_user(&self, email: &str) -> String {
        self.server
            .post("/api/auth/send-code")
            .json(&json!({"email": email}))
            .await
            .assert_status_ok();

        let code = self.last_emailed_code().await;

        let response = self
            .server
            .post("/api/auth/signup")
            .json(&json!({"email": email, "password": PASSWORD, "code": code}))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        body["data"]["user"]["id"]
            .as_str()
            .expect("signup without user id")
            .to_string()
    }

    /// Login. Returns (access token, refresh cookie value).
    pub async fn login(&self, email: &str, fingerprint: &str) -> (String, String) {
        let response = self
            .server
            .post("/api/auth/login")
            .json(&json!({
                "email": email,
                "password": PASSWORD,
                "fingerprint": fingerprint,
            }))
            .await;
        response.assert_status_ok();

        let cookie = refresh_cookie_value(&response);
        let body: Value = response.json();
        let token = body["data"]["access_token"]
            .as_str()
            .expect("login without access token")
            .to_string();
        (token, cookie)
    }

    /// Register + login in one step.
    pub async fn register_and_login(&self, email: &str, fingerprint: &str) -> (String, String) {
        self.register_user(email).await;
        self.login(email, fingerprint).await
    }

    /// Create a company and return (company id, contextual access token).
    pub async fn create_company(&self, access_token: &str, name: &str) -> (CompanyId, String) {
        let response = self
            .server
            .post("/api/shared/companies")
            .add_header("authorization", format!("Bearer {access_token}"))
            .json(&json!({"name": name, "phone": "+30 210 0000000"}))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        let company_id: CompanyId = body["data"]["company"]["id"]
            .as_str()
            .expect("company without id")
            .parse()
            .expect("invalid company id");

        let context = self.context_token(access_token, company_id).await;
        (company_id, context)
    }

    /// Request a contextual token for a company.
    pub async fn context_token(&self, access_token: &str, company_id: CompanyId) -> String {
        let response = self
            .server
            .post("/api/auth/context-token")
            .add_header("authorization", format!("Bearer {access_token}"))
            .json(&json!({"company_id": company_id}))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        body["data"]["access_token"]
            .as_str()
            .expect("no contextual token")
            .to_string()
    }

    /// Record a paid-plan subscription placeholder directly in the store,
    /// as `confirm-and-subscribe` would.
    pub async fn insert_placeholder_subscription(
        &self,
        company_id: CompanyId,
        stripe_subscription_id: &str,
    ) -> Subscription {
        let subscription = Subscription::placeholder(
            company_id,
            self.catalog.paid_plan,
            Some(stripe_subscription_id.to_string()),
            BillingPeriod::Monthly,
        );
        let items: Vec<SubscriptionItem> = Vec::new();
        self.store
            .create_subscription(&subscription, &items)
            .await
            .expect("failed to seed subscription");
        subscription
    }
}

/// Seed the catalog the tests run against.
pub async fn seed_catalog(store: &MemStore) -> SeededCatalog {
    let free_plan = Plan {
        id: PlanId::generate(),
        key: "free".into(),
        name: "Free".into(),
        tier: PlanTier::Free,
        base_price: PriceSnapshot::free("eur"),
        extra_branch_price: PriceSnapshot::free("eur"),
        base_price_ids: StripePriceIds::default(),
        extra_branch_price_ids: StripePriceIds::default(),
        prices_synced_at: None,
    };

    let paid_plan = Plan {
        id: PlanId::generate(),
        key: "studio".into(),
        name: "Studio".into(),
        tier: PlanTier::Standard,
        base_price: PriceSnapshot {
            monthly_cents: 2990,
            yearly_cents: 29_900,
            currency: "eur".into(),
        },
        extra_branch_price: PriceSnapshot {
            monthly_cents: 500,
            yearly_cents: 5_000,
            currency: "eur".into(),
        },
        base_price_ids: StripePriceIds {
            monthly: Some("price_studio_base_m".into()),
            yearly: Some("price_studio_base_y".into()),
        },
        extra_branch_price_ids: StripePriceIds {
            monthly: Some("price_studio_branch_m".into()),
            yearly: Some("price_studio_branch_y".into()),
        },
        prices_synced_at: None,
    };

    let plugin_pattern = Plugin {
        id: PluginId::generate(),
        key: "pattern-cutting".into(),
        name: "Pattern cutting".into(),
        industries: vec!["clothing".into()],
        min_tier: PlanTier::Standard,
        price: PriceSnapshot {
            monthly_cents: 990,
            yearly_cents: 9_900,
            currency: "eur".into(),
        },
        price_ids: StripePriceIds {
            monthly: Some("price_plugin_pattern_m".into()),
            yearly: Some("price_plugin_pattern_y".into()),
        },
        prices_synced_at: None,
    };

    let plugin_reports = Plugin {
        id: PluginId::generate(),
        key: "reports".into(),
        name: "Reports".into(),
        industries: vec![],
        min_tier: PlanTier::Free,
        price: PriceSnapshot::free("eur"),
        price_ids: StripePriceIds::default(),
        prices_synced_at: None,
    };

    store.upsert_plan(&free_plan).await.unwrap();
    store.upsert_plan(&paid_plan).await.unwrap();
    store.upsert_plugin(&plugin_pattern).await.unwrap();
    store.upsert_plugin(&plugin_reports).await.unwrap();

    SeededCatalog {
        free_plan: free_plan.id,
        paid_plan: paid_plan.id,
        plugin_pattern: plugin_pattern.id,
        plugin_reports: plugin_reports.id,
    }
}

/// Pull the refresh cookie value out of a response's `Set-Cookie`.
pub fn refresh_cookie_value(response: &axum_test::TestResponse) -> String {
    let header = response
        .headers()
        .get("set-cookie")
        .expect("no Set-Cookie header")
        .to_str()
        .expect("unreadable Set-Cookie")
        .to_string();
    header
        .split(';')
        .next()
        .and_then(|kv| kv.strip_prefix("refresh_token="))
        .expect("not a refresh cookie")
        .to_string()
}

/// First run of `n` consecutive ASCII digits in `text`.
pub fn extract_digits(text: &str, n: usize) -> Option<String> {
    let bytes = text.as_bytes();
    let mut start = None;
    let mut len = 0;
    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_digit() {
            if start.is_none() {
                start = Some(i);
            }
            len += 1;
            if len == n {
                let s = start.unwrap();
                // Reject longer runs (timestamps etc.)
                if bytes.get(i + 1).map_or(true, |c| !c.is_ascii_digit()) {
                    return Some(text[s..=i].to_string());
                }
            }
        } else {
            start = None;
            len = 0;
        }
    }
    None
}
