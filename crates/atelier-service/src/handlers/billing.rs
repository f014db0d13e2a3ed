//! Billing handlers: price previews from the cached catalog, Stripe
//! checkout plumbing and onboarding completion.
//!
//! Previews never call Stripe; they are computed from the cached price
//! snapshots so they reproduce settlement amounts exactly. The request
//! path writes only placeholder subscription rows; billing status and
//! period bounds belong to the webhook.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use atelier_core::onboarding::BRANCHES_RANGE;
use atelier_core::{
    compute_preview, BillingPeriod, BillingStatus, Branch, Company, ErrorCode, LineKind,
    OnboardingRecord, Plan, PlanId, Plugin, PricePreview, Subscription, SubscriptionId,
    SubscriptionItem, SubscriptionItemKind,
};

use crate::error::{ApiError, ApiResponse};
use crate::extract::CompanyScope;
use crate::handlers::onboarding::{load_onboarding, OnboardingView};
use crate::state::AppState;
use crate::stripe::StripeClient;

// ============================================================================
// price-preview
// ============================================================================

/// Request body for `price-preview`.
#[derive(Debug, Deserialize)]
pub struct PricePreviewRequest {
    /// The plan to price.
    pub plan_id: PlanId,
    /// Billing cadence.
    pub billing: BillingPeriod,
    /// Extra branches beyond the main one.
    #[serde(default)]
    pub branches: i64,
    /// Selected plugin keys.
    #[serde(default)]
    pub plugins: Vec<String>,
}

/// Compute a preview from the cached catalog prices.
pub async fn price_preview(
    State(state): State<Arc<AppState>>,
    _scope: CompanyScope,
    Json(body): Json<PricePreviewRequest>,
) -> Result<Json<ApiResponse<PricePreview>>, ApiError> {
    if !BRANCHES_RANGE.contains(&body.branches) {
        return Err(ApiError::InvalidRange(format!(
            "branches must be between {} and {}",
            BRANCHES_RANGE.start(),
            BRANCHES_RANGE.end()
        )));
    }

    let plan = load_plan(&state, body.plan_id).await?;
    let plugins = load_plugins(&state, &body.plugins).await?;
    let preview = compute_preview(&plan, body.billing, body.branches, &plugins);

    Ok(ApiResponse::ok("OK", preview))
}

// ============================================================================
// Intents
// ============================================================================

/// Payload carrying an intent's client secret.
#[derive(Debug, Serialize)]
pub struct IntentResponse {
    /// Intent id.
    pub intent_id: String,
    /// Client secret confirmed in the browser.
    pub client_secret: Option<String>,
}

/// Create a setup intent to save a payment method without charging.
pub async fn create_setup_intent(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
) -> Result<Json<ApiResponse<IntentResponse>>, ApiError> {
    scope.require_permission("billing:manage")?;
    let stripe = require_stripe(&state)?;
    let (company, customer_id) = require_customer(&state, stripe, scope.company_id).await?;

    let intent = stripe
        .create_setup_intent(&customer_id, &company.id.to_string())
        .await
        .map_err(|e| ApiError::Stripe(e.to_string()))?;

    Ok(ApiResponse::ok(
        "Setup intent created",
        IntentResponse {
            intent_id: intent.id,
            client_secret: intent.client_secret,
        },
    ))
}

/// Create a payment intent for the first charge of a paid plan. The amount
/// is the server-computed preview total of the stored draft, never a
/// client-supplied figure.
pub async fn create_payment_intent(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
) -> Result<Json<ApiResponse<IntentResponse>>, ApiError> {
    scope.require_permission("billing:manage")?;
    let stripe = require_stripe(&state)?;

    let record = load_onboarding(&state, &scope).await?;
    let (plan, billing, plugins) = draft_selection(&state, &record).await?;
    if plan.is_free() {
        return Err(ApiError::Validation(
            "the selected plan does not require payment".into(),
        ));
    }

    let preview = compute_preview(&plan, billing, record.data.branches, &plugins);
    let (company, customer_id) = require_customer(&state, stripe, scope.company_id).await?;

    let intent = stripe
        .create_payment_intent(
            &customer_id,
            preview.total_cents,
            &preview.currency,
            &company.id.to_string(),
        )
        .await
        .map_err(|e| ApiError::Stripe(e.to_string()))?;

    Ok(ApiResponse::ok(
        "Payment intent created",
        IntentResponse {
            intent_id: intent.id,
            client_secret: intent.client_secret,
        },
    ))
}

// ============================================================================
// confirm-and-subscribe
// ============================================================================

/// Request body for `confirm-and-subscribe`.
#[derive(Debug, Deserialize)]
pub struct ConfirmAndSubscribeRequest {
    /// The payment method confirmed client-side.
    pub payment_method_id: String,
}

/// Payload of `confirm-and-subscribe`.
#[derive(Debug, Serialize)]
pub struct ConfirmAndSubscribeResponse {
    /// Local subscription id.
    pub subscription_id: SubscriptionId,
    /// Stripe subscription id.
    pub stripe_subscription_id: String,
    /// Local billing status (placeholder until the webhook reconciles).
    pub billing_status: BillingStatus,
}

/// Create the Stripe subscription server-side from the stored draft and
/// record the placeholder row. Billing status stays `pending` until the
/// `invoice.paid` webhook lands; the webhook owns that field.
pub async fn confirm_and_subscribe(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
    Json(body): Json<ConfirmAndSubscribeRequest>,
) -> Result<Json<ApiResponse<ConfirmAndSubscribeResponse>>, ApiError> {
    scope.require_permission("billing:manage")?;
    let stripe = require_stripe(&state)?;

    let record = load_onboarding(&state, &scope).await?;
    let (plan, billing, plugins) = draft_selection(&state, &record).await?;
    if plan.is_free() {
        return Err(ApiError::Validation(
            "free plans are provisioned without a subscription".into(),
        ));
    }

    let stripe_items = subscription_price_items(&plan, billing, record.data.branches, &plugins)?;
    let (_, customer_id) = require_customer(&state, stripe, scope.company_id).await?;

    let stripe_subscription = stripe
        .create_subscription(
            &customer_id,
            &stripe_items,
            &body.payment_method_id,
            &scope.company_id.to_string(),
        )
        .await
        .map_err(|e| ApiError::Stripe(e.to_string()))?;

    let subscription = Subscription::placeholder(
        scope.company_id,
        plan.id,
        Some(stripe_subscription.id.clone()),
        billing,
    );

    // Audit rows mirror the preview lines; Stripe item ids are matched
    // back by price id.
    let preview = compute_preview(&plan, billing, record.data.branches, &plugins);
    let items = preview
        .lines
        .iter()
        .map(|line| {
            let price_id = match line.kind {
                LineKind::PlanBase => plan.base_price_ids.for_period(billing),
                LineKind::ExtraBranch => plan.extra_branch_price_ids.for_period(billing),
                LineKind::Plugin => plugins
                    .iter()
                    .find(|p| p.key == line.key)
                    .and_then(|p| p.price_ids.for_period(billing)),
            };
            let stripe_item_id = price_id.and_then(|pid| {
                stripe_subscription
                    .items
                    .data
                    .iter()
                    .find(|i| i.price.id == pid)
                    .map(|i| i.id.clone())
            });
            SubscriptionItem {
                subscription_id: subscription.id,
                kind: item_kind(line.kind),
                reference_key: line.key.clone(),
                stripe_item_id,
                quantity: line.quantity,
                unit_amount_cents: line.unit_cents,
            }
        })
        .collect::<Vec<_>>();

    state.store.create_subscription(&subscription, &items).await?;

    tracing::info!(
        company_id = %scope.company_id,
        stripe_subscription_id = %stripe_subscription.id,
        "Subscription created"
    );

    Ok(ApiResponse::ok(
        "Subscription created",
        ConfirmAndSubscribeResponse {
            subscription_id: subscription.id,
            stripe_subscription_id: stripe_subscription.id,
            billing_status: subscription.billing_status,
        },
    ))
}

// ============================================================================
// onboarding-complete
// ============================================================================

/// Payload of `onboarding-complete`.
#[derive(Debug, Serialize)]
pub struct OnboardingCompleteResponse {
    /// Final onboarding state.
    pub onboarding: OnboardingView,
    /// The provisioned branches; exactly one is the main branch.
    pub branches: Vec<Branch>,
}

/// Complete onboarding: free plans are provisioned directly, paid plans
/// require the confirmed subscription recorded by `confirm-and-subscribe`.
/// Provisioning is one atomic store operation.
pub async fn onboarding_complete(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
) -> Result<Json<ApiResponse<OnboardingCompleteResponse>>, ApiError> {
    scope.require_permission("onboarding:manage")?;

    let record = load_onboarding(&state, &scope).await?;
    if record.is_completed {
        let branches = state.store.list_branches(scope.company_id).await?;
        return Ok(ApiResponse::ok(
            "Onboarding already completed",
            OnboardingCompleteResponse {
                onboarding: OnboardingView::from(&record),
                branches,
            },
        ));
    }

    for step in [
        atelier_core::OnboardingStep::Company,
        atelier_core::OnboardingStep::Industries,
        atelier_core::OnboardingStep::Plan,
    ] {
        record
            .data
            .validate_step(step)
            .map_err(|e| ApiError::Validation(e.to_string()))?;
    }

    let (plan, billing, plugins) = draft_selection(&state, &record).await?;

    // Plugin gating is re-checked server-side at the finish line.
    for plugin in &plugins {
        if !plugin.eligible_for(plan.tier, &record.data.industries) {
            return Err(ApiError::Validation(format!(
                "plugin {} is not available for this plan and industry selection",
                plugin.key
            )));
        }
    }

    let subscription = if plan.is_free() {
        let sub = Subscription::free(scope.company_id, plan.id, billing);
        let items = compute_preview(&plan, billing, record.data.branches, &plugins)
            .lines
            .iter()
            .map(|line| SubscriptionItem {
                subscription_id: sub.id,
                kind: item_kind(line.kind),
                reference_key: line.key.clone(),
                stripe_item_id: None,
                quantity: line.quantity,
                unit_amount_cents: line.unit_cents,
            })
            .collect::<Vec<_>>();
        Some((sub, items))
    } else {
        // Paid path: a confirmed subscription must already exist.
        let existing = state
            .store
            .get_subscription_for_company(scope.company_id)
            .await?
            .filter(|s| s.billing_status != BillingStatus::Canceled)
            .ok_or(ApiError::PaymentRequired)?;
        tracing::debug!(
            subscription_id = %existing.id,
            status = existing.billing_status.as_str(),
            "Paid plan confirmed"
        );
        None
    };

    let main_branch_name = record
        .data
        .company
        .as_ref()
        .map_or_else(String::new, |c| c.name.clone());

    let branches = state
        .store
        .complete_onboarding(atelier_store::CompleteOnboarding {
            company_id: scope.company_id,
            main_branch_name,
            extra_branches: record.data.branches,
            plugin_ids: plugins.iter().map(|p| p.id).collect(),
            subscription,
        })
        .await?;

    let record = state
        .store
        .get_onboarding(scope.company_id)
        .await?
        .ok_or_else(|| ApiError::Internal("onboarding row vanished".into()))?;

    tracing::info!(company_id = %scope.company_id, "Onboarding completed");

    Ok(ApiResponse::ok(
        "Onboarding completed",
        OnboardingCompleteResponse {
            onboarding: OnboardingView::from(&record),
            branches,
        },
    ))
}

// ============================================================================
// check-plan-change
// ============================================================================

/// Request body for `check-plan-change`.
#[derive(Debug, Deserialize)]
pub struct CheckPlanChangeRequest {
    /// Target plan.
    pub plan_id: PlanId,
    /// Target billing cadence.
    pub billing: BillingPeriod,
}

/// Payload of `check-plan-change`.
#[derive(Debug, Serialize)]
pub struct CheckPlanChangeResponse {
    /// Whether the change may proceed.
    pub allowed: bool,
    /// Why not, when disallowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Preview of the target plan at the company's current shape.
    pub preview: PricePreview,
}

/// Eligibility check plus target-plan preview. Executing the change is a
/// separate, future operation.
pub async fn check_plan_change(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
    Json(body): Json<CheckPlanChangeRequest>,
) -> Result<Json<ApiResponse<CheckPlanChangeResponse>>, ApiError> {
    scope.require_permission("billing:manage")?;

    let subscription = state
        .store
        .get_subscription_for_company(scope.company_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(
                ErrorCode::SubscriptionNotFound,
                "no subscription for this company".into(),
            )
        })?;

    let target = load_plan(&state, body.plan_id).await?;

    // Preview the target at the company's current shape: provisioned
    // branches and currently subscribed plugins.
    let branch_count =
        i64::try_from(state.store.list_branches(scope.company_id).await?.len()).unwrap_or(1);
    let extra_branches = (branch_count - 1).clamp(0, *BRANCHES_RANGE.end());

    let plugin_keys: Vec<String> = state
        .store
        .list_subscription_items(subscription.id)
        .await?
        .into_iter()
        .filter(|i| i.kind == SubscriptionItemKind::Plugin)
        .map(|i| i.reference_key)
        .collect();
    let plugins = state.store.get_plugins_by_keys(&plugin_keys).await?;

    let preview = compute_preview(&target, body.billing, extra_branches, &plugins);

    let reason = if subscription.plan_id == target.id
        && subscription.billing_period == body.billing
    {
        Some("already on this plan".to_string())
    } else if subscription.billing_status == BillingStatus::Canceled {
        Some("subscription is canceled".to_string())
    } else if subscription.cancel_at_period_end {
        Some("subscription is scheduled for cancellation".to_string())
    } else if subscription.billing_status == BillingStatus::Pending {
        Some("subscription is awaiting payment confirmation".to_string())
    } else {
        None
    };

    Ok(ApiResponse::ok(
        "OK",
        CheckPlanChangeResponse {
            allowed: reason.is_none(),
            reason,
            preview,
        },
    ))
}

// ============================================================================
// Shared helpers
// ============================================================================

fn require_stripe(state: &AppState) -> Result<&StripeClient, ApiError> {
    state
        .stripe
        .as_deref()
        .ok_or_else(|| ApiError::Stripe("stripe is not configured".into()))
}

async fn load_plan(state: &AppState, plan_id: PlanId) -> Result<Plan, ApiError> {
    state
        .store
        .get_plan(plan_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(ErrorCode::PlanNotFound, "plan not found".into()))
}

async fn load_plugins(state: &AppState, keys: &[String]) -> Result<Vec<Plugin>, ApiError> {
    let plugins = state.store.get_plugins_by_keys(keys).await?;
    if plugins.len() != keys.len() {
        let found: Vec<&str> = plugins.iter().map(|p| p.key.as_str()).collect();
        let missing: Vec<&str> = keys
            .iter()
            .map(String::as_str)
            .filter(|k| !found.contains(k))
            .collect();
        return Err(ApiError::NotFound(
            ErrorCode::PluginNotFound,
            format!("unknown plugins: {}", missing.join(", ")),
        ));
    }
    Ok(plugins)
}

/// Resolve the draft's plan/billing/plugins against the catalog.
async fn draft_selection(
    state: &AppState,
    record: &OnboardingRecord,
) -> Result<(Plan, BillingPeriod, Vec<Plugin>), ApiError> {
    let selection = record
        .data
        .plan
        .ok_or_else(|| ApiError::Validation("no plan selected".into()))?;
    let plan = load_plan(state, selection.id).await?;
    let plugins = load_plugins(state, &record.data.plugins).await?;
    Ok((plan, selection.billing, plugins))
}

/// (price id, quantity) pairs for the Stripe subscription.
fn subscription_price_items(
    plan: &Plan,
    billing: BillingPeriod,
    extra_branches: i64,
    plugins: &[Plugin],
) -> Result<Vec<(String, i64)>, ApiError> {
    let mut items = Vec::new();

    let base = plan.base_price_ids.for_period(billing).ok_or_else(|| {
        ApiError::Validation(format!(
            "plan {} has no {} stripe price configured",
            plan.key,
            billing.as_str()
        ))
    })?;
    items.push((base.to_string(), 1));

    if extra_branches > 0 {
        let branch_price = plan
            .extra_branch_price_ids
            .for_period(billing)
            .ok_or_else(|| {
                ApiError::Validation(format!(
                    "plan {} has no {} extra-branch price configured",
                    plan.key,
                    billing.as_str()
                ))
            })?;
        items.push((branch_price.to_string(), extra_branches));
    }

    for plugin in plugins {
        let price = plugin.price_ids.for_period(billing).ok_or_else(|| {
            ApiError::Validation(format!(
                "plugin {} has no {} stripe price configured",
                plugin.key,
                billing.as_str()
            ))
        })?;
        items.push((price.to_string(), 1));
    }

    Ok(items)
}

const fn item_kind(kind: LineKind) -> SubscriptionItemKind {
    match kind {
        LineKind::PlanBase => SubscriptionItemKind::PlanBase,
        LineKind::ExtraBranch => SubscriptionItemKind::ExtraBranch,
        LineKind::Plugin => SubscriptionItemKind::Plugin,
    }
}

/// Lazily attach a Stripe customer to the company.
async fn require_customer(
    state: &AppState,
    stripe: &StripeClient,
    company_id: atelier_core::CompanyId,
) -> Result<(Company, String), ApiError> {
    let company = state
        .store
        .get_company(company_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(ErrorCode::CompanyNotFound, "company not found".into())
        })?;

    if let Some(customer_id) = &company.stripe_customer_id {
        let id = customer_id.clone();
        return Ok((company, id));
    }

    let owner = state.store.get_company_owner(company_id).await?;
    let customer = stripe
        .create_customer(
            &company.id.to_string(),
            &company.name,
            owner.as_ref().map(|u| u.email.as_str()),
        )
        .await
        .map_err(|e| ApiError::Stripe(e.to_string()))?;

    state
        .store
        .set_company_stripe_customer(company_id, &customer.id)
        .await?;

    Ok((company, customer.id))
}
