//! Subscriptions, subscription items and the payment ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::BillingPeriod;
use crate::ids::{CompanyId, PaymentId, PlanId, SubscriptionId};

/// Billing status of a subscription.
///
/// The Stripe webhook is the sole writer of this field after the initial
/// placeholder; see [`BillingStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    /// Placeholder written by the request path before reconciliation.
    Pending,
    /// In good standing.
    Active,
    /// Last invoice failed; Stripe is retrying.
    PastDue,
    /// Terminated.
    Canceled,
}

impl BillingStatus {
    /// The wire representation of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }

    /// Parse a Stripe subscription status string. Unknown statuses map to
    /// the closest local state.
    #[must_use]
    pub fn from_stripe(status: &str) -> Self {
        match status {
            "active" | "trialing" => Self::Active,
            "past_due" | "unpaid" | "incomplete" => Self::PastDue,
            "canceled" | "incomplete_expired" => Self::Canceled,
            _ => Self::Pending,
        }
    }

    /// Status-transition guard enforcing webhook ownership: a settled
    /// status never regresses to `Pending`, and `Canceled` is terminal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => true,
            Self::Active | Self::PastDue => !matches!(next, Self::Pending),
            Self::Canceled => matches!(next, Self::Canceled),
        }
    }
}

/// One active subscription per company.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// The subscription ID.
    pub id: SubscriptionId,
    /// Owning company.
    pub company_id: CompanyId,
    /// The subscribed plan.
    pub plan_id: PlanId,
    /// Stripe subscription id; `None` for free plans.
    pub stripe_subscription_id: Option<String>,
    /// Billing cadence.
    pub billing_period: BillingPeriod,
    /// Billing status; webhook-owned after the placeholder.
    pub billing_status: BillingStatus,
    /// Start of the current billing period, once reconciled.
    pub current_period_start: Option<DateTime<Utc>>,
    /// End of the current billing period, once reconciled.
    pub current_period_end: Option<DateTime<Utc>>,
    /// Whether cancellation at period end was requested.
    pub cancel_at_period_end: bool,
    /// When the subscription row was created.
    pub created_at: DateTime<Utc>,
    /// Last reconciliation time.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// The placeholder row written by `confirm-and-subscribe` before the
    /// first webhook lands.
    #[must_use]
    pub fn placeholder(
        company_id: CompanyId,
        plan_id: PlanId,
        stripe_subscription_id: Option<String>,
        billing_period: BillingPeriod,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::generate(),
            company_id,
            plan_id,
            stripe_subscription_id,
            billing_period,
            billing_status: BillingStatus::Pending,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The row written for a free plan: immediately active, no Stripe id,
    /// no period bounds to reconcile.
    #[must_use]
    pub fn free(company_id: CompanyId, plan_id: PlanId, billing_period: BillingPeriod) -> Self {
        let mut sub = Self::placeholder(company_id, plan_id, None, billing_period);
        sub.billing_status = BillingStatus::Active;
        sub
    }
}

/// What a subscription item charges for. Mirrors the preview line kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionItemKind {
    /// The plan's base price.
    PlanBase,
    /// Per-extra-branch charge.
    ExtraBranch,
    /// A plugin charge.
    Plugin,
}

/// One row per Stripe subscription line, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    /// Owning subscription.
    pub subscription_id: SubscriptionId,
    /// What the line charges for.
    pub kind: SubscriptionItemKind,
    /// Catalog key of the plan or plugin.
    pub reference_key: String,
    /// Stripe subscription-item id, if any.
    pub stripe_item_id: Option<String>,
    /// Quantity.
    pub quantity: i64,
    /// Unit amount in cents at subscription time.
    pub unit_amount_cents: i64,
}

/// Outcome of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Invoice settled.
    Paid,
    /// Invoice failed.
    Failed,
}

/// One ledger entry per Stripe invoice, upserted by invoice id so webhook
/// redelivery cannot duplicate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// The ledger ID (time-ordered).
    pub id: PaymentId,
    /// Company the invoice belongs to.
    pub company_id: CompanyId,
    /// Stripe invoice id; the idempotency key.
    pub stripe_invoice_id: String,
    /// Invoice amount in cents.
    pub amount_cents: i64,
    /// ISO currency code, lowercase.
    pub currency: String,
    /// Outcome.
    pub status: PaymentStatus,
    /// Stripe `billing_reason` (e.g. `subscription_create`).
    pub billing_reason: Option<String>,
    /// When the ledger entry was recorded.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_status_never_regresses_to_pending() {
        assert!(BillingStatus::Pending.can_transition_to(BillingStatus::Active));
        assert!(BillingStatus::Active.can_transition_to(BillingStatus::PastDue));
        assert!(BillingStatus::PastDue.can_transition_to(BillingStatus::Active));
        assert!(!BillingStatus::Active.can_transition_to(BillingStatus::Pending));
        assert!(!BillingStatus::PastDue.can_transition_to(BillingStatus::Pending));
    }

    #[test]
    fn canceled_is_terminal() {
        assert!(!BillingStatus::Canceled.can_transition_to(BillingStatus::Active));
        assert!(!BillingStatus::Canceled.can_transition_to(BillingStatus::Pending));
        assert!(BillingStatus::Canceled.can_transition_to(BillingStatus::Canceled));
    }

    #[test]
    fn stripe_status_mapping() {
        assert_eq!(BillingStatus::from_stripe("active"), BillingStatus::Active);
        assert_eq!(
            BillingStatus::from_stripe("past_due"),
            BillingStatus::PastDue
        );
        assert_eq!(
            BillingStatus::from_stripe("canceled"),
            BillingStatus::Canceled
        );
        assert_eq!(
            BillingStatus::from_stripe("something-new"),
            BillingStatus::Pending
        );
    }

    #[test]
    fn free_subscription_is_active_without_stripe_id() {
        let sub = Subscription::free(
            CompanyId::generate(),
            PlanId::generate(),
            BillingPeriod::Monthly,
        );
        assert_eq!(sub.billing_status, BillingStatus::Active);
        assert!(sub.stripe_subscription_id.is_none());
    }
}
