//! The plan and plugin catalog.
//!
//! Catalog rows carry *cached* Stripe price snapshots. The request path
//! never reads prices from Stripe; the cache is refreshed exclusively by
//! `price.created`/`price.updated` webhooks matched on Stripe price ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{PlanId, PluginId};

/// Billing cadence of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    /// Billed every month.
    Monthly,
    /// Billed once a year; the discount is baked into the cached yearly price.
    Yearly,
}

impl BillingPeriod {
    /// The wire representation of the period.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

/// Stripe recurring interval, as delivered in price webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceInterval {
    /// `recurring.interval == "month"`.
    Month,
    /// `recurring.interval == "year"`.
    Year,
}

impl PriceInterval {
    /// The billing period a price with this interval belongs to.
    #[must_use]
    pub const fn billing_period(self) -> BillingPeriod {
        match self {
            Self::Month => BillingPeriod::Monthly,
            Self::Year => BillingPeriod::Yearly,
        }
    }
}

/// A cached price snapshot (both cadences, in minor units).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    /// Monthly amount in cents.
    pub monthly_cents: i64,
    /// Yearly amount in cents (12 months with discount baked in).
    pub yearly_cents: i64,
    /// ISO currency code, lowercase.
    pub currency: String,
}

impl PriceSnapshot {
    /// A zero price in the given currency.
    #[must_use]
    pub fn free(currency: impl Into<String>) -> Self {
        Self {
            monthly_cents: 0,
            yearly_cents: 0,
            currency: currency.into(),
        }
    }

    /// The cached amount for a billing period.
    #[must_use]
    pub const fn amount_for(&self, period: BillingPeriod) -> i64 {
        match period {
            BillingPeriod::Monthly => self.monthly_cents,
            BillingPeriod::Yearly => self.yearly_cents,
        }
    }

    /// Overwrite the cached amount for one cadence.
    pub fn set_amount(&mut self, period: BillingPeriod, cents: i64) {
        match period {
            BillingPeriod::Monthly => self.monthly_cents = cents,
            BillingPeriod::Yearly => self.yearly_cents = cents,
        }
    }
}

/// Plan tier, ordered. Plugins are gated on a minimum tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    /// Free tier.
    Free,
    /// Entry paid tier.
    Standard,
    /// Full-feature tier.
    Pro,
}

/// The Stripe price ids attached to one logical price (one per cadence).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripePriceIds {
    /// Price id of the monthly price.
    pub monthly: Option<String>,
    /// Price id of the yearly price.
    pub yearly: Option<String>,
}

impl StripePriceIds {
    /// The price id for a billing period, if configured.
    #[must_use]
    pub fn for_period(&self, period: BillingPeriod) -> Option<&str> {
        match period {
            BillingPeriod::Monthly => self.monthly.as_deref(),
            BillingPeriod::Yearly => self.yearly.as_deref(),
        }
    }

    /// Whether either cadence matches the given Stripe price id.
    #[must_use]
    pub fn matches(&self, price_id: &str) -> bool {
        self.monthly.as_deref() == Some(price_id) || self.yearly.as_deref() == Some(price_id)
    }
}

/// A subscription plan with cached base and extra-branch prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// The plan ID.
    pub id: PlanId,
    /// Stable catalog key (e.g. `starter`, `pro`).
    pub key: String,
    /// Display name.
    pub name: String,
    /// Tier for plugin gating.
    pub tier: PlanTier,
    /// Cached base price.
    pub base_price: PriceSnapshot,
    /// Cached per-extra-branch price.
    pub extra_branch_price: PriceSnapshot,
    /// Stripe price ids backing the base price.
    pub base_price_ids: StripePriceIds,
    /// Stripe price ids backing the extra-branch price.
    pub extra_branch_price_ids: StripePriceIds,
    /// When the cache was last refreshed by a webhook.
    pub prices_synced_at: Option<DateTime<Utc>>,
}

impl Plan {
    /// A plan is free when both cached base amounts are zero.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.base_price.monthly_cents == 0 && self.base_price.yearly_cents == 0
    }

    /// Apply a webhook price update if the id matches one of this plan's
    /// price fields. Returns whether anything changed.
    pub fn apply_price_update(
        &mut self,
        price_id: &str,
        interval: PriceInterval,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let period = interval.billing_period();
        if self.base_price_ids.for_period(period) == Some(price_id) {
            self.base_price.set_amount(period, amount_cents);
            self.prices_synced_at = Some(now);
            return true;
        }
        if self.extra_branch_price_ids.for_period(period) == Some(price_id) {
            self.extra_branch_price.set_amount(period, amount_cents);
            self.prices_synced_at = Some(now);
            return true;
        }
        false
    }
}

/// An optional paid add-on, scoped per branch and gated by plan tier and
/// the company's selected industries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    /// The plugin ID.
    pub id: PluginId,
    /// Stable catalog key (e.g. `pattern-cutting`).
    pub key: String,
    /// Display name.
    pub name: String,
    /// Industries the plugin applies to. Empty means all industries.
    pub industries: Vec<String>,
    /// Minimum plan tier that may enable the plugin.
    pub min_tier: PlanTier,
    /// Cached price.
    pub price: PriceSnapshot,
    /// Stripe price ids backing the price.
    pub price_ids: StripePriceIds,
    /// When the cache was last refreshed by a webhook.
    pub prices_synced_at: Option<DateTime<Utc>>,
}

impl Plugin {
    /// Whether the plugin may be selected with the given plan tier and
    /// industry selection.
    #[must_use]
    pub fn eligible_for(&self, tier: PlanTier, industries: &[String]) -> bool {
        if tier < self.min_tier {
            return false;
        }
        self.industries.is_empty() || self.industries.iter().any(|i| industries.contains(i))
    }

    /// Apply a webhook price update if the id matches. Returns whether
    /// anything changed.
    pub fn apply_price_update(
        &mut self,
        price_id: &str,
        interval: PriceInterval,
        amount_cents: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let period = interval.billing_period();
        if self.price_ids.for_period(period) == Some(price_id) {
            self.price.set_amount(period, amount_cents);
            self.prices_synced_at = Some(now);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(monthly: i64, yearly: i64) -> Plan {
        Plan {
            id: PlanId::generate(),
            key: "starter".into(),
            name: "Starter".into(),
            tier: PlanTier::Standard,
            base_price: PriceSnapshot {
                monthly_cents: monthly,
                yearly_cents: yearly,
                currency: "eur".into(),
            },
            extra_branch_price: PriceSnapshot::free("eur"),
            base_price_ids: StripePriceIds {
                monthly: Some("price_base_m".into()),
                yearly: Some("price_base_y".into()),
            },
            extra_branch_price_ids: StripePriceIds {
                monthly: Some("price_branch_m".into()),
                yearly: None,
            },
            prices_synced_at: None,
        }
    }

    #[test]
    fn free_requires_both_cadences_zero() {
        assert!(plan(0, 0).is_free());
        assert!(!plan(0, 9900).is_free());
        assert!(!plan(990, 0).is_free());
    }

    #[test]
    fn price_update_matches_base_monthly() {
        let mut p = plan(990, 9900);
        let now = Utc::now();
        assert!(p.apply_price_update("price_base_m", PriceInterval::Month, 1290, now));
        assert_eq!(p.base_price.monthly_cents, 1290);
        assert_eq!(p.base_price.yearly_cents, 9900);
        assert_eq!(p.prices_synced_at, Some(now));
    }

    #[test]
    fn price_update_matches_extra_branch() {
        let mut p = plan(990, 9900);
        assert!(p.apply_price_update("price_branch_m", PriceInterval::Month, 500, Utc::now()));
        assert_eq!(p.extra_branch_price.monthly_cents, 500);
    }

    #[test]
    fn price_update_ignores_unknown_id() {
        let mut p = plan(990, 9900);
        assert!(!p.apply_price_update("price_other", PriceInterval::Month, 1, Utc::now()));
        assert_eq!(p.base_price.monthly_cents, 990);
    }

    #[test]
    fn plugin_gating_by_tier_and_industry() {
        let plugin = Plugin {
            id: PluginId::generate(),
            key: "pattern-cutting".into(),
            name: "Pattern cutting".into(),
            industries: vec!["clothing".into()],
            min_tier: PlanTier::Standard,
            price: PriceSnapshot::free("eur"),
            price_ids: StripePriceIds::default(),
            prices_synced_at: None,
        };

        assert!(plugin.eligible_for(PlanTier::Standard, &["clothing".into()]));
        assert!(plugin.eligible_for(PlanTier::Pro, &["clothing".into()]));
        assert!(!plugin.eligible_for(PlanTier::Free, &["clothing".into()]));
        assert!(!plugin.eligible_for(PlanTier::Pro, &["construction".into()]));
    }

    #[test]
    fn plugin_without_industries_applies_everywhere() {
        let plugin = Plugin {
            id: PluginId::generate(),
            key: "reports".into(),
            name: "Reports".into(),
            industries: vec![],
            min_tier: PlanTier::Free,
            price: PriceSnapshot::free("eur"),
            price_ids: StripePriceIds::default(),
            prices_synced_at: None,
        };
        assert!(plugin.eligible_for(PlanTier::Free, &["construction".into()]));
    }
}
