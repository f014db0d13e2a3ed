//! Price preview math.
//!
//! Previews are computed from the cached catalog prices only; the request
//! path never calls Stripe. All arithmetic is integer cents so the preview
//! reproduces Stripe's settlement amounts exactly.

use serde::{Deserialize, Serialize};

use crate::catalog::{BillingPeriod, Plan, Plugin};

/// VAT rate applied on top of the subtotal, in percent.
pub const VAT_RATE_PERCENT: i64 = 24;

/// What a preview line charges for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    /// The plan's base price.
    PlanBase,
    /// Per-extra-branch charge.
    ExtraBranch,
    /// A plugin charge.
    Plugin,
}

/// One line of a price preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewLine {
    /// What the line charges for.
    pub kind: LineKind,
    /// Catalog key of the plan or plugin.
    pub key: String,
    /// Display label.
    pub label: String,
    /// Quantity.
    pub quantity: i64,
    /// Unit amount in cents for the selected billing period.
    pub unit_cents: i64,
    /// `quantity * unit_cents`.
    pub amount_cents: i64,
}

/// A computed price preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePreview {
    /// ISO currency code, lowercase.
    pub currency: String,
    /// Billing cadence the preview was computed for.
    pub billing: BillingPeriod,
    /// Line breakdown.
    pub lines: Vec<PreviewLine>,
    /// Sum of line amounts.
    pub subtotal_cents: i64,
    /// `total - subtotal`.
    pub vat_cents: i64,
    /// `round_half_up(subtotal * (100 + VAT) / 100)`.
    pub total_cents: i64,
}

/// Compute a preview for a plan, billing period, extra-branch count and
/// plugin selection.
///
/// Plugins are billed once (they provision onto the main branch during
/// onboarding); extra branches are billed at the plan's extra-branch price.
/// A free plan with no paid lines yields an all-zero preview.
#[must_use]
pub fn compute_preview(
    plan: &Plan,
    billing: BillingPeriod,
    extra_branches: i64,
    plugins: &[Plugin],
) -> PricePreview {
    let mut lines = Vec::new();

    let base_unit = plan.base_price.amount_for(billing);
    lines.push(PreviewLine {
        kind: LineKind::PlanBase,
        key: plan.key.clone(),
        label: plan.name.clone(),
        quantity: 1,
        unit_cents: base_unit,
        amount_cents: base_unit,
    });

    if extra_branches > 0 {
        let unit = plan.extra_branch_price.amount_for(billing);
        lines.push(PreviewLine {
            kind: LineKind::ExtraBranch,
            key: plan.key.clone(),
            label: "Extra branch".into(),
            quantity: extra_branches,
            unit_cents: unit,
            amount_cents: unit * extra_branches,
        });
    }

    for plugin in plugins {
        let unit = plugin.price.amount_for(billing);
        lines.push(PreviewLine {
            kind: LineKind::Plugin,
            key: plugin.key.clone(),
            label: plugin.name.clone(),
            quantity: 1,
            unit_cents: unit,
            amount_cents: unit,
        });
    }

    let subtotal_cents: i64 = lines.iter().map(|l| l.amount_cents).sum();
    let total_cents = add_vat(subtotal_cents);

    PricePreview {
        currency: plan.base_price.currency.clone(),
        billing,
        lines,
        subtotal_cents,
        vat_cents: total_cents - subtotal_cents,
        total_cents,
    }
}

/// Gross amount for a net amount, rounded half-up to whole cents.
#[must_use]
pub const fn add_vat(subtotal_cents: i64) -> i64 {
    (subtotal_cents * (100 + VAT_RATE_PERCENT) + 50) / 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PlanTier, PriceSnapshot, StripePriceIds};
    use crate::ids::{PlanId, PluginId};

    fn plan(monthly: i64, yearly: i64, branch_monthly: i64) -> Plan {
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
            extra_branch_price: PriceSnapshot {
                monthly_cents: branch_monthly,
                yearly_cents: branch_monthly * 12,
                currency: "eur".into(),
            },
            base_price_ids: StripePriceIds::default(),
            extra_branch_price_ids: StripePriceIds::default(),
            prices_synced_at: None,
        }
    }

    fn plugin(key: &str, monthly: i64) -> Plugin {
        Plugin {
            id: PluginId::generate(),
            key: key.into(),
            name: key.into(),
            industries: vec![],
            min_tier: PlanTier::Free,
            price: PriceSnapshot {
                monthly_cents: monthly,
                yearly_cents: monthly * 12,
                currency: "eur".into(),
            },
            price_ids: StripePriceIds::default(),
            prices_synced_at: None,
        }
    }

    #[test]
    fn free_plan_previews_all_zero() {
        let preview = compute_preview(&plan(0, 0, 0), BillingPeriod::Monthly, 0, &[]);
        assert_eq!(preview.subtotal_cents, 0);
        assert_eq!(preview.vat_cents, 0);
        assert_eq!(preview.total_cents, 0);
    }

    #[test]
    fn paid_plan_vat_is_exact() {
        // 29.90 base + 2 branches * 5.00 + 9.90 plugin = 49.80
        let preview = compute_preview(
            &plan(2990, 29_900, 500),
            BillingPeriod::Monthly,
            2,
            &[plugin("reports", 990)],
        );
        assert_eq!(preview.subtotal_cents, 4980);
        // 4980 * 1.24 = 6175.2 -> 6175
        assert_eq!(preview.total_cents, 6175);
        assert_eq!(preview.vat_cents, 1195);
        assert_eq!(
            preview.total_cents,
            preview.subtotal_cents + preview.vat_cents
        );
    }

    #[test]
    fn vat_rounds_half_up() {
        // 1 cent * 1.24 = 1.24 -> 1; 50 * 1.24 = 62 exactly
        assert_eq!(add_vat(1), 1);
        assert_eq!(add_vat(50), 62);
        // 102 * 1.24 = 126.48 -> 126; 125 * 1.24 = 155 exactly
        assert_eq!(add_vat(102), 126);
        assert_eq!(add_vat(125), 155);
        // 99 * 1.24 = 122.76 -> 123 (half-up)
        assert_eq!(add_vat(99), 123);
    }

    #[test]
    fn yearly_uses_yearly_snapshot() {
        let preview = compute_preview(&plan(2990, 29_900, 500), BillingPeriod::Yearly, 0, &[]);
        assert_eq!(preview.subtotal_cents, 29_900);
        assert_eq!(preview.billing, BillingPeriod::Yearly);
    }

    #[test]
    fn no_extra_branch_line_when_zero() {
        let preview = compute_preview(&plan(2990, 29_900, 500), BillingPeriod::Monthly, 0, &[]);
        assert_eq!(preview.lines.len(), 1);
        assert_eq!(preview.lines[0].kind, LineKind::PlanBase);
    }

    #[test]
    fn branch_line_carries_quantity() {
        let preview = compute_preview(&plan(2990, 29_900, 500), BillingPeriod::Monthly, 3, &[]);
        let branch_line = preview
            .lines
            .iter()
            .find(|l| l.kind == LineKind::ExtraBranch)
            .unwrap();
        assert_eq!(branch_line.quantity, 3);
        assert_eq!(branch_line.amount_cents, 1500);
    }
}
