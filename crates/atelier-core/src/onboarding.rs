//! The onboarding draft and its step machine.
//!
//! The server is the single source of truth for onboarding progress. The
//! draft is a typed document mutated incrementally across steps; the
//! "changing X resets Y" dependencies are expressed as one declarative rule
//! table instead of ad hoc conditionals, so the dependency graph has a
//! single definition that both the merge logic and the tests read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::catalog::BillingPeriod;
use crate::ids::{CompanyId, PlanId};

/// Inclusive bounds for the extra-branch count in a draft.
pub const BRANCHES_RANGE: std::ops::RangeInclusive<i64> = 0..=9;

/// Wizard steps, in order. `Completed` is terminal and not a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStep {
    /// Step 1: company details.
    Company,
    /// Step 2: industry selection.
    Industries,
    /// Step 3: plan selection.
    Plan,
    /// Step 4: plugin selection.
    Plugins,
    /// Step 5: review and payment.
    Finalize,
}

impl OnboardingStep {
    /// First wizard step.
    pub const FIRST: Self = Self::Company;
    /// Last wizard step.
    pub const LAST: Self = Self::Finalize;

    /// 1-based step number as exposed over the API.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Company => 1,
            Self::Industries => 2,
            Self::Plan => 3,
            Self::Plugins => 4,
            Self::Finalize => 5,
        }
    }

    /// Parse a 1-based step number.
    #[must_use]
    pub const fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Company),
            2 => Some(Self::Industries),
            3 => Some(Self::Plan),
            4 => Some(Self::Plugins),
            5 => Some(Self::Finalize),
            _ => None,
        }
    }

    /// The step after this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    /// The step before this one, if any.
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        match self {
            Self::Company => None,
            Self::Industries => Some(Self::Company),
            Self::Plan => Some(Self::Industries),
            Self::Plugins => Some(Self::Plan),
            Self::Finalize => Some(Self::Plugins),
        }
    }
}

/// Company details captured in step 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyInfo {
    /// Company display name.
    pub name: String,
    /// Contact phone.
    pub phone: Option<String>,
}

/// The plan chosen in step 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSelection {
    /// Catalog plan id.
    pub id: PlanId,
    /// Billing cadence.
    pub billing: BillingPeriod,
}

/// The in-progress onboarding document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnboardingDraft {
    /// Step 1 data.
    pub company: Option<CompanyInfo>,
    /// Step 2 data. The plugin catalog is filtered by these.
    #[serde(default)]
    pub industries: Vec<String>,
    /// Step 3 data.
    pub plan: Option<PlanSelection>,
    /// Step 4 data: selected plugin keys.
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Extra branches beyond the main one, 0..=9.
    #[serde(default)]
    pub branches: i64,
}

/// Draft fields, for the reset rule table and change reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftField {
    /// `company`.
    Company,
    /// `industries`.
    Industries,
    /// `plan`.
    Plan,
    /// `plugins`.
    Plugins,
    /// `branches`.
    Branches,
}

/// One dependency edge: changing `when_changed` clears every field in
/// `resets`.
struct ResetRule {
    when_changed: DraftField,
    resets: &'static [DraftField],
}

/// The complete "changing X resets Y" dependency graph.
///
/// - The plugin catalog is industry-filtered, so an industry change
///   invalidates the plugin selection.
/// - Plugin eligibility depends on plan tier, so a plan change (including
///   clearing the plan) invalidates it too.
const RESET_RULES: &[ResetRule] = &[
    ResetRule {
        when_changed: DraftField::Industries,
        resets: &[DraftField::Plugins],
    },
    ResetRule {
        when_changed: DraftField::Plan,
        resets: &[DraftField::Plugins],
    },
];

/// A partial draft update as submitted by the client.
///
/// `plan` distinguishes "not submitted" (`None`) from "submitted null"
/// (`Some(None)`, which clears the selection).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DraftUpdate {
    /// New company details.
    pub company: Option<CompanyInfo>,
    /// New industry selection.
    pub industries: Option<Vec<String>>,
    /// New plan selection; `Some(None)` clears it.
    #[serde(default, deserialize_with = "double_option")]
    pub plan: Option<Option<PlanSelection>>,
    /// New plugin selection.
    pub plugins: Option<Vec<String>>,
    /// New extra-branch count.
    pub branches: Option<i64>,
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl DraftUpdate {
    /// Whether the update carries no fields at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.company.is_none()
            && self.industries.is_none()
            && self.plan.is_none()
            && self.plugins.is_none()
            && self.branches.is_none()
    }
}

/// The outcome of merging a [`DraftUpdate`] into a draft.
#[derive(Debug, Clone, Default)]
pub struct AppliedUpdate {
    /// Fields whose value actually changed.
    pub changed: Vec<DraftField>,
    /// Fields cleared by a reset rule.
    pub reset: Vec<DraftField>,
}

/// Draft validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DraftError {
    /// `branches` outside [`BRANCHES_RANGE`]. The draft is not mutated.
    #[error("branches must be between {min} and {max}, got {got}")]
    BranchesOutOfRange {
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
        /// Rejected value.
        got: i64,
    },

    /// A step was advanced without its required data.
    #[error("step {step:?} is missing required data: {missing}")]
    StepIncomplete {
        /// The step that failed validation.
        step: OnboardingStep,
        /// Human-readable description of what is missing.
        missing: &'static str,
    },
}

impl OnboardingDraft {
    /// Merge a partial update into the draft.
    ///
    /// Field-level sanitize-and-reset semantics:
    /// - A submitted field equal to the stored value is a no-op and
    ///   triggers no resets (idempotent resubmission).
    /// - A changed field triggers the [`RESET_RULES`] that name it; a plan
    ///   change means a different `plan.id` or clearing/setting the
    ///   selection (switching only `billing` keeps the plugins).
    /// - Out-of-range `branches` rejects the whole update without mutating
    ///   anything.
    ///
    /// # Errors
    ///
    /// Returns [`DraftError::BranchesOutOfRange`] for an out-of-range
    /// branch count; the draft is left untouched.
    pub fn apply_update(&mut self, update: &DraftUpdate) -> Result<AppliedUpdate, DraftError> {
        // Validate before mutating anything.
        if let Some(branches) = update.branches {
            if !BRANCHES_RANGE.contains(&branches) {
                return Err(DraftError::BranchesOutOfRange {
                    min: *BRANCHES_RANGE.start(),
                    max: *BRANCHES_RANGE.end(),
                    got: branches,
                });
            }
        }

        let mut applied = AppliedUpdate::default();

        if let Some(company) = &update.company {
            if self.company.as_ref() != Some(company) {
                self.company = Some(company.clone());
                applied.changed.push(DraftField::Company);
            }
        }

        if let Some(industries) = &update.industries {
            if &self.industries != industries {
                self.industries.clone_from(industries);
                applied.changed.push(DraftField::Industries);
            }
        }

        if let Some(plan) = update.plan {
            if plan_changed(self.plan.as_ref(), plan.as_ref()) {
                applied.changed.push(DraftField::Plan);
            }
            // Billing cadence switches are recorded without counting as a
            // plan change for reset purposes.
            self.plan = plan;
        }

        if let Some(plugins) = &update.plugins {
            if &self.plugins != plugins {
                self.plugins.clone_from(plugins);
                applied.changed.push(DraftField::Plugins);
            }
        }

        if let Some(branches) = update.branches {
            if self.branches != branches {
                self.branches = branches;
                applied.changed.push(DraftField::Branches);
            }
        }

        // Walk the rule table once, after all merges.
        for rule in RESET_RULES {
            if !applied.changed.contains(&rule.when_changed) {
                continue;
            }
            for &field in rule.resets {
                if self.clear_field(field) && !applied.reset.contains(&field) {
                    applied.reset.push(field);
                }
            }
        }

        Ok(applied)
    }

    /// Clear a field to its empty value. Returns whether it held data.
    fn clear_field(&mut self, field: DraftField) -> bool {
        match field {
            DraftField::Company => self.company.take().is_some(),
            DraftField::Industries => {
                let had = !self.industries.is_empty();
                self.industries.clear();
                had
            }
            DraftField::Plan => self.plan.take().is_some(),
            DraftField::Plugins => {
                let had = !self.plugins.is_empty();
                self.plugins.clear();
                had
            }
            DraftField::Branches => {
                let had = self.branches != 0;
                self.branches = 0;
                had
            }
        }
    }

    /// Validate that the draft carries the data a step requires before the
    /// wizard may advance past it.
    ///
    /// # Errors
    ///
    /// Returns [`DraftError::StepIncomplete`] naming the missing data.
    pub fn validate_step(&self, step: OnboardingStep) -> Result<(), DraftError> {
        match step {
            OnboardingStep::Company => {
                let complete = self
                    .company
                    .as_ref()
                    .is_some_and(|c| !c.name.trim().is_empty());
                if !complete {
                    return Err(DraftError::StepIncomplete {
                        step,
                        missing: "company name",
                    });
                }
            }
            OnboardingStep::Industries => {
                if self.industries.is_empty() {
                    return Err(DraftError::StepIncomplete {
                        step,
                        missing: "at least one industry",
                    });
                }
            }
            OnboardingStep::Plan => {
                if self.plan.is_none() {
                    return Err(DraftError::StepIncomplete {
                        step,
                        missing: "a plan selection",
                    });
                }
            }
            // Plugins may legitimately be empty; finalize is gated by the
            // completion endpoint, not by draft shape.
            OnboardingStep::Plugins | OnboardingStep::Finalize => {}
        }
        Ok(())
    }
}

fn plan_changed(current: Option<&PlanSelection>, submitted: Option<&PlanSelection>) -> bool {
    match (current, submitted) {
        (None, None) => false,
        (Some(c), Some(s)) => c.id != s.id,
        _ => true,
    }
}

/// The per-company onboarding row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingRecord {
    /// Owning company; onboarding is a per-company singleton.
    pub company_id: CompanyId,
    /// The step the wizard is on.
    pub current_step: OnboardingStep,
    /// High-water mark; `current_step <= max_step_reached` always.
    pub max_step_reached: OnboardingStep,
    /// Terminal flag.
    pub is_completed: bool,
    /// The draft document.
    pub data: OnboardingDraft,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl OnboardingRecord {
    /// A fresh record at step 1.
    #[must_use]
    pub fn new(company_id: CompanyId) -> Self {
        Self {
            company_id,
            current_step: OnboardingStep::FIRST,
            max_step_reached: OnboardingStep::FIRST,
            is_completed: false,
            data: OnboardingDraft::default(),
            updated_at: Utc::now(),
        }
    }

    /// Advance to the next step, keeping the monotonic invariants.
    pub fn advance(&mut self) {
        if let Some(next) = self.current_step.next() {
            self.current_step = next;
            if self.max_step_reached < next {
                self.max_step_reached = next;
            }
        }
        self.updated_at = Utc::now();
    }

    /// Step back without touching data. Never goes below step 1.
    pub fn step_back(&mut self) {
        if let Some(prev) = self.current_step.prev() {
            self.current_step = prev;
        }
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(id: PlanId) -> PlanSelection {
        PlanSelection {
            id,
            billing: BillingPeriod::Monthly,
        }
    }

    fn draft_with_plugins() -> OnboardingDraft {
        OnboardingDraft {
            company: Some(CompanyInfo {
                name: "Acme".into(),
                phone: None,
            }),
            industries: vec!["clothing".into()],
            plan: Some(selection(PlanId::generate())),
            plugins: vec!["pattern-cutting".into()],
            branches: 2,
        }
    }

    #[test]
    fn changing_industries_clears_plugins() {
        let mut draft = draft_with_plugins();
        let applied = draft
            .apply_update(&DraftUpdate {
                industries: Some(vec!["construction".into()]),
                ..DraftUpdate::default()
            })
            .unwrap();

        assert!(draft.plugins.is_empty());
        assert_eq!(applied.changed, vec![DraftField::Industries]);
        assert_eq!(applied.reset, vec![DraftField::Plugins]);
    }

    #[test]
    fn changing_plan_id_clears_plugins() {
        let mut draft = draft_with_plugins();
        let applied = draft
            .apply_update(&DraftUpdate {
                plan: Some(Some(selection(PlanId::generate()))),
                ..DraftUpdate::default()
            })
            .unwrap();

        assert!(draft.plugins.is_empty());
        assert_eq!(applied.changed, vec![DraftField::Plan]);
    }

    #[test]
    fn clearing_plan_clears_plugins() {
        let mut draft = draft_with_plugins();
        draft
            .apply_update(&DraftUpdate {
                plan: Some(None),
                ..DraftUpdate::default()
            })
            .unwrap();

        assert!(draft.plan.is_none());
        assert!(draft.plugins.is_empty());
    }

    #[test]
    fn unchanged_resubmission_resets_nothing() {
        let mut draft = draft_with_plugins();
        let industries = draft.industries.clone();
        let plan = draft.plan;

        let applied = draft
            .apply_update(&DraftUpdate {
                industries: Some(industries),
                plan: Some(plan),
                ..DraftUpdate::default()
            })
            .unwrap();

        assert!(applied.changed.is_empty());
        assert!(applied.reset.is_empty());
        assert_eq!(draft.plugins, vec!["pattern-cutting".to_string()]);
    }

    #[test]
    fn billing_switch_alone_keeps_plugins() {
        let mut draft = draft_with_plugins();
        let mut switched = draft.plan.unwrap();
        switched.billing = BillingPeriod::Yearly;

        let applied = draft
            .apply_update(&DraftUpdate {
                plan: Some(Some(switched)),
                ..DraftUpdate::default()
            })
            .unwrap();

        assert!(applied.changed.is_empty());
        assert_eq!(draft.plan.unwrap().billing, BillingPeriod::Yearly);
        assert_eq!(draft.plugins, vec!["pattern-cutting".to_string()]);
    }

    #[test]
    fn plugins_cleared_once_per_changing_field() {
        let mut draft = draft_with_plugins();

        // Industries change clears once.
        let first = draft
            .apply_update(&DraftUpdate {
                industries: Some(vec!["construction".into()]),
                ..DraftUpdate::default()
            })
            .unwrap();
        assert_eq!(first.reset, vec![DraftField::Plugins]);

        // Plan change right after: plugins are already empty, nothing to
        // report as reset again.
        let second = draft
            .apply_update(&DraftUpdate {
                plan: Some(Some(selection(PlanId::generate()))),
                ..DraftUpdate::default()
            })
            .unwrap();
        assert_eq!(second.changed, vec![DraftField::Plan]);
        assert!(second.reset.is_empty());
    }

    #[test]
    fn out_of_range_branches_rejected_without_mutation() {
        let mut draft = draft_with_plugins();
        let before = draft.clone();

        let err = draft
            .apply_update(&DraftUpdate {
                branches: Some(12),
                industries: Some(vec!["construction".into()]),
                ..DraftUpdate::default()
            })
            .unwrap_err();

        assert!(matches!(err, DraftError::BranchesOutOfRange { got: 12, .. }));
        assert_eq!(draft, before);

        let err = draft
            .apply_update(&DraftUpdate {
                branches: Some(-1),
                ..DraftUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, DraftError::BranchesOutOfRange { got: -1, .. }));
        assert_eq!(draft, before);
    }

    #[test]
    fn step_validation() {
        let empty = OnboardingDraft::default();
        assert!(empty.validate_step(OnboardingStep::Company).is_err());
        assert!(empty.validate_step(OnboardingStep::Industries).is_err());
        assert!(empty.validate_step(OnboardingStep::Plan).is_err());
        assert!(empty.validate_step(OnboardingStep::Plugins).is_ok());

        let full = draft_with_plugins();
        for step in [
            OnboardingStep::Company,
            OnboardingStep::Industries,
            OnboardingStep::Plan,
            OnboardingStep::Plugins,
            OnboardingStep::Finalize,
        ] {
            assert!(full.validate_step(step).is_ok());
        }
    }

    #[test]
    fn record_advance_is_monotonic() {
        let mut record = OnboardingRecord::new(CompanyId::generate());
        assert_eq!(record.current_step, OnboardingStep::Company);

        record.advance();
        record.advance();
        assert_eq!(record.current_step, OnboardingStep::Plan);
        assert_eq!(record.max_step_reached, OnboardingStep::Plan);

        record.step_back();
        assert_eq!(record.current_step, OnboardingStep::Industries);
        // High-water mark survives going back.
        assert_eq!(record.max_step_reached, OnboardingStep::Plan);

        record.step_back();
        record.step_back();
        record.step_back();
        assert_eq!(record.current_step, OnboardingStep::Company);
    }

    #[test]
    fn advance_stops_at_last_step() {
        let mut record = OnboardingRecord::new(CompanyId::generate());
        for _ in 0..10 {
            record.advance();
        }
        assert_eq!(record.current_step, OnboardingStep::Finalize);
        assert_eq!(record.max_step_reached, OnboardingStep::Finalize);
    }

    #[test]
    fn step_numbers_roundtrip() {
        for n in 1..=5u8 {
            assert_eq!(OnboardingStep::from_number(n).unwrap().number(), n);
        }
        assert!(OnboardingStep::from_number(0).is_none());
        assert!(OnboardingStep::from_number(6).is_none());
    }

    #[test]
    fn draft_update_null_plan_deserializes_as_clear() {
        let update: DraftUpdate = serde_json::from_str(r#"{"plan": null}"#).unwrap();
        assert_eq!(update.plan, Some(None));

        let update: DraftUpdate = serde_json::from_str("{}").unwrap();
        assert!(update.plan.is_none());
        assert!(update.is_empty());
    }
}
