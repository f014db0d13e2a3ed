//! Core domain types for the atelier platform.
//!
//! This crate holds the pure domain model shared by the storage layer, the
//! HTTP service and the client SDK:
//!
//! - Strongly-typed identifiers
//! - Tenancy types (users, companies, memberships, branches)
//! - The plan/plugin catalog with cached Stripe price snapshots
//! - The onboarding draft and its step machine
//! - Price preview math
//! - Subscription and payment ledger types
//! - The stable error-code taxonomy used in API envelopes

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod billing;
pub mod catalog;
pub mod company;
pub mod error;
pub mod ids;
pub mod onboarding;
pub mod pricing;
pub mod user;

pub use billing::{
    BillingStatus, PaymentRecord, PaymentStatus, Subscription, SubscriptionItem,
    SubscriptionItemKind,
};
pub use catalog::{BillingPeriod, Plan, PlanTier, Plugin, PriceInterval, PriceSnapshot};
pub use company::{Branch, Company};
pub use error::ErrorCode;
pub use ids::{
    BranchId, CompanyId, InvitationId, MembershipId, PaymentId, PlanId, PluginId, SessionId,
    SubscriptionId, UserId,
};
pub use onboarding::{
    AppliedUpdate, CompanyInfo, DraftError, DraftField, DraftUpdate, OnboardingDraft,
    OnboardingRecord, OnboardingStep, PlanSelection,
};
pub use pricing::{compute_preview, LineKind, PreviewLine, PricePreview, VAT_RATE_PERCENT};
pub use user::{Invitation, InvitationStatus, Membership, MembershipStatus, Role, Session, User,
    VerificationCode, VerificationPurpose};
