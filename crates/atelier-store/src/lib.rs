//! Storage layer for the atelier platform.
//!
//! All durable state lives in a relational store behind the [`Store`]
//! trait: [`PgStore`] is the PostgreSQL production backend, [`MemStore`] an
//! in-memory implementation used by integration tests.
//!
//! Multi-table writes with invariants (company bootstrap, onboarding
//! completion, invitation acceptance) are single store operations so each
//! backend can make them atomic: a transaction in Postgres, one locked
//! mutation in memory. Refresh-token rotation is a conditional update
//! keyed on the old token hash so concurrent rotations have exactly one
//! winner.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod mem;
pub mod pg;

pub use error::{Result, StoreError};
pub use mem::MemStore;
pub use pg::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use atelier_core::{
    Branch, BranchId, BillingStatus, Company, CompanyId, Invitation, Membership, OnboardingRecord,
    PaymentRecord, Plan, PlanId, Plugin, PluginId, PriceInterval, Session, SessionId,
    Subscription, SubscriptionId, SubscriptionItem, User, UserId, VerificationCode,
    VerificationPurpose,
};

/// Input for creating a user row.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Login email; unique.
    pub email: String,
    /// Argon2id password hash.
    pub password_hash: String,
    /// Whether the email was verified (OTP consumed) at signup.
    pub verified: bool,
}

/// Everything created when a company is bootstrapped: the company, the
/// owner membership and the fresh onboarding row.
#[derive(Debug, Clone)]
pub struct CompanyBootstrap {
    /// The created company.
    pub company: Company,
    /// The owner membership.
    pub membership: Membership,
    /// The onboarding row at step 1.
    pub onboarding: OnboardingRecord,
}

/// Webhook-driven reconciliation payload for a subscription row.
#[derive(Debug, Clone)]
pub struct SubscriptionReconciliation {
    /// New billing status; applied only if the transition guard allows it.
    pub status: BillingStatus,
    /// New period start, if delivered.
    pub current_period_start: Option<DateTime<Utc>>,
    /// New period end, if delivered.
    pub current_period_end: Option<DateTime<Utc>>,
    /// New cancel-at-period-end flag, if delivered.
    pub cancel_at_period_end: Option<bool>,
}

/// Input for the atomic onboarding completion.
#[derive(Debug, Clone)]
pub struct CompleteOnboarding {
    /// The company completing onboarding.
    pub company_id: CompanyId,
    /// Name of the main branch (the company name).
    pub main_branch_name: String,
    /// Extra branches to provision beyond the main one.
    pub extra_branches: i64,
    /// Plugins to link to the company and its main branch.
    pub plugin_ids: Vec<PluginId>,
    /// Subscription row to insert on the free path; `None` when a paid
    /// subscription was already recorded by `confirm-and-subscribe`.
    pub subscription: Option<(Subscription, Vec<SubscriptionItem>)>,
}

/// The storage trait defining all database operations.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Users
    // =========================================================================

    /// Create a user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the email is taken.
    async fn create_user(&self, user: NewUser) -> Result<User>;

    /// Look up a user by email.
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Look up a user by id.
    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    // =========================================================================
    // Verification codes
    // =========================================================================

    /// Insert or replace the code for (email, purpose).
    async fn put_verification_code(&self, code: &VerificationCode) -> Result<()>;

    /// Fetch the code for (email, purpose).
    async fn get_verification_code(
        &self,
        email: &str,
        purpose: VerificationPurpose,
    ) -> Result<Option<VerificationCode>>;

    /// Record a failed attempt. Returns the new attempt count.
    async fn increment_code_attempts(
        &self,
        email: &str,
        purpose: VerificationPurpose,
    ) -> Result<i32>;

    /// Remove the code (after successful consumption).
    async fn delete_verification_code(
        &self,
        email: &str,
        purpose: VerificationPurpose,
    ) -> Result<()>;

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Login-time session upsert for (user, fingerprint): the existing row
    /// is rotated in place, stray non-revoked duplicates for the same
    /// fingerprint are revoked, other fingerprints are untouched.
    async fn upsert_login_session(&self, session: Session) -> Result<Session>;

    /// Most recent session for a device fingerprint, regardless of state.
    async fn find_session_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Session>>;

    /// Single-use rotation: swap the token hash only if the stored hash
    /// still equals `old_hash` and the session is not revoked. Returns
    /// whether this call won the rotation.
    async fn rotate_session(
        &self,
        id: SessionId,
        old_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Revoke one session.
    async fn revoke_session(&self, id: SessionId) -> Result<()>;

    /// Revoke every session of a user. Returns how many were revoked.
    async fn revoke_all_sessions_for_user(&self, user_id: UserId) -> Result<u64>;

    /// Update `last_activity_at`. Fire-and-forget on the caller side.
    async fn touch_session_activity(&self, id: SessionId) -> Result<()>;

    // =========================================================================
    // Companies and memberships
    // =========================================================================

    /// Atomically create a company, its owner membership and the step-1
    /// onboarding row.
    async fn create_company_with_owner(
        &self,
        owner: UserId,
        name: &str,
        phone: Option<&str>,
    ) -> Result<CompanyBootstrap>;

    /// Look up a company.
    async fn get_company(&self, id: CompanyId) -> Result<Option<Company>>;

    /// Attach a Stripe customer id to a company.
    async fn set_company_stripe_customer(
        &self,
        id: CompanyId,
        stripe_customer_id: &str,
    ) -> Result<()>;

    /// Membership of a user in a company.
    async fn get_membership(
        &self,
        user_id: UserId,
        company_id: CompanyId,
    ) -> Result<Option<Membership>>;

    /// All memberships of a user with their companies.
    async fn list_memberships_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<(Membership, Company)>>;

    /// The owner user of a company, for billing notifications.
    async fn get_company_owner(&self, company_id: CompanyId) -> Result<Option<User>>;

    // =========================================================================
    // Branches
    // =========================================================================

    /// Branches of a company.
    async fn list_branches(&self, company_id: CompanyId) -> Result<Vec<Branch>>;

    /// Look up a branch.
    async fn get_branch(&self, id: BranchId) -> Result<Option<Branch>>;

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Insert or replace a plan row.
    async fn upsert_plan(&self, plan: &Plan) -> Result<()>;

    /// All plans.
    async fn list_plans(&self) -> Result<Vec<Plan>>;

    /// Look up a plan.
    async fn get_plan(&self, id: PlanId) -> Result<Option<Plan>>;

    /// Insert or replace a plugin row.
    async fn upsert_plugin(&self, plugin: &Plugin) -> Result<()>;

    /// All plugins.
    async fn list_plugins(&self) -> Result<Vec<Plugin>>;

    /// Plugins by catalog key. Missing keys are silently absent; the
    /// caller decides whether that is an error.
    async fn get_plugins_by_keys(&self, keys: &[String]) -> Result<Vec<Plugin>>;

    /// Price-cache sync: update whichever plan/plugin price field matches
    /// the Stripe price id. Returns whether any row changed.
    async fn update_cached_price(
        &self,
        stripe_price_id: &str,
        interval: PriceInterval,
        amount_cents: i64,
    ) -> Result<bool>;

    // =========================================================================
    // Onboarding
    // =========================================================================

    /// The onboarding row for a company.
    async fn get_onboarding(&self, company_id: CompanyId) -> Result<Option<OnboardingRecord>>;

    /// Persist step counters and draft for an existing row.
    async fn save_onboarding(&self, record: &OnboardingRecord) -> Result<()>;

    /// Atomically provision branches, plugin links and (on the free path)
    /// the subscription row, then mark onboarding completed. Returns the
    /// created branches.
    async fn complete_onboarding(&self, req: CompleteOnboarding) -> Result<Vec<Branch>>;

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Record a subscription with its items. An existing `pending` row for
    /// the company is replaced (re-confirmation); any other live row is a
    /// conflict.
    async fn create_subscription(
        &self,
        subscription: &Subscription,
        items: &[SubscriptionItem],
    ) -> Result<()>;

    /// The subscription row of a company, if any.
    async fn get_subscription_for_company(
        &self,
        company_id: CompanyId,
    ) -> Result<Option<Subscription>>;

    /// Look up by Stripe subscription id.
    async fn get_subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>>;

    /// Items of a subscription.
    async fn list_subscription_items(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<SubscriptionItem>>;

    /// Webhook reconciliation keyed by Stripe subscription id. The status
    /// transition guard is applied inside; period bounds and cancellation
    /// flags are always taken. Returns whether a row matched.
    async fn reconcile_subscription(
        &self,
        stripe_subscription_id: &str,
        update: SubscriptionReconciliation,
    ) -> Result<bool>;

    // =========================================================================
    // Payment ledger
    // =========================================================================

    /// Upsert by `stripe_invoice_id`. Returns `true` when the row was
    /// newly inserted (first delivery), `false` on redelivery.
    async fn upsert_payment(&self, payment: &PaymentRecord) -> Result<bool>;

    /// Ledger entries of a company, newest first.
    async fn list_payments_for_company(
        &self,
        company_id: CompanyId,
    ) -> Result<Vec<PaymentRecord>>;

    // =========================================================================
    // Invitations
    // =========================================================================

    /// Store an invitation.
    async fn create_invitation(&self, invitation: &Invitation) -> Result<()>;

    /// Look up an invitation by token hash.
    async fn get_invitation_by_token_hash(&self, token_hash: &str) -> Result<Option<Invitation>>;

    /// Accept an invitation: marks it accepted and creates the membership,
    /// atomically.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown token,
    /// [`StoreError::Conflict`] when the invitation is not pending, is
    /// expired, or the user is already a member.
    async fn accept_invitation(&self, token_hash: &str, user_id: UserId) -> Result<Membership>;
}
