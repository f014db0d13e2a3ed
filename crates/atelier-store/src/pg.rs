//! PostgreSQL [`Store`] implementation backed by sqlx.
//!
//! Multi-table invariants (company bootstrap, onboarding completion,
//! invitation acceptance) run inside transactions. Refresh rotation is a
//! conditional `UPDATE` keyed on the stored token hash, so concurrent
//! rotations resolve to exactly one winner at the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use atelier_core::{
    BillingPeriod, BillingStatus, Branch, BranchId, Company, CompanyId, Invitation, InvitationId,
    InvitationStatus, Membership, MembershipId, MembershipStatus, OnboardingDraft,
    OnboardingRecord, OnboardingStep, PaymentId, PaymentRecord, PaymentStatus, Plan, PlanId,
    PlanTier, Plugin, PluginId, PriceInterval, PriceSnapshot, Role, Session, SessionId,
    Subscription, SubscriptionId, SubscriptionItem, SubscriptionItemKind, User, UserId,
    VerificationCode, VerificationPurpose,
};
use atelier_core::catalog::StripePriceIds;

use crate::error::{Result, StoreError};
use crate::{CompanyBootstrap, CompleteOnboarding, NewUser, Store, SubscriptionReconciliation};

/// PostgreSQL store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Row types and enum encoding
// ============================================================================

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    password_hash: String,
    verified: bool,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        Self {
            id: UserId::from_uuid(r.id),
            email: r.email,
            password_hash: r.password_hash,
            verified: r.verified,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CodeRow {
    email: String,
    purpose: String,
    code_hash: String,
    attempts: i32,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<CodeRow> for VerificationCode {
    type Error = StoreError;

    fn try_from(r: CodeRow) -> Result<Self> {
        Ok(Self {
            email: r.email,
            purpose: parse_purpose(&r.purpose)?,
            code_hash: r.code_hash,
            attempts: r.attempts,
            expires_at: r.expires_at,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    fingerprint: String,
    refresh_token_hash: String,
    revoked: bool,
    expires_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(r: SessionRow) -> Self {
        Self {
            id: SessionId::from_uuid(r.id),
            user_id: UserId::from_uuid(r.user_id),
            fingerprint: r.fingerprint,
            refresh_token_hash: r.refresh_token_hash,
            revoked: r.revoked,
            expires_at: r.expires_at,
            last_activity_at: r.last_activity_at,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CompanyRow {
    id: Uuid,
    name: String,
    phone: Option<String>,
    stripe_customer_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<CompanyRow> for Company {
    fn from(r: CompanyRow) -> Self {
        Self {
            id: CompanyId::from_uuid(r.id),
            name: r.name,
            phone: r.phone,
            stripe_customer_id: r.stripe_customer_id,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MembershipRow {
    id: Uuid,
    user_id: Uuid,
    company_id: Uuid,
    role: String,
    permissions: serde_json::Value,
    is_owner: bool,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MembershipRow> for Membership {
    type Error = StoreError;

    fn try_from(r: MembershipRow) -> Result<Self> {
        Ok(Self {
            id: MembershipId::from_uuid(r.id),
            user_id: UserId::from_uuid(r.user_id),
            company_id: CompanyId::from_uuid(r.company_id),
            role: parse_role(&r.role)?,
            permissions: serde_json::from_value(r.permissions)?,
            is_owner: r.is_owner,
            status: parse_membership_status(&r.status)?,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BranchRow {
    id: Uuid,
    company_id: Uuid,
    name: String,
    is_main: bool,
    created_at: DateTime<Utc>,
}

impl From<BranchRow> for Branch {
    fn from(r: BranchRow) -> Self {
        Self {
            id: BranchId::from_uuid(r.id),
            company_id: CompanyId::from_uuid(r.company_id),
            name: r.name,
            is_main: r.is_main,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    key: String,
    name: String,
    tier: String,
    currency: String,
    base_monthly_cents: i64,
    base_yearly_cents: i64,
    extra_branch_monthly_cents: i64,
    extra_branch_yearly_cents: i64,
    stripe_base_monthly_price_id: Option<String>,
    stripe_base_yearly_price_id: Option<String>,
    stripe_extra_branch_monthly_price_id: Option<String>,
    stripe_extra_branch_yearly_price_id: Option<String>,
    prices_synced_at: Option<DateTime<Utc>>,
}

impl TryFrom<PlanRow> for Plan {
    type Error = StoreError;

    fn try_from(r: PlanRow) -> Result<Self> {
        Ok(Self {
            id: PlanId::from_uuid(r.id),
            key: r.key,
            name: r.name,
            tier: parse_tier(&r.tier)?,
            base_price: PriceSnapshot {
                monthly_cents: r.base_monthly_cents,
                yearly_cents: r.base_yearly_cents,
                currency: r.currency.clone(),
            },
            extra_branch_price: PriceSnapshot {
                monthly_cents: r.extra_branch_monthly_cents,
                yearly_cents: r.extra_branch_yearly_cents,
                currency: r.currency,
            },
            base_price_ids: StripePriceIds {
                monthly: r.stripe_base_monthly_price_id,
                yearly: r.stripe_base_yearly_price_id,
            },
            extra_branch_price_ids: StripePriceIds {
                monthly: r.stripe_extra_branch_monthly_price_id,
                yearly: r.stripe_extra_branch_yearly_price_id,
            },
            prices_synced_at: r.prices_synced_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PluginRow {
    id: Uuid,
    key: String,
    name: String,
    industries: serde_json::Value,
    min_tier: String,
    currency: String,
    monthly_cents: i64,
    yearly_cents: i64,
    stripe_monthly_price_id: Option<String>,
    stripe_yearly_price_id: Option<String>,
    prices_synced_at: Option<DateTime<Utc>>,
}

impl TryFrom<PluginRow> for Plugin {
    type Error = StoreError;

    fn try_from(r: PluginRow) -> Result<Self> {
        Ok(Self {
            id: PluginId::from_uuid(r.id),
            key: r.key,
            name: r.name,
            industries: serde_json::from_value(r.industries)?,
            min_tier: parse_tier(&r.min_tier)?,
            price: PriceSnapshot {
                monthly_cents: r.monthly_cents,
                yearly_cents: r.yearly_cents,
                currency: r.currency,
            },
            price_ids: StripePriceIds {
                monthly: r.stripe_monthly_price_id,
                yearly: r.stripe_yearly_price_id,
            },
            prices_synced_at: r.prices_synced_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OnboardingRow {
    company_id: Uuid,
    current_step: i16,
    max_step_reached: i16,
    is_completed: bool,
    data: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OnboardingRow> for OnboardingRecord {
    type Error = StoreError;

    fn try_from(r: OnboardingRow) -> Result<Self> {
        let data: OnboardingDraft = serde_json::from_value(r.data)?;
        Ok(Self {
            company_id: CompanyId::from_uuid(r.company_id),
            current_step: parse_step(r.current_step)?,
            max_step_reached: parse_step(r.max_step_reached)?,
            is_completed: r.is_completed,
            data,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    company_id: Uuid,
    plan_id: Uuid,
    stripe_subscription_id: Option<String>,
    billing_period: String,
    billing_status: String,
    current_period_start: Option<DateTime<Utc>>,
    current_period_end: Option<DateTime<Utc>>,
    cancel_at_period_end: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(r: SubscriptionRow) -> Result<Self> {
        Ok(Self {
            id: SubscriptionId::from_uuid(r.id),
            company_id: CompanyId::from_uuid(r.company_id),
            plan_id: PlanId::from_uuid(r.plan_id),
            stripe_subscription_id: r.stripe_subscription_id,
            billing_period: parse_billing_period(&r.billing_period)?,
            billing_status: parse_billing_status(&r.billing_status)?,
            current_period_start: r.current_period_start,
            current_period_end: r.current_period_end,
            cancel_at_period_end: r.cancel_at_period_end,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionItemRow {
    subscription_id: Uuid,
    kind: String,
    reference_key: String,
    stripe_item_id: Option<String>,
    quantity: i64,
    unit_amount_cents: i64,
}

impl TryFrom<SubscriptionItemRow> for SubscriptionItem {
    type Error = StoreError;

    fn try_from(r: SubscriptionItemRow) -> Result<Self> {
        Ok(Self {
            subscription_id: SubscriptionId::from_uuid(r.subscription_id),
            kind: parse_item_kind(&r.kind)?,
            reference_key: r.reference_key,
            stripe_item_id: r.stripe_item_id,
            quantity: r.quantity,
            unit_amount_cents: r.unit_amount_cents,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: String,
    company_id: Uuid,
    stripe_invoice_id: String,
    amount_cents: i64,
    currency: String,
    status: String,
    billing_reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = StoreError;

    fn try_from(r: PaymentRow) -> Result<Self> {
        Ok(Self {
            id: r
                .id
                .parse::<PaymentId>()
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            company_id: CompanyId::from_uuid(r.company_id),
            stripe_invoice_id: r.stripe_invoice_id,
            amount_cents: r.amount_cents,
            currency: r.currency,
            status: parse_payment_status(&r.status)?,
            billing_reason: r.billing_reason,
            created_at: r.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvitationRow {
    id: Uuid,
    company_id: Uuid,
    email: String,
    role: String,
    token_hash: String,
    status: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<InvitationRow> for Invitation {
    type Error = StoreError;

    fn try_from(r: InvitationRow) -> Result<Self> {
        Ok(Self {
            id: InvitationId::from_uuid(r.id),
            company_id: CompanyId::from_uuid(r.company_id),
            email: r.email,
            role: parse_role(&r.role)?,
            token_hash: r.token_hash,
            status: parse_invitation_status(&r.status)?,
            expires_at: r.expires_at,
            created_at: r.created_at,
        })
    }
}

fn parse_role(s: &str) -> Result<Role> {
    match s {
        "owner" => Ok(Role::Owner),
        "admin" => Ok(Role::Admin),
        "member" => Ok(Role::Member),
        other => Err(StoreError::Serialization(format!("unknown role: {other}"))),
    }
}

fn parse_membership_status(s: &str) -> Result<MembershipStatus> {
    match s {
        "active" => Ok(MembershipStatus::Active),
        "pending" => Ok(MembershipStatus::Pending),
        "disabled" => Ok(MembershipStatus::Disabled),
        other => Err(StoreError::Serialization(format!(
            "unknown membership status: {other}"
        ))),
    }
}

fn membership_status_str(status: MembershipStatus) -> &'static str {
    match status {
        MembershipStatus::Active => "active",
        MembershipStatus::Pending => "pending",
        MembershipStatus::Disabled => "disabled",
    }
}

fn parse_tier(s: &str) -> Result<PlanTier> {
    match s {
        "free" => Ok(PlanTier::Free),
        "standard" => Ok(PlanTier::Standard),
        "pro" => Ok(PlanTier::Pro),
        other => Err(StoreError::Serialization(format!("unknown tier: {other}"))),
    }
}

fn tier_str(tier: PlanTier) -> &'static str {
    match tier {
        PlanTier::Free => "free",
        PlanTier::Standard => "standard",
        PlanTier::Pro => "pro",
    }
}

fn parse_billing_period(s: &str) -> Result<BillingPeriod> {
    match s {
        "monthly" => Ok(BillingPeriod::Monthly),
        "yearly" => Ok(BillingPeriod::Yearly),
        other => Err(StoreError::Serialization(format!(
            "unknown billing period: {other}"
        ))),
    }
}

fn parse_billing_status(s: &str) -> Result<BillingStatus> {
    match s {
        "pending" => Ok(BillingStatus::Pending),
        "active" => Ok(BillingStatus::Active),
        "past_due" => Ok(BillingStatus::PastDue),
        "canceled" => Ok(BillingStatus::Canceled),
        other => Err(StoreError::Serialization(format!(
            "unknown billing status: {other}"
        ))),
    }
}

fn parse_payment_status(s: &str) -> Result<PaymentStatus> {
    match s {
        "paid" => Ok(PaymentStatus::Paid),
        "failed" => Ok(PaymentStatus::Failed),
        other => Err(StoreError::Serialization(format!(
            "unknown payment status: {other}"
        ))),
    }
}

fn payment_status_str(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Paid => "paid",
        PaymentStatus::Failed => "failed",
    }
}

fn parse_invitation_status(s: &str) -> Result<InvitationStatus> {
    match s {
        "pending" => Ok(InvitationStatus::Pending),
        "accepted" => Ok(InvitationStatus::Accepted),
        "revoked" => Ok(InvitationStatus::Revoked),
        other => Err(StoreError::Serialization(format!(
            "unknown invitation status: {other}"
        ))),
    }
}

fn invitation_status_str(status: InvitationStatus) -> &'static str {
    match status {
        InvitationStatus::Pending => "pending",
        InvitationStatus::Accepted => "accepted",
        InvitationStatus::Revoked => "revoked",
    }
}

fn parse_item_kind(s: &str) -> Result<SubscriptionItemKind> {
    match s {
        "plan_base" => Ok(SubscriptionItemKind::PlanBase),
        "extra_branch" => Ok(SubscriptionItemKind::ExtraBranch),
        "plugin" => Ok(SubscriptionItemKind::Plugin),
        other => Err(StoreError::Serialization(format!(
            "unknown item kind: {other}"
        ))),
    }
}

fn item_kind_str(kind: SubscriptionItemKind) -> &'static str {
    match kind {
        SubscriptionItemKind::PlanBase => "plan_base",
        SubscriptionItemKind::ExtraBranch => "extra_branch",
        SubscriptionItemKind::Plugin => "plugin",
    }
}

fn parse_purpose(s: &str) -> Result<VerificationPurpose> {
    match s {
        "signup" => Ok(VerificationPurpose::Signup),
        other => Err(StoreError::Serialization(format!(
            "unknown verification purpose: {other}"
        ))),
    }
}

fn parse_step(n: i16) -> Result<OnboardingStep> {
    u8::try_from(n)
        .ok()
        .and_then(OnboardingStep::from_number)
        .ok_or_else(|| StoreError::Serialization(format!("invalid onboarding step: {n}")))
}

async fn insert_subscription_tx(
    tx: &mut Transaction<'_, Postgres>,
    subscription: &Subscription,
    items: &[SubscriptionItem],
) -> Result<()> {
    sqlx::query(
        "INSERT INTO subscriptions \
         (id, company_id, plan_id, stripe_subscription_id, billing_period, billing_status, \
          current_period_start, current_period_end, cancel_at_period_end, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(subscription.id.as_uuid())
    .bind(subscription.company_id.as_uuid())
    .bind(subscription.plan_id.as_uuid())
    .bind(&subscription.stripe_subscription_id)
    .bind(subscription.billing_period.as_str())
    .bind(subscription.billing_status.as_str())
    .bind(subscription.current_period_start)
    .bind(subscription.current_period_end)
    .bind(subscription.cancel_at_period_end)
    .bind(subscription.created_at)
    .bind(subscription.updated_at)
    .execute(&mut **tx)
    .await?;

    for item in items {
        sqlx::query(
            "INSERT INTO subscription_items \
             (subscription_id, kind, reference_key, stripe_item_id, quantity, unit_amount_cents) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(item.subscription_id.as_uuid())
        .bind(item_kind_str(item.kind))
        .bind(&item.reference_key)
        .bind(&item.stripe_item_id)
        .bind(item.quantity)
        .bind(item.unit_amount_cents)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn create_user(&self, user: NewUser) -> Result<User> {
        let id = Uuid::new_v4();
        let row = sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (id, email, password_hash, verified) \
             VALUES ($1, lower($2), $3, $4) \
             RETURNING id, email, password_hash, verified, created_at",
        )
        .bind(id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.verified)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return StoreError::conflict("user", "email already registered");
                }
            }
            StoreError::from(e)
        })?;
        Ok(row.into())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, password_hash, verified, created_at \
             FROM users WHERE email = lower($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, password_hash, verified, created_at FROM users WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn put_verification_code(&self, code: &VerificationCode) -> Result<()> {
        sqlx::query(
            "INSERT INTO verification_codes (email, purpose, code_hash, attempts, expires_at, created_at) \
             VALUES (lower($1), $2, $3, $4, $5, $6) \
             ON CONFLICT (email, purpose) DO UPDATE \
             SET code_hash = EXCLUDED.code_hash, attempts = EXCLUDED.attempts, \
                 expires_at = EXCLUDED.expires_at, created_at = EXCLUDED.created_at",
        )
        .bind(&code.email)
        .bind(code.purpose.as_str())
        .bind(&code.code_hash)
        .bind(code.attempts)
        .bind(code.expires_at)
        .bind(code.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_verification_code(
        &self,
        email: &str,
        purpose: VerificationPurpose,
    ) -> Result<Option<VerificationCode>> {
        let row = sqlx::query_as::<_, CodeRow>(
            "SELECT email, purpose, code_hash, attempts, expires_at, created_at \
             FROM verification_codes WHERE email = lower($1) AND purpose = $2",
        )
        .bind(email)
        .bind(purpose.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn increment_code_attempts(
        &self,
        email: &str,
        purpose: VerificationPurpose,
    ) -> Result<i32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            "UPDATE verification_codes SET attempts = attempts + 1 \
             WHERE email = lower($1) AND purpose = $2 RETURNING attempts",
        )
        .bind(email)
        .bind(purpose.as_str())
        .fetch_optional(&self.pool)
        .await?;
        attempts.ok_or(StoreError::not_found("verification_code"))
    }

    async fn delete_verification_code(
        &self,
        email: &str,
        purpose: VerificationPurpose,
    ) -> Result<()> {
        sqlx::query("DELETE FROM verification_codes WHERE email = lower($1) AND purpose = $2")
            .bind(email)
            .bind(purpose.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_login_session(&self, session: Session) -> Result<Session> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, SessionRow>(
            "SELECT id, user_id, fingerprint, refresh_token_hash, revoked, expires_at, \
                    last_activity_at, created_at \
             FROM user_sessions \
             WHERE user_id = $1 AND fingerprint = $2 AND revoked = false \
             ORDER BY created_at DESC \
             FOR UPDATE",
        )
        .bind(session.user_id.as_uuid())
        .bind(&session.fingerprint)
        .fetch_all(&mut *tx)
        .await?;

        let result = if let Some(keep) = existing.first() {
            // Revoke stray duplicates, rotate the newest row in place.
            sqlx::query(
                "UPDATE user_sessions SET revoked = true \
                 WHERE user_id = $1 AND fingerprint = $2 AND revoked = false AND id <> $3",
            )
            .bind(session.user_id.as_uuid())
            .bind(&session.fingerprint)
            .bind(keep.id)
            .execute(&mut *tx)
            .await?;

            let row = sqlx::query_as::<_, SessionRow>(
                "UPDATE user_sessions \
                 SET refresh_token_hash = $2, expires_at = $3, last_activity_at = now() \
                 WHERE id = $1 \
                 RETURNING id, user_id, fingerprint, refresh_token_hash, revoked, expires_at, \
                           last_activity_at, created_at",
            )
            .bind(keep.id)
            .bind(&session.refresh_token_hash)
            .bind(session.expires_at)
            .fetch_one(&mut *tx)
            .await?;
            row.into()
        } else {
            sqlx::query(
                "INSERT INTO user_sessions \
                 (id, user_id, fingerprint, refresh_token_hash, revoked, expires_at, \
                  last_activity_at, created_at) \
                 VALUES ($1, $2, $3, $4, false, $5, $6, $7)",
            )
            .bind(session.id.as_uuid())
            .bind(session.user_id.as_uuid())
            .bind(&session.fingerprint)
            .bind(&session.refresh_token_hash)
            .bind(session.expires_at)
            .bind(session.last_activity_at)
            .bind(session.created_at)
            .execute(&mut *tx)
            .await?;
            session
        };

        tx.commit().await?;
        Ok(result)
    }

    async fn find_session_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, user_id, fingerprint, refresh_token_hash, revoked, expires_at, \
                    last_activity_at, created_at \
             FROM user_sessions WHERE fingerprint = $1 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn rotate_session(
        &self,
        id: SessionId,
        old_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE user_sessions \
             SET refresh_token_hash = $3, expires_at = $4, last_activity_at = now() \
             WHERE id = $1 AND refresh_token_hash = $2 AND revoked = false",
        )
        .bind(id.as_uuid())
        .bind(old_hash)
        .bind(new_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_session(&self, id: SessionId) -> Result<()> {
        sqlx::query("UPDATE user_sessions SET revoked = true WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke_all_sessions_for_user(&self, user_id: UserId) -> Result<u64> {
        let result =
            sqlx::query("UPDATE user_sessions SET revoked = true WHERE user_id = $1 AND revoked = false")
                .bind(user_id.as_uuid())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn touch_session_activity(&self, id: SessionId) -> Result<()> {
        sqlx::query("UPDATE user_sessions SET last_activity_at = now() WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_company_with_owner(
        &self,
        owner: UserId,
        name: &str,
        phone: Option<&str>,
    ) -> Result<CompanyBootstrap> {
        let company = Company::new(name, phone.map(ToString::to_string));
        let membership = Membership::owner(owner, company.id);
        let onboarding = OnboardingRecord::new(company.id);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO companies (id, name, phone, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(company.id.as_uuid())
        .bind(&company.name)
        .bind(&company.phone)
        .bind(company.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO company_users \
             (id, user_id, company_id, role, permissions, is_owner, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(membership.id.as_uuid())
        .bind(membership.user_id.as_uuid())
        .bind(membership.company_id.as_uuid())
        .bind(membership.role.as_str())
        .bind(serde_json::to_value(&membership.permissions)?)
        .bind(membership.is_owner)
        .bind(membership_status_str(membership.status))
        .bind(membership.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO onboarding (company_id, current_step, max_step_reached, is_completed, data, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(onboarding.company_id.as_uuid())
        .bind(i16::from(onboarding.current_step.number()))
        .bind(i16::from(onboarding.max_step_reached.number()))
        .bind(onboarding.is_completed)
        .bind(serde_json::to_value(&onboarding.data)?)
        .bind(onboarding.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CompanyBootstrap {
            company,
            membership,
            onboarding,
        })
    }

    async fn get_company(&self, id: CompanyId) -> Result<Option<Company>> {
        let row = sqlx::query_as::<_, CompanyRow>(
            "SELECT id, name, phone, stripe_customer_id, created_at FROM companies WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn set_company_stripe_customer(
        &self,
        id: CompanyId,
        stripe_customer_id: &str,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE companies SET stripe_customer_id = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(stripe_customer_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("company"));
        }
        Ok(())
    }

    async fn get_membership(
        &self,
        user_id: UserId,
        company_id: CompanyId,
    ) -> Result<Option<Membership>> {
        let row = sqlx::query_as::<_, MembershipRow>(
            "SELECT id, user_id, company_id, role, permissions, is_owner, status, created_at \
             FROM company_users WHERE user_id = $1 AND company_id = $2",
        )
        .bind(user_id.as_uuid())
        .bind(company_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_memberships_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<(Membership, Company)>> {
        let memberships = sqlx::query_as::<_, MembershipRow>(
            "SELECT id, user_id, company_id, role, permissions, is_owner, status, created_at \
             FROM company_users WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(memberships.len());
        for row in memberships {
            let company = sqlx::query_as::<_, CompanyRow>(
                "SELECT id, name, phone, stripe_customer_id, created_at FROM companies WHERE id = $1",
            )
            .bind(row.company_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(company) = company {
                out.push((row.try_into()?, company.into()));
            }
        }
        Ok(out)
    }

    async fn get_company_owner(&self, company_id: CompanyId) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT u.id, u.email, u.password_hash, u.verified, u.created_at \
             FROM users u \
             JOIN company_users cu ON cu.user_id = u.id \
             WHERE cu.company_id = $1 AND cu.is_owner = true \
             LIMIT 1",
        )
        .bind(company_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_branches(&self, company_id: CompanyId) -> Result<Vec<Branch>> {
        let rows = sqlx::query_as::<_, BranchRow>(
            "SELECT id, company_id, name, is_main, created_at \
             FROM branches WHERE company_id = $1 ORDER BY created_at",
        )
        .bind(company_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_branch(&self, id: BranchId) -> Result<Option<Branch>> {
        let row = sqlx::query_as::<_, BranchRow>(
            "SELECT id, company_id, name, is_main, created_at FROM branches WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn upsert_plan(&self, plan: &Plan) -> Result<()> {
        sqlx::query(
            "INSERT INTO plans \
             (id, key, name, tier, currency, base_monthly_cents, base_yearly_cents, \
              extra_branch_monthly_cents, extra_branch_yearly_cents, \
              stripe_base_monthly_price_id, stripe_base_yearly_price_id, \
              stripe_extra_branch_monthly_price_id, stripe_extra_branch_yearly_price_id, \
              prices_synced_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (id) DO UPDATE SET \
               key = EXCLUDED.key, name = EXCLUDED.name, tier = EXCLUDED.tier, \
               currency = EXCLUDED.currency, \
               base_monthly_cents = EXCLUDED.base_monthly_cents, \
               base_yearly_cents = EXCLUDED.base_yearly_cents, \
               extra_branch_monthly_cents = EXCLUDED.extra_branch_monthly_cents, \
               extra_branch_yearly_cents = EXCLUDED.extra_branch_yearly_cents, \
               stripe_base_monthly_price_id = EXCLUDED.stripe_base_monthly_price_id, \
               stripe_base_yearly_price_id = EXCLUDED.stripe_base_yearly_price_id, \
               stripe_extra_branch_monthly_price_id = EXCLUDED.stripe_extra_branch_monthly_price_id, \
               stripe_extra_branch_yearly_price_id = EXCLUDED.stripe_extra_branch_yearly_price_id, \
               prices_synced_at = EXCLUDED.prices_synced_at",
        )
        .bind(plan.id.as_uuid())
        .bind(&plan.key)
        .bind(&plan.name)
        .bind(tier_str(plan.tier))
        .bind(&plan.base_price.currency)
        .bind(plan.base_price.monthly_cents)
        .bind(plan.base_price.yearly_cents)
        .bind(plan.extra_branch_price.monthly_cents)
        .bind(plan.extra_branch_price.yearly_cents)
        .bind(&plan.base_price_ids.monthly)
        .bind(&plan.base_price_ids.yearly)
        .bind(&plan.extra_branch_price_ids.monthly)
        .bind(&plan.extra_branch_price_ids.yearly)
        .bind(plan.prices_synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>> {
        let rows = sqlx::query_as::<_, PlanRow>("SELECT * FROM plans ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get_plan(&self, id: PlanId) -> Result<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>("SELECT * FROM plans WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn upsert_plugin(&self, plugin: &Plugin) -> Result<()> {
        sqlx::query(
            "INSERT INTO plugins \
             (id, key, name, industries, min_tier, currency, monthly_cents, yearly_cents, \
              stripe_monthly_price_id, stripe_yearly_price_id, prices_synced_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (id) DO UPDATE SET \
               key = EXCLUDED.key, name = EXCLUDED.name, industries = EXCLUDED.industries, \
               min_tier = EXCLUDED.min_tier, currency = EXCLUDED.currency, \
               monthly_cents = EXCLUDED.monthly_cents, yearly_cents = EXCLUDED.yearly_cents, \
               stripe_monthly_price_id = EXCLUDED.stripe_monthly_price_id, \
               stripe_yearly_price_id = EXCLUDED.stripe_yearly_price_id, \
               prices_synced_at = EXCLUDED.prices_synced_at",
        )
        .bind(plugin.id.as_uuid())
        .bind(&plugin.key)
        .bind(&plugin.name)
        .bind(serde_json::to_value(&plugin.industries)?)
        .bind(tier_str(plugin.min_tier))
        .bind(&plugin.price.currency)
        .bind(plugin.price.monthly_cents)
        .bind(plugin.price.yearly_cents)
        .bind(&plugin.price_ids.monthly)
        .bind(&plugin.price_ids.yearly)
        .bind(plugin.prices_synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_plugins(&self) -> Result<Vec<Plugin>> {
        let rows = sqlx::query_as::<_, PluginRow>("SELECT * FROM plugins ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get_plugins_by_keys(&self, keys: &[String]) -> Result<Vec<Plugin>> {
        let rows = sqlx::query_as::<_, PluginRow>("SELECT * FROM plugins WHERE key = ANY($1)")
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_cached_price(
        &self,
        stripe_price_id: &str,
        interval: PriceInterval,
        amount_cents: i64,
    ) -> Result<bool> {
        let (base_col, base_id_col, branch_col, branch_id_col, plugin_col, plugin_id_col) =
            match interval {
                PriceInterval::Month => (
                    "base_monthly_cents",
                    "stripe_base_monthly_price_id",
                    "extra_branch_monthly_cents",
                    "stripe_extra_branch_monthly_price_id",
                    "monthly_cents",
                    "stripe_monthly_price_id",
                ),
                PriceInterval::Year => (
                    "base_yearly_cents",
                    "stripe_base_yearly_price_id",
                    "extra_branch_yearly_cents",
                    "stripe_extra_branch_yearly_price_id",
                    "yearly_cents",
                    "stripe_yearly_price_id",
                ),
            };

        let mut changed = 0;

        let sql = format!(
            "UPDATE plans SET {base_col} = $2, prices_synced_at = now() WHERE {base_id_col} = $1"
        );
        changed += sqlx::query(&sql)
            .bind(stripe_price_id)
            .bind(amount_cents)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let sql = format!(
            "UPDATE plans SET {branch_col} = $2, prices_synced_at = now() WHERE {branch_id_col} = $1"
        );
        changed += sqlx::query(&sql)
            .bind(stripe_price_id)
            .bind(amount_cents)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let sql = format!(
            "UPDATE plugins SET {plugin_col} = $2, prices_synced_at = now() WHERE {plugin_id_col} = $1"
        );
        changed += sqlx::query(&sql)
            .bind(stripe_price_id)
            .bind(amount_cents)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(changed > 0)
    }

    async fn get_onboarding(&self, company_id: CompanyId) -> Result<Option<OnboardingRecord>> {
        let row = sqlx::query_as::<_, OnboardingRow>(
            "SELECT company_id, current_step, max_step_reached, is_completed, data, updated_at \
             FROM onboarding WHERE company_id = $1",
        )
        .bind(company_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn save_onboarding(&self, record: &OnboardingRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE onboarding \
             SET current_step = $2, max_step_reached = $3, is_completed = $4, data = $5, \
                 updated_at = $6 \
             WHERE company_id = $1",
        )
        .bind(record.company_id.as_uuid())
        .bind(i16::from(record.current_step.number()))
        .bind(i16::from(record.max_step_reached.number()))
        .bind(record.is_completed)
        .bind(serde_json::to_value(&record.data)?)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("onboarding"));
        }
        Ok(())
    }

    async fn complete_onboarding(&self, req: CompleteOnboarding) -> Result<Vec<Branch>> {
        let mut tx = self.pool.begin().await?;

        let completed: Option<bool> = sqlx::query_scalar(
            "SELECT is_completed FROM onboarding WHERE company_id = $1 FOR UPDATE",
        )
        .bind(req.company_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        match completed {
            None => return Err(StoreError::not_found("onboarding")),
            Some(true) => {
                return Err(StoreError::conflict("onboarding", "already completed"));
            }
            Some(false) => {}
        }

        let mut created = vec![Branch::new(req.company_id, &req.main_branch_name, true)];
        for n in 1..=req.extra_branches {
            created.push(Branch::new(
                req.company_id,
                format!("{} #{}", req.main_branch_name, n + 1),
                false,
            ));
        }

        for branch in &created {
            sqlx::query(
                "INSERT INTO branches (id, company_id, name, is_main, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(branch.id.as_uuid())
            .bind(branch.company_id.as_uuid())
            .bind(&branch.name)
            .bind(branch.is_main)
            .bind(branch.created_at)
            .execute(&mut *tx)
            .await?;
        }

        let main_id = created[0].id;
        for plugin_id in &req.plugin_ids {
            sqlx::query(
                "INSERT INTO company_plugins (company_id, plugin_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(req.company_id.as_uuid())
            .bind(plugin_id.as_uuid())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO branch_plugins (branch_id, plugin_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(main_id.as_uuid())
            .bind(plugin_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        }

        if let Some((subscription, items)) = &req.subscription {
            insert_subscription_tx(&mut tx, subscription, items).await?;
        }

        sqlx::query(
            "UPDATE onboarding SET is_completed = true, updated_at = now() WHERE company_id = $1",
        )
        .bind(req.company_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn create_subscription(
        &self,
        subscription: &Subscription,
        items: &[SubscriptionItem],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions \
             WHERE company_id = $1 AND billing_status <> 'canceled' \
             ORDER BY created_at DESC \
             FOR UPDATE",
        )
        .bind(subscription.company_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        for row in existing {
            if row.billing_status != "pending" {
                return Err(StoreError::conflict(
                    "subscription",
                    "company already has a live subscription",
                ));
            }
            // Replace abandoned placeholders from earlier confirmation runs.
            sqlx::query("DELETE FROM subscriptions WHERE id = $1")
                .bind(row.id)
                .execute(&mut *tx)
                .await?;
        }

        insert_subscription_tx(&mut tx, subscription, items).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_subscription_for_company(
        &self,
        company_id: CompanyId,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE company_id = $1 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(company_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_subscription_items(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<SubscriptionItem>> {
        let rows = sqlx::query_as::<_, SubscriptionItemRow>(
            "SELECT subscription_id, kind, reference_key, stripe_item_id, quantity, \
                    unit_amount_cents \
             FROM subscription_items WHERE subscription_id = $1 ORDER BY id",
        )
        .bind(subscription_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn reconcile_subscription(
        &self,
        stripe_subscription_id: &str,
        update: SubscriptionReconciliation,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE stripe_subscription_id = $1 FOR UPDATE",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let current = parse_billing_status(&row.billing_status)?;
        let status = if current.can_transition_to(update.status) {
            update.status
        } else {
            tracing::warn!(
                stripe_subscription_id,
                from = current.as_str(),
                to = update.status.as_str(),
                "Skipping disallowed billing status transition"
            );
            current
        };

        sqlx::query(
            "UPDATE subscriptions \
             SET billing_status = $2, \
                 current_period_start = COALESCE($3, current_period_start), \
                 current_period_end = COALESCE($4, current_period_end), \
                 cancel_at_period_end = COALESCE($5, cancel_at_period_end), \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(row.id)
        .bind(status.as_str())
        .bind(update.current_period_start)
        .bind(update.current_period_end)
        .bind(update.cancel_at_period_end)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn upsert_payment(&self, payment: &PaymentRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO payment_history \
             (id, company_id, stripe_invoice_id, amount_cents, currency, status, billing_reason, \
              created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (stripe_invoice_id) DO NOTHING",
        )
        .bind(payment.id.to_string())
        .bind(payment.company_id.as_uuid())
        .bind(&payment.stripe_invoice_id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(payment_status_str(payment.status))
        .bind(&payment.billing_reason)
        .bind(payment.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        sqlx::query(
            "UPDATE payment_history \
             SET status = $2, amount_cents = $3, billing_reason = $4 \
             WHERE stripe_invoice_id = $1",
        )
        .bind(&payment.stripe_invoice_id)
        .bind(payment_status_str(payment.status))
        .bind(payment.amount_cents)
        .bind(&payment.billing_reason)
        .execute(&self.pool)
        .await?;
        Ok(false)
    }

    async fn list_payments_for_company(
        &self,
        company_id: CompanyId,
    ) -> Result<Vec<PaymentRecord>> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            "SELECT id, company_id, stripe_invoice_id, amount_cents, currency, status, \
                    billing_reason, created_at \
             FROM payment_history WHERE company_id = $1 ORDER BY created_at DESC",
        )
        .bind(company_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn create_invitation(&self, invitation: &Invitation) -> Result<()> {
        sqlx::query(
            "INSERT INTO invitations \
             (id, company_id, email, role, token_hash, status, expires_at, created_at) \
             VALUES ($1, $2, lower($3), $4, $5, $6, $7, $8)",
        )
        .bind(invitation.id.as_uuid())
        .bind(invitation.company_id.as_uuid())
        .bind(&invitation.email)
        .bind(invitation.role.as_str())
        .bind(&invitation.token_hash)
        .bind(invitation_status_str(invitation.status))
        .bind(invitation.expires_at)
        .bind(invitation.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_invitation_by_token_hash(&self, token_hash: &str) -> Result<Option<Invitation>> {
        let row = sqlx::query_as::<_, InvitationRow>(
            "SELECT id, company_id, email, role, token_hash, status, expires_at, created_at \
             FROM invitations WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn accept_invitation(&self, token_hash: &str, user_id: UserId) -> Result<Membership> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, InvitationRow>(
            "SELECT id, company_id, email, role, token_hash, status, expires_at, created_at \
             FROM invitations WHERE token_hash = $1 FOR UPDATE",
        )
        .bind(token_hash)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::not_found("invitation"))?;

        let invitation: Invitation = row.try_into()?;
        if invitation.status != InvitationStatus::Pending {
            return Err(StoreError::conflict("invitation", "not pending"));
        }
        if invitation.expires_at <= Utc::now() {
            return Err(StoreError::conflict("invitation", "expired"));
        }

        let already_member: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM company_users WHERE user_id = $1 AND company_id = $2",
        )
        .bind(user_id.as_uuid())
        .bind(invitation.company_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        if already_member.is_some() {
            return Err(StoreError::conflict("membership", "already a member"));
        }

        let membership = Membership {
            id: MembershipId::generate(),
            user_id,
            company_id: invitation.company_id,
            role: invitation.role,
            permissions: invitation.role.default_permissions(),
            is_owner: false,
            status: MembershipStatus::Active,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO company_users \
             (id, user_id, company_id, role, permissions, is_owner, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(membership.id.as_uuid())
        .bind(membership.user_id.as_uuid())
        .bind(membership.company_id.as_uuid())
        .bind(membership.role.as_str())
        .bind(serde_json::to_value(&membership.permissions)?)
        .bind(membership.is_owner)
        .bind(membership_status_str(membership.status))
        .bind(membership.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE invitations SET status = 'accepted' WHERE id = $1")
            .bind(invitation.id.as_uuid())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(membership)
    }
}
