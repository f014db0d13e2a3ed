//! In-memory [`Store`] implementation.
//!
//! Used by integration tests and local development. Every multi-table
//! operation runs under one write lock, which gives it the same atomicity
//! the PostgreSQL backend gets from transactions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use atelier_core::{
    Branch, BranchId, BillingStatus, Company, CompanyId, Invitation, InvitationId,
    InvitationStatus, Membership, MembershipStatus, OnboardingRecord, PaymentRecord, Plan, PlanId,
    Plugin, PluginId, PriceInterval, Session, SessionId, Subscription, SubscriptionId,
    SubscriptionItem, User, UserId, VerificationCode, VerificationPurpose,
};

use crate::error::{Result, StoreError};
use crate::{CompanyBootstrap, CompleteOnboarding, NewUser, Store, SubscriptionReconciliation};

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    codes: HashMap<(String, VerificationPurpose), VerificationCode>,
    sessions: HashMap<SessionId, Session>,
    companies: HashMap<CompanyId, Company>,
    memberships: Vec<Membership>,
    branches: Vec<Branch>,
    company_plugins: Vec<(CompanyId, PluginId)>,
    branch_plugins: Vec<(BranchId, PluginId)>,
    plans: HashMap<PlanId, Plan>,
    plugins: HashMap<PluginId, Plugin>,
    onboarding: HashMap<CompanyId, OnboardingRecord>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    subscription_items: Vec<SubscriptionItem>,
    payments: HashMap<String, PaymentRecord>,
    invitations: HashMap<InvitationId, Invitation>,
}

/// In-memory store.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

impl MemStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_user(&self, user: NewUser) -> Result<User> {
        let mut inner = self.inner.write().await;
        if inner
            .users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(StoreError::conflict("user", "email already registered"));
        }
        let row = User {
            id: UserId::generate(),
            email: user.email,
            password_hash: user.password_hash,
            verified: user.verified,
            created_at: Utc::now(),
        };
        inner.users.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn put_verification_code(&self, code: &VerificationCode) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .codes
            .insert((code.email.clone(), code.purpose), code.clone());
        Ok(())
    }

    async fn get_verification_code(
        &self,
        email: &str,
        purpose: VerificationPurpose,
    ) -> Result<Option<VerificationCode>> {
        let inner = self.inner.read().await;
        Ok(inner.codes.get(&(email.to_string(), purpose)).cloned())
    }

    async fn increment_code_attempts(
        &self,
        email: &str,
        purpose: VerificationPurpose,
    ) -> Result<i32> {
        let mut inner = self.inner.write().await;
        let code = inner
            .codes
            .get_mut(&(email.to_string(), purpose))
            .ok_or(StoreError::not_found("verification_code"))?;
        code.attempts += 1;
        Ok(code.attempts)
    }

    async fn delete_verification_code(
        &self,
        email: &str,
        purpose: VerificationPurpose,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.codes.remove(&(email.to_string(), purpose));
        Ok(())
    }

    async fn upsert_login_session(&self, session: Session) -> Result<Session> {
        let mut inner = self.inner.write().await;

        let mut existing: Vec<SessionId> = inner
            .sessions
            .values()
            .filter(|s| {
                s.user_id == session.user_id && s.fingerprint == session.fingerprint && !s.revoked
            })
            .map(|s| s.id)
            .collect();
        existing.sort_by_key(|id| inner.sessions[id].created_at);

        // Rotate the newest row in place, revoke stray duplicates.
        if let Some(keep) = existing.pop() {
            for stray in existing {
                if let Some(s) = inner.sessions.get_mut(&stray) {
                    s.revoked = true;
                }
            }
            let row = inner.sessions.get_mut(&keep).ok_or_else(|| {
                StoreError::not_found("session")
            })?;
            row.refresh_token_hash = session.refresh_token_hash;
            row.expires_at = session.expires_at;
            row.last_activity_at = Utc::now();
            return Ok(row.clone());
        }

        inner.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn find_session_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.fingerprint == fingerprint)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn rotate_session(
        &self,
        id: SessionId,
        old_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(&id) else {
            return Ok(false);
        };
        if session.revoked || session.refresh_token_hash != old_hash {
            return Ok(false);
        }
        session.refresh_token_hash = new_hash.to_string();
        session.expires_at = expires_at;
        session.last_activity_at = Utc::now();
        Ok(true)
    }

    async fn revoke_session(&self, id: SessionId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.revoked = true;
        }
        Ok(())
    }

    async fn revoke_all_sessions_for_user(&self, user_id: UserId) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut revoked = 0;
        for session in inner.sessions.values_mut() {
            if session.user_id == user_id && !session.revoked {
                session.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn touch_session_activity(&self, id: SessionId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.last_activity_at = Utc::now();
        }
        Ok(())
    }

    async fn create_company_with_owner(
        &self,
        owner: UserId,
        name: &str,
        phone: Option<&str>,
    ) -> Result<CompanyBootstrap> {
        let mut inner = self.inner.write().await;
        if !inner.users.contains_key(&owner) {
            return Err(StoreError::not_found("user"));
        }

        let company = Company::new(name, phone.map(ToString::to_string));
        let membership = Membership::owner(owner, company.id);
        let onboarding = OnboardingRecord::new(company.id);

        inner.companies.insert(company.id, company.clone());
        inner.memberships.push(membership.clone());
        inner.onboarding.insert(company.id, onboarding.clone());

        Ok(CompanyBootstrap {
            company,
            membership,
            onboarding,
        })
    }

    async fn get_company(&self, id: CompanyId) -> Result<Option<Company>> {
        Ok(self.inner.read().await.companies.get(&id).cloned())
    }

    async fn set_company_stripe_customer(
        &self,
        id: CompanyId,
        stripe_customer_id: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let company = inner
            .companies
            .get_mut(&id)
            .ok_or(StoreError::not_found("company"))?;
        company.stripe_customer_id = Some(stripe_customer_id.to_string());
        Ok(())
    }

    async fn get_membership(
        &self,
        user_id: UserId,
        company_id: CompanyId,
    ) -> Result<Option<Membership>> {
        let inner = self.inner.read().await;
        Ok(inner
            .memberships
            .iter()
            .find(|m| m.user_id == user_id && m.company_id == company_id)
            .cloned())
    }

    async fn list_memberships_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<(Membership, Company)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| {
                inner
                    .companies
                    .get(&m.company_id)
                    .map(|c| (m.clone(), c.clone()))
            })
            .collect())
    }

    async fn get_company_owner(&self, company_id: CompanyId) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .memberships
            .iter()
            .find(|m| m.company_id == company_id && m.is_owner)
            .and_then(|m| inner.users.get(&m.user_id))
            .cloned())
    }

    async fn list_branches(&self, company_id: CompanyId) -> Result<Vec<Branch>> {
        let inner = self.inner.read().await;
        Ok(inner
            .branches
            .iter()
            .filter(|b| b.company_id == company_id)
            .cloned()
            .collect())
    }

    async fn get_branch(&self, id: BranchId) -> Result<Option<Branch>> {
        let inner = self.inner.read().await;
        Ok(inner.branches.iter().find(|b| b.id == id).cloned())
    }

    async fn upsert_plan(&self, plan: &Plan) -> Result<()> {
        self.inner.write().await.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>> {
        let inner = self.inner.read().await;
        let mut plans: Vec<Plan> = inner.plans.values().cloned().collect();
        plans.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(plans)
    }

    async fn get_plan(&self, id: PlanId) -> Result<Option<Plan>> {
        Ok(self.inner.read().await.plans.get(&id).cloned())
    }

    async fn upsert_plugin(&self, plugin: &Plugin) -> Result<()> {
        self.inner
            .write()
            .await
            .plugins
            .insert(plugin.id, plugin.clone());
        Ok(())
    }

    async fn list_plugins(&self) -> Result<Vec<Plugin>> {
        let inner = self.inner.read().await;
        let mut plugins: Vec<Plugin> = inner.plugins.values().cloned().collect();
        plugins.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(plugins)
    }

    async fn get_plugins_by_keys(&self, keys: &[String]) -> Result<Vec<Plugin>> {
        let inner = self.inner.read().await;
        Ok(inner
            .plugins
            .values()
            .filter(|p| keys.contains(&p.key))
            .cloned()
            .collect())
    }

    async fn update_cached_price(
        &self,
        stripe_price_id: &str,
        interval: PriceInterval,
        amount_cents: i64,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut changed = false;
        for plan in inner.plans.values_mut() {
            changed |= plan.apply_price_update(stripe_price_id, interval, amount_cents, now);
        }
        for plugin in inner.plugins.values_mut() {
            changed |= plugin.apply_price_update(stripe_price_id, interval, amount_cents, now);
        }
        Ok(changed)
    }

    async fn get_onboarding(&self, company_id: CompanyId) -> Result<Option<OnboardingRecord>> {
        Ok(self.inner.read().await.onboarding.get(&company_id).cloned())
    }

    async fn save_onboarding(&self, record: &OnboardingRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.onboarding.contains_key(&record.company_id) {
            return Err(StoreError::not_found("onboarding"));
        }
        inner.onboarding.insert(record.company_id, record.clone());
        Ok(())
    }

    async fn complete_onboarding(&self, req: CompleteOnboarding) -> Result<Vec<Branch>> {
        let mut inner = self.inner.write().await;

        let record = inner
            .onboarding
            .get(&req.company_id)
            .ok_or(StoreError::not_found("onboarding"))?;
        if record.is_completed {
            return Err(StoreError::conflict("onboarding", "already completed"));
        }

        let mut created = vec![Branch::new(req.company_id, &req.main_branch_name, true)];
        for n in 1..=req.extra_branches {
            created.push(Branch::new(
                req.company_id,
                format!("{} #{}", req.main_branch_name, n + 1),
                false,
            ));
        }

        let main_id = created[0].id;
        inner.branches.extend(created.iter().cloned());
        for plugin_id in &req.plugin_ids {
            inner.company_plugins.push((req.company_id, *plugin_id));
            inner.branch_plugins.push((main_id, *plugin_id));
        }

        if let Some((subscription, items)) = req.subscription {
            inner.subscriptions.insert(subscription.id, subscription);
            inner.subscription_items.extend(items);
        }

        let record = inner
            .onboarding
            .get_mut(&req.company_id)
            .ok_or(StoreError::not_found("onboarding"))?;
        record.is_completed = true;
        record.updated_at = Utc::now();

        Ok(created)
    }

    async fn create_subscription(
        &self,
        subscription: &Subscription,
        items: &[SubscriptionItem],
    ) -> Result<()> {
        let mut inner = self.inner.write().await;

        let existing: Option<SubscriptionId> = inner
            .subscriptions
            .values()
            .find(|s| {
                s.company_id == subscription.company_id
                    && s.billing_status != BillingStatus::Canceled
            })
            .map(|s| s.id);

        if let Some(existing_id) = existing {
            let status = inner.subscriptions[&existing_id].billing_status;
            if status != BillingStatus::Pending {
                return Err(StoreError::conflict(
                    "subscription",
                    "company already has a live subscription",
                ));
            }
            inner.subscriptions.remove(&existing_id);
            inner
                .subscription_items
                .retain(|i| i.subscription_id != existing_id);
        }

        inner
            .subscriptions
            .insert(subscription.id, subscription.clone());
        inner.subscription_items.extend(items.iter().cloned());
        Ok(())
    }

    async fn get_subscription_for_company(
        &self,
        company_id: CompanyId,
    ) -> Result<Option<Subscription>> {
        let inner = self.inner.read().await;
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| s.company_id == company_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn get_subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        let inner = self.inner.read().await;
        Ok(inner
            .subscriptions
            .values()
            .find(|s| s.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .cloned())
    }

    async fn list_subscription_items(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<SubscriptionItem>> {
        let inner = self.inner.read().await;
        Ok(inner
            .subscription_items
            .iter()
            .filter(|i| i.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn reconcile_subscription(
        &self,
        stripe_subscription_id: &str,
        update: SubscriptionReconciliation,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(subscription) = inner
            .subscriptions
            .values_mut()
            .find(|s| s.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
        else {
            return Ok(false);
        };

        if subscription.billing_status.can_transition_to(update.status) {
            subscription.billing_status = update.status;
        } else {
            tracing::warn!(
                stripe_subscription_id,
                from = subscription.billing_status.as_str(),
                to = update.status.as_str(),
                "Skipping disallowed billing status transition"
            );
        }
        if update.current_period_start.is_some() {
            subscription.current_period_start = update.current_period_start;
        }
        if update.current_period_end.is_some() {
            subscription.current_period_end = update.current_period_end;
        }
        if let Some(flag) = update.cancel_at_period_end {
            subscription.cancel_at_period_end = flag;
        }
        subscription.updated_at = Utc::now();
        Ok(true)
    }

    async fn upsert_payment(&self, payment: &PaymentRecord) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.payments.get_mut(&payment.stripe_invoice_id) {
            Some(existing) => {
                existing.status = payment.status;
                existing.amount_cents = payment.amount_cents;
                existing.billing_reason.clone_from(&payment.billing_reason);
                Ok(false)
            }
            None => {
                inner
                    .payments
                    .insert(payment.stripe_invoice_id.clone(), payment.clone());
                Ok(true)
            }
        }
    }

    async fn list_payments_for_company(
        &self,
        company_id: CompanyId,
    ) -> Result<Vec<PaymentRecord>> {
        let inner = self.inner.read().await;
        let mut payments: Vec<PaymentRecord> = inner
            .payments
            .values()
            .filter(|p| p.company_id == company_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    async fn create_invitation(&self, invitation: &Invitation) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.invitations.insert(invitation.id, invitation.clone());
        Ok(())
    }

    async fn get_invitation_by_token_hash(&self, token_hash: &str) -> Result<Option<Invitation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .invitations
            .values()
            .find(|i| i.token_hash == token_hash)
            .cloned())
    }

    async fn accept_invitation(&self, token_hash: &str, user_id: UserId) -> Result<Membership> {
        let mut inner = self.inner.write().await;

        let (invitation_id, company_id, role) = {
            let invitation = inner
                .invitations
                .values()
                .find(|i| i.token_hash == token_hash)
                .ok_or(StoreError::not_found("invitation"))?;
            if invitation.status != InvitationStatus::Pending {
                return Err(StoreError::conflict("invitation", "not pending"));
            }
            if invitation.expires_at <= Utc::now() {
                return Err(StoreError::conflict("invitation", "expired"));
            }
            (invitation.id, invitation.company_id, invitation.role)
        };

        if inner
            .memberships
            .iter()
            .any(|m| m.user_id == user_id && m.company_id == company_id)
        {
            return Err(StoreError::conflict("membership", "already a member"));
        }

        let membership = Membership {
            id: atelier_core::MembershipId::generate(),
            user_id,
            company_id,
            role,
            permissions: role.default_permissions(),
            is_owner: false,
            status: MembershipStatus::Active,
            created_at: Utc::now(),
        };
        inner.memberships.push(membership.clone());

        if let Some(invitation) = inner.invitations.get_mut(&invitation_id) {
            invitation.status = InvitationStatus::Accepted;
        }

        Ok(membership)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session_row(user_id: UserId, fingerprint: &str, hash: &str) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::generate(),
            user_id,
            fingerprint: fingerprint.into(),
            refresh_token_hash: hash.into(),
            revoked: false,
            expires_at: now + Duration::days(7),
            last_activity_at: now,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn rotate_session_is_single_use() {
        let store = MemStore::new();
        let user = store
            .create_user(NewUser {
                email: "a@b.c".into(),
                password_hash: "h".into(),
                verified: true,
            })
            .await
            .unwrap();

        let session = store
            .upsert_login_session(session_row(user.id, "fp-1", "old"))
            .await
            .unwrap();

        let expires = Utc::now() + Duration::days(7);
        assert!(store
            .rotate_session(session.id, "old", "new", expires)
            .await
            .unwrap());
        // Second rotation with the stale hash loses.
        assert!(!store
            .rotate_session(session.id, "old", "newer", expires)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn login_upsert_keeps_other_devices_alive() {
        let store = MemStore::new();
        let user = store
            .create_user(NewUser {
                email: "a@b.c".into(),
                password_hash: "h".into(),
                verified: true,
            })
            .await
            .unwrap();

        let phone = store
            .upsert_login_session(session_row(user.id, "fp-phone", "h1"))
            .await
            .unwrap();
        let laptop = store
            .upsert_login_session(session_row(user.id, "fp-laptop", "h2"))
            .await
            .unwrap();

        // Logging in again on the laptop rotates that row in place.
        let laptop_again = store
            .upsert_login_session(session_row(user.id, "fp-laptop", "h3"))
            .await
            .unwrap();
        assert_eq!(laptop.id, laptop_again.id);
        assert_eq!(laptop_again.refresh_token_hash, "h3");

        // The phone session is untouched.
        let phone_now = store
            .find_session_by_fingerprint("fp-phone")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(phone_now.id, phone.id);
        assert!(!phone_now.revoked);
    }

    #[tokio::test]
    async fn payment_upsert_reports_first_insert() {
        let store = MemStore::new();
        let payment = PaymentRecord {
            id: atelier_core::PaymentId::generate(),
            company_id: CompanyId::generate(),
            stripe_invoice_id: "in_123".into(),
            amount_cents: 1240,
            currency: "eur".into(),
            status: atelier_core::PaymentStatus::Paid,
            billing_reason: Some("subscription_create".into()),
            created_at: Utc::now(),
        };

        assert!(store.upsert_payment(&payment).await.unwrap());
        assert!(!store.upsert_payment(&payment).await.unwrap());

        let payments = store
            .list_payments_for_company(payment.company_id)
            .await
            .unwrap();
        assert_eq!(payments.len(), 1);
    }
}
