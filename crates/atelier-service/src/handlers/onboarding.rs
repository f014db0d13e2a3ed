//! Onboarding handlers: company bootstrap, the step machine, catalog reads
//! and membership invitations.
//!
//! The server owns onboarding progress. Clients render
//! `current_step`/`max_step_reached` and re-sync on mount; every mutation
//! goes through the draft merge rules in `atelier-core`.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use atelier_core::{
    Company, DraftError, DraftUpdate, ErrorCode, Invitation, InvitationId, Membership,
    OnboardingRecord, OnboardingStep, Plan, Plugin, Role,
};

use crate::crypto::sha256_hex;
use crate::error::{ApiError, ApiResponse};
use crate::extract::{AuthUser, CompanyScope};
use crate::state::AppState;
use crate::tokens::generate_invitation_token;

/// Invitations expire after a week.
const INVITATION_TTL_DAYS: i64 = 7;

// ============================================================================
// Company bootstrap
// ============================================================================

/// Request body for company creation.
#[derive(Debug, Deserialize)]
pub struct CreateCompanyRequest {
    /// Company display name.
    pub name: String,
    /// Contact phone.
    pub phone: Option<String>,
}

/// Payload of company creation.
#[derive(Debug, Serialize)]
pub struct CreateCompanyResponse {
    /// The created company.
    pub company: Company,
    /// The owner membership.
    pub membership: Membership,
    /// The onboarding row at step 1.
    pub onboarding: OnboardingView,
}

/// Create a company with its owner membership and onboarding row. The
/// three inserts are one atomic store operation, so a failure cannot leave
/// a company without an onboarding record.
pub async fn create_company(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreateCompanyRequest>,
) -> Result<Json<ApiResponse<CreateCompanyResponse>>, ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("company name is required".into()));
    }

    let bootstrap = state
        .store
        .create_company_with_owner(auth.user_id, name, body.phone.as_deref())
        .await?;

    // Best-effort Stripe customer creation; billing endpoints re-check and
    // the company works without it until checkout.
    if let Some(stripe) = &state.stripe {
        let user = state.store.get_user(auth.user_id).await?;
        match stripe
            .create_customer(
                &bootstrap.company.id.to_string(),
                &bootstrap.company.name,
                user.as_ref().map(|u| u.email.as_str()),
            )
            .await
        {
            Ok(customer) => {
                state
                    .store
                    .set_company_stripe_customer(bootstrap.company.id, &customer.id)
                    .await?;
                tracing::info!(
                    company_id = %bootstrap.company.id,
                    stripe_id = %customer.id,
                    "Stripe customer created"
                );
            }
            Err(e) => {
                tracing::warn!(
                    company_id = %bootstrap.company.id,
                    error = %e,
                    "Failed to create Stripe customer - continuing without"
                );
            }
        }
    }

    tracing::info!(company_id = %bootstrap.company.id, owner = %auth.user_id, "Company created");

    let company = state
        .store
        .get_company(bootstrap.company.id)
        .await?
        .unwrap_or(bootstrap.company);

    Ok(ApiResponse::ok(
        "Company created",
        CreateCompanyResponse {
            company,
            membership: bootstrap.membership,
            onboarding: OnboardingView::from(&bootstrap.onboarding),
        },
    ))
}

// ============================================================================
// Step machine
// ============================================================================

/// Onboarding state as exposed over the API (steps are 1-based numbers).
#[derive(Debug, Serialize)]
pub struct OnboardingView {
    /// The step the wizard is on.
    pub current_step: u8,
    /// High-water mark.
    pub max_step_reached: u8,
    /// Terminal flag.
    pub is_completed: bool,
}

impl From<&OnboardingRecord> for OnboardingView {
    fn from(record: &OnboardingRecord) -> Self {
        Self {
            current_step: record.current_step.number(),
            max_step_reached: record.max_step_reached.number(),
            is_completed: record.is_completed,
        }
    }
}

/// Full onboarding payload including the draft.
#[derive(Debug, Serialize)]
pub struct OnboardingDataView {
    /// Step counters.
    #[serde(flatten)]
    pub view: OnboardingView,
    /// The draft document.
    pub data: atelier_core::OnboardingDraft,
}

impl From<&OnboardingRecord> for OnboardingDataView {
    fn from(record: &OnboardingRecord) -> Self {
        Self {
            view: OnboardingView::from(record),
            data: record.data.clone(),
        }
    }
}

pub(crate) async fn load_onboarding(
    state: &AppState,
    scope: &CompanyScope,
) -> Result<OnboardingRecord, ApiError> {
    state
        .store
        .get_onboarding(scope.company_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(
                ErrorCode::OnboardingIncomplete,
                "no onboarding record for this company".into(),
            )
        })
}

/// Step counters only; clients call this on mount to re-sync after
/// back/forward navigation.
pub async fn sync_step(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
) -> Result<Json<ApiResponse<OnboardingView>>, ApiError> {
    let record = load_onboarding(&state, &scope).await?;
    Ok(ApiResponse::ok("OK", OnboardingView::from(&record)))
}

/// Step counters plus the draft.
pub async fn data(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
) -> Result<Json<ApiResponse<OnboardingDataView>>, ApiError> {
    let record = load_onboarding(&state, &scope).await?;
    Ok(ApiResponse::ok("OK", OnboardingDataView::from(&record)))
}

fn map_draft_error(err: DraftError) -> ApiError {
    match err {
        DraftError::BranchesOutOfRange { .. } => ApiError::InvalidRange(err.to_string()),
        DraftError::StepIncomplete { .. } => ApiError::Validation(err.to_string()),
    }
}

/// Merge updates into the draft and advance one step.
pub async fn next(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
    Json(update): Json<DraftUpdate>,
) -> Result<Json<ApiResponse<OnboardingDataView>>, ApiError> {
    let mut record = load_onboarding(&state, &scope).await?;
    if record.is_completed {
        return Err(ApiError::Conflict(
            ErrorCode::OnboardingAlreadyCompleted,
            "onboarding is already completed".into(),
        ));
    }

    let applied = record.data.apply_update(&update).map_err(map_draft_error)?;
    record.data.validate_step(record.current_step).map_err(map_draft_error)?;

    if record.current_step < OnboardingStep::LAST {
        record.advance();
    } else {
        record.updated_at = Utc::now();
    }

    state.store.save_onboarding(&record).await?;

    if !applied.reset.is_empty() {
        tracing::debug!(
            company_id = %scope.company_id,
            reset = ?applied.reset,
            "Draft fields reset by dependency rules"
        );
    }

    Ok(ApiResponse::ok(
        "Step saved",
        OnboardingDataView::from(&record),
    ))
}

/// Step back one step. Data is never mutated here.
pub async fn back(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
) -> Result<Json<ApiResponse<OnboardingView>>, ApiError> {
    let mut record = load_onboarding(&state, &scope).await?;
    if record.is_completed {
        return Err(ApiError::Conflict(
            ErrorCode::OnboardingAlreadyCompleted,
            "onboarding is already completed".into(),
        ));
    }

    record.step_back();
    state.store.save_onboarding(&record).await?;
    Ok(ApiResponse::ok("OK", OnboardingView::from(&record)))
}

/// Merge updates into the draft without advancing.
pub async fn update_draft(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
    Json(update): Json<DraftUpdate>,
) -> Result<Json<ApiResponse<OnboardingDataView>>, ApiError> {
    let mut record = load_onboarding(&state, &scope).await?;
    if record.is_completed {
        return Err(ApiError::Conflict(
            ErrorCode::OnboardingAlreadyCompleted,
            "onboarding is already completed".into(),
        ));
    }

    record.data.apply_update(&update).map_err(map_draft_error)?;
    record.updated_at = Utc::now();
    state.store.save_onboarding(&record).await?;

    Ok(ApiResponse::ok(
        "Draft updated",
        OnboardingDataView::from(&record),
    ))
}

// ============================================================================
// Catalog reads
// ============================================================================

/// All plans.
pub async fn plans(
    State(state): State<Arc<AppState>>,
    _scope: CompanyScope,
) -> Result<Json<ApiResponse<Vec<Plan>>>, ApiError> {
    let plans = state.store.list_plans().await?;
    Ok(ApiResponse::ok("OK", plans))
}

/// Plugins eligible for the company's current draft (industry and plan
/// tier filtered). An empty list is normal for free-tier drafts.
pub async fn plugins(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
) -> Result<Json<ApiResponse<Vec<Plugin>>>, ApiError> {
    let record = load_onboarding(&state, &scope).await?;

    let tier = match record.data.plan {
        Some(selection) => state
            .store
            .get_plan(selection.id)
            .await?
            .ok_or_else(|| {
                ApiError::NotFound(ErrorCode::PlanNotFound, "selected plan not found".into())
            })?
            .tier,
        None => atelier_core::PlanTier::Free,
    };

    let eligible = state
        .store
        .list_plugins()
        .await?
        .into_iter()
        .filter(|p| p.eligible_for(tier, &record.data.industries))
        .collect();

    Ok(ApiResponse::ok("OK", eligible))
}

// ============================================================================
// Invitations
// ============================================================================

/// Request body for creating an invitation.
#[derive(Debug, Deserialize)]
pub struct CreateInvitationRequest {
    /// Invitee email.
    pub email: String,
    /// Role granted on acceptance.
    pub role: Role,
}

/// Payload of invitation creation.
#[derive(Debug, Serialize)]
pub struct CreateInvitationResponse {
    /// The invitation id.
    pub invitation_id: InvitationId,
    /// The raw invitation token; embedded in the emailed link, never
    /// stored server-side.
    pub token: String,
}

/// Invite a user into the active company. Requires member management.
pub async fn create_invitation(
    State(state): State<Arc<AppState>>,
    scope: CompanyScope,
    Json(body): Json<CreateInvitationRequest>,
) -> Result<Json<ApiResponse<CreateInvitationResponse>>, ApiError> {
    scope.require_permission("member:manage")?;

    if body.role == Role::Owner {
        return Err(ApiError::Validation(
            "ownership cannot be granted by invitation".into(),
        ));
    }

    let email = body.email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(ApiError::Validation("invalid email address".into()));
    }

    let token = generate_invitation_token();
    let invitation = Invitation {
        id: InvitationId::generate(),
        company_id: scope.company_id,
        email: email.clone(),
        role: body.role,
        token_hash: sha256_hex(&token),
        status: atelier_core::InvitationStatus::Pending,
        expires_at: Utc::now() + Duration::days(INVITATION_TTL_DAYS),
        created_at: Utc::now(),
    };
    state.store.create_invitation(&invitation).await?;

    // Invitation email delivery is best-effort; the returned token is
    // what the inviter can share directly.
    if let Some(mailer) = &state.mailer {
        let mailer = Arc::clone(mailer);
        let invited = email.clone();
        let emailed_token = token.clone();
        tokio::spawn(async move {
            let html = format!(
                "<p>You have been invited to join a company on Atelier.</p>\
                 <p>Your invitation code: <strong>{emailed_token}</strong></p>"
            );
            if let Err(e) = mailer.send(&invited, "You have been invited", &html).await {
                tracing::warn!(error = %e, "Failed to send invitation email");
            }
        });
    }

    Ok(ApiResponse::ok(
        "Invitation created",
        CreateInvitationResponse {
            invitation_id: invitation.id,
            token,
        },
    ))
}

/// Request body for accepting an invitation.
#[derive(Debug, Deserialize)]
pub struct AcceptInvitationRequest {
    /// The raw invitation token from the link.
    pub token: String,
}

/// Accept an invitation as the authenticated user.
pub async fn accept_invitation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<AcceptInvitationRequest>,
) -> Result<Json<ApiResponse<Membership>>, ApiError> {
    let membership = state
        .store
        .accept_invitation(&sha256_hex(&body.token), auth.user_id)
        .await
        .map_err(|e| match e {
            atelier_store::StoreError::NotFound { .. } => ApiError::NotFound(
                ErrorCode::InvitationNotFound,
                "invitation not found".into(),
            ),
            other => other.into(),
        })?;

    tracing::info!(
        user_id = %auth.user_id,
        company_id = %membership.company_id,
        "Invitation accepted"
    );
    Ok(ApiResponse::ok("Invitation accepted", membership))
}
