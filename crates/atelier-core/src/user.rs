//! Users, memberships, device sessions and signup verification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CompanyId, InvitationId, MembershipId, SessionId, UserId};

/// Maximum verification attempts before a code is burned.
pub const MAX_CODE_ATTEMPTS: i32 = 3;

/// A registered user. Immutable identity anchor created at signup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// The user ID.
    pub id: UserId,

    /// Unique login email.
    pub email: String,

    /// Argon2id password hash. Never exposed over the API.
    #[serde(skip_serializing, default)]
    pub password_hash: String,

    /// Whether the email was verified at signup.
    pub verified: bool,

    /// When the user was created.
    pub created_at: DateTime<Utc>,
}

/// Membership role inside a company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Company owner. Full control, exactly one per company.
    Owner,
    /// Administrator. Everything except ownership transfer.
    Admin,
    /// Regular member.
    Member,
}

impl Role {
    /// The wire representation of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }

    /// The permission snapshot baked into contextual access tokens.
    ///
    /// Permissions are captured at token issue time; a role change takes
    /// effect on the next contextual token request.
    #[must_use]
    pub fn default_permissions(self) -> Vec<String> {
        let perms: &[&str] = match self {
            Self::Owner => &[
                "company:manage",
                "billing:manage",
                "branch:manage",
                "member:manage",
                "onboarding:manage",
            ],
            Self::Admin => &["branch:manage", "member:manage", "onboarding:manage"],
            Self::Member => &["branch:read"],
        };
        perms.iter().map(ToString::to_string).collect()
    }
}

/// Status of a membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    /// Active member.
    Active,
    /// Invited but not yet accepted.
    Pending,
    /// Access revoked without deleting history.
    Disabled,
}

/// A (user, company) membership with its permission snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    /// The membership ID.
    pub id: MembershipId,
    /// The member.
    pub user_id: UserId,
    /// The company.
    pub company_id: CompanyId,
    /// Role inside the company.
    pub role: Role,
    /// Permission snapshot for contextual tokens.
    pub permissions: Vec<String>,
    /// Whether this member owns the company.
    pub is_owner: bool,
    /// Membership status.
    pub status: MembershipStatus,
    /// When the membership was created.
    pub created_at: DateTime<Utc>,
}

impl Membership {
    /// Create the owner membership for a freshly created company.
    #[must_use]
    pub fn owner(user_id: UserId, company_id: CompanyId) -> Self {
        Self {
            id: MembershipId::generate(),
            user_id,
            company_id,
            role: Role::Owner,
            permissions: Role::Owner.default_permissions(),
            is_owner: true,
            status: MembershipStatus::Active,
            created_at: Utc::now(),
        }
    }
}

/// A per-device session row.
///
/// Exactly one non-revoked row exists per (user, fingerprint). The raw
/// refresh token never touches storage; only its SHA-256 hash does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// The session ID.
    pub id: SessionId,
    /// The session owner.
    pub user_id: UserId,
    /// Client-generated device fingerprint.
    pub fingerprint: String,
    /// SHA-256 hex of the current refresh token.
    pub refresh_token_hash: String,
    /// Set when the session is dead; rows are kept for audit.
    pub revoked: bool,
    /// Hard expiry of the refresh token.
    pub expires_at: DateTime<Utc>,
    /// Last authenticated request seen on this session.
    pub last_activity_at: DateTime<Utc>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Whether the session can still be refreshed.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// What a verification code authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPurpose {
    /// Email ownership proof during signup.
    Signup,
}

impl VerificationPurpose {
    /// The wire representation of the purpose.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Signup => "signup",
        }
    }
}

/// A one-time email verification code, hashed at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCode {
    /// Target email address.
    pub email: String,
    /// What the code authorizes.
    pub purpose: VerificationPurpose,
    /// SHA-256 hex of the 6-digit code.
    pub code_hash: String,
    /// Failed verification attempts so far.
    pub attempts: i32,
    /// Expiry; codes are short-lived.
    pub expires_at: DateTime<Utc>,
    /// When the code was issued.
    pub created_at: DateTime<Utc>,
}

impl VerificationCode {
    /// Whether the code can still be presented.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.attempts < MAX_CODE_ATTEMPTS && self.expires_at > now
    }
}

/// Status of a membership invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    /// Waiting for the invitee.
    Pending,
    /// Accepted; a membership exists.
    Accepted,
    /// Expired or withdrawn.
    Revoked,
}

/// A token-addressed invitation to join a company.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    /// The invitation ID.
    pub id: InvitationId,
    /// Target company.
    pub company_id: CompanyId,
    /// Invitee email.
    pub email: String,
    /// Role granted on acceptance.
    pub role: Role,
    /// SHA-256 hex of the invitation token.
    pub token_hash: String,
    /// Invitation status.
    pub status: InvitationStatus,
    /// Expiry of the invitation link.
    pub expires_at: DateTime<Utc>,
    /// When the invitation was created.
    pub created_at: DateTime<Utc>,
}
