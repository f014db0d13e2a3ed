//! Stable machine-readable error codes.
//!
//! Every JSON response carries an optional `code` field that clients branch
//! on. Codes are part of the API contract and must never be renamed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable discriminators carried in API envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum ErrorCode {
    // Validation / input
    ValidationError,
    InvalidRange,

    // Authentication
    NotAuthenticated,
    AccessTokenExpiredOrInvalid,
    WrongPassword,
    SessionExpired,
    RefreshTokenReused,
    OriginNotAllowed,
    RateLimited,
    InvalidCode,
    CodeExpired,
    TooManyAttempts,

    // Lookup / authorization
    UserFound,
    UserNotFound,
    CompanyNotFound,
    MembershipNotFound,
    BranchNotFound,
    PlanNotFound,
    PluginNotFound,
    InvitationNotFound,

    // Onboarding / billing state
    OnboardingIncomplete,
    OnboardingAlreadyCompleted,
    OnboardingPaymentRequired,
    SubscriptionNotFound,
    PlanChangeNotAllowed,

    // Infrastructure
    DbError,
    StripeError,
    EmailError,
    ServerError,
}

impl ErrorCode {
    /// The wire representation of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InvalidRange => "INVALID_RANGE",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::AccessTokenExpiredOrInvalid => "ACCESS_TOKEN_EXPIRED_OR_INVALID",
            Self::WrongPassword => "WRONG_PASSWORD",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::RefreshTokenReused => "REFRESH_TOKEN_REUSED",
            Self::OriginNotAllowed => "ORIGIN_NOT_ALLOWED",
            Self::RateLimited => "RATE_LIMITED",
            Self::InvalidCode => "INVALID_CODE",
            Self::CodeExpired => "CODE_EXPIRED",
            Self::TooManyAttempts => "TOO_MANY_ATTEMPTS",
            Self::UserFound => "USER_FOUND",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::CompanyNotFound => "COMPANY_NOT_FOUND",
            Self::MembershipNotFound => "MEMBERSHIP_NOT_FOUND",
            Self::BranchNotFound => "BRANCH_NOT_FOUND",
            Self::PlanNotFound => "PLAN_NOT_FOUND",
            Self::PluginNotFound => "PLUGIN_NOT_FOUND",
            Self::InvitationNotFound => "INVITATION_NOT_FOUND",
            Self::OnboardingIncomplete => "ONBOARDING_INCOMPLETE",
            Self::OnboardingAlreadyCompleted => "ONBOARDING_ALREADY_COMPLETED",
            Self::OnboardingPaymentRequired => "ONBOARDING_PAYMENT_REQUIRED",
            Self::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
            Self::PlanChangeNotAllowed => "PLAN_CHANGE_NOT_ALLOWED",
            Self::DbError => "DB_ERROR",
            Self::StripeError => "STRIPE_ERROR",
            Self::EmailError => "EMAIL_ERROR",
            Self::ServerError => "SERVER_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::AccessTokenExpiredOrInvalid).unwrap();
        assert_eq!(json, "\"ACCESS_TOKEN_EXPIRED_OR_INVALID\"");
    }

    #[test]
    fn as_str_matches_serde() {
        for code in [
            ErrorCode::ValidationError,
            ErrorCode::WrongPassword,
            ErrorCode::OnboardingPaymentRequired,
            ErrorCode::DbError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }
}
