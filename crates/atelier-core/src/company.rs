//! Companies (tenants) and their branches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BranchId, CompanyId};

/// A tenant company. One owner user, many members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    /// The company ID.
    pub id: CompanyId,
    /// Display name.
    pub name: String,
    /// Contact phone.
    pub phone: Option<String>,
    /// Stripe customer id, set once billing is touched.
    pub stripe_customer_id: Option<String>,
    /// When the company was created.
    pub created_at: DateTime<Utc>,
}

impl Company {
    /// Create a new company.
    #[must_use]
    pub fn new(name: impl Into<String>, phone: Option<String>) -> Self {
        Self {
            id: CompanyId::generate(),
            name: name.into(),
            phone,
            stripe_customer_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A branch of a company. Exactly one branch per company is `is_main`
/// once onboarding completes; plugins are scoped per branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// The branch ID.
    pub id: BranchId,
    /// Owning company.
    pub company_id: CompanyId,
    /// Display name.
    pub name: String,
    /// Whether this is the company's main branch.
    pub is_main: bool,
    /// When the branch was created.
    pub created_at: DateTime<Utc>,
}

impl Branch {
    /// Create a branch for a company.
    #[must_use]
    pub fn new(company_id: CompanyId, name: impl Into<String>, is_main: bool) -> Self {
        Self {
            id: BranchId::generate(),
            company_id,
            name: name.into(),
            is_main,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_company_has_no_stripe_customer() {
        let company = Company::new("Acme Atelier", Some("+30 210 0000000".into()));
        assert!(company.stripe_customer_id.is_none());
        assert_eq!(company.name, "Acme Atelier");
    }

    #[test]
    fn main_branch_flag() {
        let company = Company::new("Acme", None);
        let main = Branch::new(company.id, "Acme", true);
        let extra = Branch::new(company.id, "Acme #2", false);
        assert!(main.is_main);
        assert!(!extra.is_main);
        assert_eq!(main.company_id, extra.company_id);
    }
}
