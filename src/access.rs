//! Authorization for decrypt and administrative operations.
//!
//! Roles are a closed enumeration. Administrators may read any tenant's
//! records; operators only the warehouse they belong to. The decision is
//! made in one place instead of string comparisons scattered through
//! call sites.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::LedgerError;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "operator" => Ok(Role::Operator),
            other => Err(anyhow!("unknown role: {}", other)),
        }
    }
}

/// The authenticated caller, as established by the session collaborator.
/// `warehouse_id` is the tenant the caller belongs to; administrators may
/// have none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
    pub role: Role,
    pub warehouse_id: Option<i64>,
}

impl Principal {
    pub fn admin(user_id: i64) -> Self {
        Self {
            user_id,
            role: Role::Admin,
            warehouse_id: None,
        }
    }

    pub fn operator(user_id: i64, warehouse_id: i64) -> Self {
        Self {
            user_id,
            role: Role::Operator,
            warehouse_id: Some(warehouse_id),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub struct AccessGate;

impl AccessGate {
    /// Allow if the principal is an administrator, or an operator whose
    /// tenant owns the record. Everything else is
    /// [`LedgerError::Forbidden`].
    pub fn authorize(principal: &Principal, owning_warehouse: i64) -> Result<()> {
        match principal.role {
            Role::Admin => Ok(()),
            Role::Operator => {
                if principal.warehouse_id == Some(owning_warehouse) {
                    Ok(())
                } else {
                    Err(LedgerError::Forbidden.into())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_reads_any_tenant() {
        let admin = Principal::admin(1);
        assert!(AccessGate::authorize(&admin, 1).is_ok());
        assert!(AccessGate::authorize(&admin, 99).is_ok());
    }

    #[test]
    fn operator_bound_to_own_warehouse() {
        let operator = Principal::operator(2, 5);
        assert!(AccessGate::authorize(&operator, 5).is_ok());

        let err = AccessGate::authorize(&operator, 6).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::Forbidden)
        ));
    }

    #[test]
    fn operator_without_tenant_is_denied() {
        let stray = Principal {
            user_id: 3,
            role: Role::Operator,
            warehouse_id: None,
        };
        assert!(AccessGate::authorize(&stray, 1).is_err());
    }

    #[test]
    fn role_parses_case_insensitively() -> Result<()> {
        assert_eq!("Admin".parse::<Role>()?, Role::Admin);
        assert_eq!(" operator ".parse::<Role>()?, Role::Operator);
        assert!("gudang".parse::<Role>().is_err());
        Ok(())
    }
}
