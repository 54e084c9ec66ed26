//! Role-based access decisions.
//!
//! `authorize` only answers whether a role may attempt an operation at all.
//! Ownership ("own orders only") is checked against the order record by the
//! service once it has been read.

use std::fmt;

use crate::error::{DispatchError, DispatchResult};
use crate::types::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Claim,
    Complete,
    ListPending,
    ListOwn,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create orders",
            Operation::Claim => "claim orders",
            Operation::Complete => "complete orders",
            Operation::ListPending => "list pending orders",
            Operation::ListOwn => "list own orders",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

pub struct AccessGuard;

impl AccessGuard {
    pub fn authorize(role: Role, operation: Operation) -> Decision {
        let allowed = match role {
            Role::Requester => matches!(operation, Operation::Create | Operation::ListOwn),
            Role::Agent => matches!(
                operation,
                Operation::Claim | Operation::Complete | Operation::ListPending | Operation::ListOwn
            ),
            Role::Recipient => matches!(operation, Operation::ListOwn),
        };

        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    /// Like [`AccessGuard::authorize`] but yields `AuthorizationError` on deny.
    pub fn ensure(role: Role, operation: Operation) -> DispatchResult<()> {
        match Self::authorize(role, operation) {
            Decision::Allow => Ok(()),
            Decision::Deny => {
                tracing::warn!(%role, %operation, "operation denied");
                Err(DispatchError::denied(role, operation.as_str()))
            }
        }
    }
}
