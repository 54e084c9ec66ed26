use thiserror::Error;

use crate::types::{OrderId, OrderStatus, Role};

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("role '{role}' is not allowed to {operation}")]
    Authorization { role: Role, operation: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("no profile is registered for this actor")]
    ProfileRequired,

    #[error("actor already has a profile")]
    DuplicateProfile,

    #[error("account is registered as '{actual}', not '{declared}'")]
    RoleMismatch { declared: Role, actual: Role },

    #[error("order {0} was already claimed by another agent")]
    AlreadyClaimed(OrderId),

    #[error("order {order_id} cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("order {0} is held by another agent")]
    NotYourOrder(OrderId),

    /// Conditional write lost a race. Consumed by the arbiter and the
    /// lifecycle engine; callers of the service never see it.
    #[error("order {order_id} changed concurrently (now '{current}')")]
    Conflict {
        order_id: OrderId,
        current: OrderStatus,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl DispatchError {
    /// Stable machine-readable kind, used by transports.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "validation_error",
            DispatchError::Authorization { .. } => "authorization_error",
            DispatchError::NotFound { .. } => "not_found",
            DispatchError::ProfileRequired => "profile_required",
            DispatchError::DuplicateProfile => "duplicate_profile",
            DispatchError::RoleMismatch { .. } => "role_mismatch",
            DispatchError::AlreadyClaimed(_) => "already_claimed",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::NotYourOrder(_) => "not_your_order",
            DispatchError::Conflict { .. } => "conflict",
            DispatchError::Unavailable(_) => "unavailable",
        }
    }

    pub fn order_not_found(id: OrderId) -> Self {
        DispatchError::NotFound {
            entity: "order",
            id: id.to_string(),
        }
    }

    pub fn denied(role: Role, operation: impl Into<String>) -> Self {
        DispatchError::Authorization {
            role,
            operation: operation.into(),
        }
    }
}
