pub mod events;
pub mod gateway;
pub mod money;
pub mod status;
pub mod transition;

use rust_decimal::Decimal;

pub use transition::{ensure_transition, Lifecycle};

/// Rejections caused by the request itself. Nothing is persisted when one
/// of these is raised and the caller may correct the input and retry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Illegal {machine} transition from {from} to {to}")]
    IllegalTransition {
        machine: &'static str,
        from: String,
        to: String,
    },
    #[error("Cannot move to {to}: {reason}")]
    GuardFailed { to: String, reason: String },
    #[error("Cannot {operation} {requested} unit(s): only {available} available")]
    QuantityExceeded {
        operation: &'static str,
        requested: u32,
        available: u32,
    },
    #[error("Amount {requested} exceeds available balance {available}")]
    AmountExceeded { requested: Decimal, available: Decimal },
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Refund {0} before applying this change")]
    RefundRequired(Decimal),
    #[error("Unknown {kind}: {value}")]
    UnknownValue { kind: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("Concurrent modification of {entity} {id}, reload and retry")]
    Conflict { entity: &'static str, id: String },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("External service failure: {0}")]
    External(String),
    #[error("Invariant violated: {0}")]
    FatalInvariant(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl ToString) -> Self {
        CoreError::Conflict {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CoreError::Conflict { .. })
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
