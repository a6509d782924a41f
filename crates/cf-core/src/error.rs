//! # AppError
//!
//! Centralized error handling for the Civic-Fix engine.
//! Every variant is a recoverable outcome handed back to the caller.

use thiserror::Error;

use crate::models::IssueStatus;

/// The primary error type for all engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// The identity assertion could not be validated. Callers re-authenticate.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// A backing service (store, identity provider, gateway) could not be
    /// reached or timed out. Callers may retry.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The acting account is blocked by an administrator.
    #[error("account is blocked")]
    Blocked,

    /// Role or ownership does not permit the operation.
    #[error("forbidden")]
    Forbidden,

    /// Resource not found (e.g., Issue, User)
    #[error("{0} not found with ID {1}")]
    NotFound(String, String),

    /// Free-tier creation quota is used up; route the caller to the upgrade flow.
    #[error("issue quota of {limit} exhausted")]
    QuotaExceeded { limit: u32 },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: IssueStatus, to: IssueStatus },

    #[error("cannot upvote your own issue")]
    SelfUpvoteForbidden,

    #[error("already upvoted")]
    AlreadyVoted,

    #[error("no payment for session {0}")]
    PaymentNotFound(String),

    #[error("payment not verified: {0}")]
    PaymentNotVerified(String),

    /// Validation failure (e.g., empty note, empty title)
    #[error("validation error: {0}")]
    ValidationError(String),

    /// The requested state already holds (e.g., issue already boosted)
    #[error("conflict: {0}")]
    Conflict(String),
}

impl AppError {
    /// Stable machine-readable identifier, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidToken(_) => "invalid_token",
            Self::Unavailable(_) => "unavailable",
            Self::Blocked => "blocked",
            Self::Forbidden => "forbidden",
            Self::NotFound(..) => "not_found",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::SelfUpvoteForbidden => "self_upvote_forbidden",
            Self::AlreadyVoted => "already_voted",
            Self::PaymentNotFound(_) => "payment_not_found",
            Self::PaymentNotVerified(_) => "payment_not_verified",
            Self::ValidationError(_) => "validation_error",
            Self::Conflict(_) => "conflict",
        }
    }

    pub fn issue_not_found(id: impl ToString) -> Self {
        Self::NotFound("Issue".into(), id.to_string())
    }

    pub fn user_not_found(id: impl ToString) -> Self {
        Self::NotFound("User".into(), id.to_string())
    }
}

/// A specialized Result type for Civic-Fix logic.
pub type Result<T> = std::result::Result<T, AppError>;

/// Failure reported by an identity verifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("assertion rejected: {0}")]
    Invalid(String),
    #[error("identity provider unreachable: {0}")]
    Unavailable(String),
}

/// Failure reported by a payment gateway client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network failure, timeout or 5xx from the gateway.
    #[error("payment gateway unreachable: {0}")]
    Unavailable(String),
    /// The gateway refused the request outright.
    #[error("payment gateway rejected request: {0}")]
    Rejected(String),
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Invalid(msg) => Self::InvalidToken(msg),
            IdentityError::Unavailable(msg) => Self::Unavailable(msg),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(msg) => Self::Unavailable(msg),
            GatewayError::Rejected(msg) => Self::PaymentNotVerified(msg),
        }
    }
}
