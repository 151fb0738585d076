//! Crate-wide error taxonomy.
//!
//! Validation and authorization failures are detected before any external
//! call and carry no side effects. Upstream failures name the collaborator
//! that failed so the caller can tell a retryable network error from a
//! business-rule rejection.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::{ApplicationStatus, BountyStatus};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    #[error("{0}")]
    Unauthorized(&'static str),

    /// Transition attempted from the wrong state. The current status is
    /// included so the client can resync.
    #[error("cannot {attempted} while bounty is {current}")]
    InvalidState {
        attempted: &'static str,
        current: BountyStatus,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("an application for this bounty already exists")]
    DuplicateApplication,

    #[error("bounty creator cannot apply to their own bounty")]
    SelfApplication,

    #[error("application already reviewed ({0})")]
    AlreadyReviewed(ApplicationStatus),

    #[error("application is not pending ({0})")]
    NotPending(ApplicationStatus),

    #[error("insufficient funds: balance {balance_stroops} stroops, reward {reward_stroops} stroops")]
    InsufficientFunds {
        balance_stroops: i64,
        reward_stroops: i64,
    },

    #[error("recipient account does not exist on the ledger: {0}")]
    RecipientUnresolvable(String),

    #[error("upstream issue creation failed: {0}")]
    UpstreamIssueCreationFailed(String),

    #[error("issue tracker request failed: {0}")]
    Tracker(String),

    #[error("ledger request failed: {0}")]
    Ledger(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Stable machine-readable kind, part of the API contract.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation_error",
            Error::Unauthorized(_) => "unauthorized",
            Error::InvalidState { .. } => "invalid_state",
            Error::NotFound { .. } => "not_found",
            Error::DuplicateApplication => "duplicate_application",
            Error::SelfApplication => "self_application",
            Error::AlreadyReviewed(_) => "already_reviewed",
            Error::NotPending(_) => "not_pending",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::RecipientUnresolvable(_) => "recipient_unresolvable",
            Error::UpstreamIssueCreationFailed(_) => "upstream_issue_creation_failed",
            Error::Tracker(_) => "tracker_failure",
            Error::Ledger(_) => "ledger_failure",
            Error::Internal(_) => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation { .. }
            | Error::SelfApplication
            | Error::InsufficientFunds { .. }
            | Error::RecipientUnresolvable(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,
            Error::InvalidState { .. }
            | Error::DuplicateApplication
            | Error::AlreadyReviewed(_)
            | Error::NotPending(_) => StatusCode::CONFLICT,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::UpstreamIssueCreationFailed(_) | Error::Tracker(_) | Error::Ledger(_) => {
                StatusCode::BAD_GATEWAY
            },
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("request failed: {self}");
        }
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
