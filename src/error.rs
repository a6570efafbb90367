// =============================================================================
// Error taxonomy — closed set surfaced over HTTP
// =============================================================================
//
// Every fallible operation in the game core resolves to one of these kinds.
// The HTTP boundary maps each kind to a status code and a stable machine code;
// handlers never leak internal error text except through `Internal`, which is
// logged with a correlation id that the client can quote back.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::game::rules::TradeRejection;

/// The closed error set of the game core.
#[derive(Debug, Error)]
pub enum GameError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Rule(TradeRejection),
    #[error("{0}")]
    InsufficientData(String),
    #[error("{0}")]
    OutOfRange(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("request deadline exceeded")]
    Timeout,
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl From<TradeRejection> for GameError {
    fn from(reason: TradeRejection) -> Self {
        Self::Rule(reason)
    }
}

impl GameError {
    /// Stable machine code for the client.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            // Duplicate same-day trades are a conflict on the ledger, not a
            // rule failure, and clients are told so.
            Self::Rule(TradeRejection::DuplicateSameDay) | Self::Conflict(_) => "CONFLICT",
            Self::Validation(_) => "VALIDATION",
            Self::Rule(_) => "RULE_VIOLATION",
            Self::InsufficientData(_) => "INSUFFICIENT_DATA",
            Self::OutOfRange(_) => "OUT_OF_RANGE",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Rule(TradeRejection::DuplicateSameDay) | Self::Conflict(_) => {
                StatusCode::CONFLICT
            }
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Rule(_) | Self::InsufficientData(_) | Self::OutOfRange(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GameError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let body = match &self {
            Self::Rule(reason) => json!({
                "error": {
                    "code": code,
                    "reason": reason.code(),
                    "message": reason.to_string(),
                }
            }),
            Self::Internal(source) => {
                let correlation_id = uuid::Uuid::new_v4().to_string();
                error!(correlation_id = %correlation_id, error = %source, "internal error");
                json!({
                    "error": {
                        "code": code,
                        "message": "internal error",
                        "correlation_id": correlation_id,
                    }
                })
            }
            other => json!({
                "error": {
                    "code": code,
                    "message": other.to_string(),
                }
            }),
        };

        (status, Json(body)).into_response()
    }
}
