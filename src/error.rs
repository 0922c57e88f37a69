//! Error types and their HTTP mapping

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::models::InvoiceStatus;

/// Persistence failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("corrupt record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the failure is a transient network condition worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Redis(e) => {
                e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_io_error()
            }
            StoreError::Serialization(_) => false,
            StoreError::Unavailable(_) => true,
        }
    }
}

/// Payment gateway failures
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("{0}")]
    NotFound(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("{0}")]
    Unsupported(String),
}

/// Errors surfaced by billing operations
#[derive(Error, Debug)]
pub enum BillingError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("Cannot {action} invoice in status {status}")]
    InvalidTransition {
        action: &'static str,
        status: InvoiceStatus,
    },

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl BillingError {
    pub fn not_found(message: impl Into<String>) -> Self {
        BillingError::NotFound(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        BillingError::Validation(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        BillingError::Forbidden(message.into())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        if let BillingError::Store(ref e) = self {
            if e.is_transient() {
                tracing::error!(error = %e, "store unavailable");
                let body = json!({
                    "message": "Database connection issue. Please try again in a moment.",
                    "error": "NETWORK_ERROR",
                    "retryable": true,
                });
                return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
            }
        }

        let status = match &self {
            BillingError::NotFound(_) => StatusCode::NOT_FOUND,
            BillingError::Conflict(_) => StatusCode::CONFLICT,
            BillingError::Validation(_) | BillingError::InvalidTransition { .. } => {
                StatusCode::BAD_REQUEST
            }
            BillingError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BillingError::Forbidden(_) => StatusCode::FORBIDDEN,
            BillingError::Gateway(GatewayError::NotFound(_)) => StatusCode::NOT_FOUND,
            BillingError::Gateway(GatewayError::Unsupported(_)) => StatusCode::BAD_REQUEST,
            BillingError::Gateway(_) => StatusCode::BAD_GATEWAY,
            BillingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}
