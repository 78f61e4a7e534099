//! Error handling for the faucet server.

use crate::eth::TransferKind;
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Faucet server error types
#[derive(Error, Debug)]
pub enum FaucetError {
    #[error("Invalid recipient address: {0}")]
    InvalidAddress(String),

    #[error("The client address is missing")]
    ClientUnidentified,

    #[error("You have exceeded the rate limit. Please wait {}s before you try again", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("Captcha verification failed, please try again")]
    CaptchaRejected,

    #[error("{kind} transfer failed: {reason}")]
    Transfer { kind: TransferKind, reason: String },

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            FaucetError::InvalidAddress(_) | FaucetError::ClientUnidentified => {
                StatusCode::BAD_REQUEST
            }
            FaucetError::RateLimited { .. } | FaucetError::CaptchaRejected => {
                StatusCode::TOO_MANY_REQUESTS
            }
            FaucetError::Transfer { .. }
            | FaucetError::Gateway(_)
            | FaucetError::Config(_)
            | FaucetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });
        if let FaucetError::RateLimited { retry_after } = &self {
            body["retry_after_secs"] = json!(retry_after.as_secs().max(1));
        }

        (status, Json(body)).into_response()
    }
}

/// Result type alias for faucet operations
pub type FaucetResult<T> = Result<T, FaucetError>;
