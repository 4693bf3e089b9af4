use serde::{Deserialize, Serialize};
use tracing::error;

use crate::core::GateError;

/// Serializable error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub errors: Vec<String>,
}

impl ErrorResponse {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            errors: vec![message.into()],
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"status\":{}}}", self.status))
    }
}

/// Turns any error escaping a request into a response.
pub trait ErrorMapper: Send + Sync {
    fn map(&self, error: &GateError, verbose: bool) -> ErrorResponse;
}

#[derive(Debug, Default)]
pub struct DefaultErrorMapper;

impl ErrorMapper for DefaultErrorMapper {
    fn map(&self, error: &GateError, verbose: bool) -> ErrorResponse {
        if !error.is_user_facing() {
            error!(error = %error, "internal server error");
            let message = if verbose {
                error.to_string()
            } else {
                "Internal server error".to_string()
            };
            return ErrorResponse::new(500, message);
        }

        let message = if verbose {
            error.to_string()
        } else {
            terse_message(error).to_string()
        };
        ErrorResponse::new(error.status(), message)
    }
}

fn terse_message(error: &GateError) -> &'static str {
    match error {
        GateError::Forbidden(_) => "Forbidden",
        GateError::InvalidObjectIdentifier { .. } => "Unknown identifier",
        GateError::InvalidAttribute { .. } => "Unknown attribute",
        GateError::InvalidValue(_) => "Invalid value",
        GateError::TransactionCancelled(_) => "Request cancelled",
        _ => "Bad request",
    }
}
