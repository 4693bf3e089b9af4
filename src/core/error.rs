use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unknown identifier {ids:?} for {type_name}")]
    InvalidObjectIdentifier { type_name: String, ids: Vec<String> },

    #[error("Unknown attribute '{field}' in '{type_name}'")]
    InvalidAttribute { type_name: String, field: String },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),

    #[error("Duplicate mapping: {0}")]
    DuplicateMapping(String),

    #[error("Type '{0}' is not bound")]
    UnboundType(String),

    #[error("Invalid permission: {0}")]
    InvalidPermission(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Transaction cancelled: {0}")]
    TransactionCancelled(String),

    #[error("Backend error: {0}")]
    Backend(#[from] anyhow::Error),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, GateError>;

impl GateError {
    pub fn invalid_id(type_name: &str, id: impl Into<String>) -> Self {
        Self::InvalidObjectIdentifier {
            type_name: type_name.to_string(),
            ids: vec![id.into()],
        }
    }

    pub fn invalid_attribute(type_name: &str, field: &str) -> Self {
        Self::InvalidAttribute {
            type_name: type_name.to_string(),
            field: field.to_string(),
        }
    }

    /// HTTP-like status used by the error mapper.
    pub fn status(&self) -> u16 {
        match self {
            Self::Forbidden(_) => 403,
            Self::InvalidObjectIdentifier { .. } | Self::InvalidAttribute { .. } => 404,
            Self::InvalidValue(_) | Self::BadRequest(_) => 400,
            Self::TransactionCancelled(_) => 409,
            Self::InternalServerError(_)
            | Self::DuplicateMapping(_)
            | Self::UnboundType(_)
            | Self::InvalidPermission(_)
            | Self::InvalidConfiguration(_)
            | Self::Backend(_)
            | Self::LockError(_) => 500,
        }
    }

    /// Errors that collection filtering turns into "drop this element".
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Forbidden(_) | Self::InvalidObjectIdentifier { .. })
    }

    /// Whether the error belongs to the user-facing taxonomy. Anything else
    /// is reported as an internal server error.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Forbidden(_)
                | Self::InvalidObjectIdentifier { .. }
                | Self::InvalidAttribute { .. }
                | Self::InvalidValue(_)
                | Self::BadRequest(_)
                | Self::TransactionCancelled(_)
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for GateError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GateError::Forbidden("x".into()).status(), 403);
        assert_eq!(GateError::invalid_id("book", "1").status(), 404);
        assert_eq!(GateError::BadRequest("x".into()).status(), 400);
        assert_eq!(GateError::DuplicateMapping("x".into()).status(), 500);
    }

    #[test]
    fn test_skippable_errors() {
        assert!(GateError::Forbidden("x".into()).is_skippable());
        assert!(GateError::invalid_id("book", "1").is_skippable());
        assert!(!GateError::invalid_attribute("book", "title").is_skippable());
    }

    #[test]
    fn test_invalid_identifier_lists_ids() {
        let err = GateError::InvalidObjectIdentifier {
            type_name: "book".into(),
            ids: vec!["3".into(), "7".into()],
        };
        assert_eq!(err.to_string(), "Unknown identifier [\"3\", \"7\"] for book");
    }
}
