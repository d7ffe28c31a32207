//! Error types for mailtrack.
//!
//! Three families, matching the three places a failure can come from:
//!
//! - [`MailError`] - synchronous request-path failures, surfaced to callers.
//! - [`StoreError`] - signals from the relational, event, or blob collaborators.
//! - [`DeliveryError`] - signals from the mail transport, classified as
//!   retryable or terminal.

use thiserror::Error;

use crate::identifier::Entity;

/// Errors surfaced on the synchronous request path.
#[derive(Debug, Clone, Error)]
pub enum MailError {
    /// Malformed input, reported with the offending field.
    #[error("Invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    /// Invalid email address format.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// No unique public key could be found within the retry budget.
    #[error("Could not issue a unique {entity} key after {attempts} attempts")]
    IdentifierExhausted { entity: Entity, attempts: u32 },

    /// A storage collaborator refused the write or read.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// The job queue could not accept a delivery job.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// The addressed record does not exist.
    #[error("{entity} not found: {key}")]
    NotFound { entity: Entity, key: String },

    /// Configuration error (missing env var, invalid value, disabled feature).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Blob storage failure on the upload path.
    #[error("Blob storage error: {0}")]
    Blob(String),
}

impl MailError {
    /// Create a validation error for a field.
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(entity: Entity, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// HTTP status code this error maps to at the API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::InvalidAddress(_) => 400,
            Self::Storage(StoreError::MissingReference { .. }) => 400,
            Self::NotFound { .. } => 404,
            Self::Dispatch(_) => 503,
            Self::IdentifierExhausted { .. }
            | Self::Storage(_)
            | Self::Configuration(_)
            | Self::Blob(_) => 500,
        }
    }

    /// The field name for validation-type errors.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            Self::InvalidAddress(_) => Some("address"),
            Self::Storage(StoreError::MissingReference { .. }) => Some("attachment_ids"),
            _ => None,
        }
    }
}

/// Errors reported by storage collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("Duplicate {entity} key: {key}")]
    UniqueViolation { entity: Entity, key: String },

    /// A referenced row does not exist (e.g. an unknown attachment id).
    #[error("{entity} {id} does not exist")]
    MissingReference { entity: Entity, id: i64 },

    /// The row to update or delete does not exist.
    #[error("Record not found")]
    NotFound,

    /// The backend is unreachable or refused the operation.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether this is a uniqueness-constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }
}

/// A failed delivery attempt, as classified by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Network trouble, timeouts, 4xx replies. Worth another attempt.
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// Rejected recipient, 5xx replies, malformed message. Never retried.
    #[error("Terminal delivery failure: {0}")]
    Terminal(String),
}

impl DeliveryError {
    /// Whether the worker should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<MailError> for DeliveryError {
    /// Payload problems (bad addresses, missing fields) never fix themselves.
    fn from(err: MailError) -> Self {
        Self::Terminal(err.to_string())
    }
}

impl From<serde_json::Error> for MailError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation("body", err.to_string())
    }
}

#[cfg(feature = "smtp")]
impl From<lettre::error::Error> for DeliveryError {
    fn from(err: lettre::error::Error) -> Self {
        Self::Terminal(err.to_string())
    }
}

#[cfg(feature = "smtp")]
impl From<lettre::transport::smtp::Error> for DeliveryError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        if err.is_permanent() {
            Self::Terminal(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

#[cfg(feature = "smtp")]
impl From<lettre::address::AddressError> for DeliveryError {
    fn from(err: lettre::address::AddressError) -> Self {
        Self::Terminal(format!("invalid address: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(MailError::validation("subject", "empty").status_code(), 400);
        assert_eq!(MailError::not_found(Entity::Mail, "abc").status_code(), 404);
        assert_eq!(
            MailError::IdentifierExhausted {
                entity: Entity::Mail,
                attempts: 10
            }
            .status_code(),
            500
        );
        assert_eq!(MailError::Dispatch("closed".into()).status_code(), 503);
        assert_eq!(
            MailError::Storage(StoreError::MissingReference {
                entity: Entity::Attachment,
                id: 7
            })
            .status_code(),
            400
        );
    }

    #[test]
    fn test_delivery_classification() {
        assert!(DeliveryError::Transient("timeout".into()).is_retryable());
        assert!(!DeliveryError::Terminal("550 no such user".into()).is_retryable());

        let from_payload: DeliveryError = MailError::InvalidAddress("x".into()).into();
        assert!(!from_payload.is_retryable());
    }

    #[test]
    fn test_validation_message() {
        let err = MailError::validation("recipient", "is required");
        assert_eq!(err.to_string(), "Invalid recipient: is required");
        assert_eq!(err.field(), Some("recipient"));
    }
}
