//! Engine error taxonomy.
//!
//! Every public operation returns [`DamError`].  Stores and blob backends
//! work in `anyhow::Result`; a typed `DamError` raised deep inside a store
//! (for example a refused version commit) survives the trip through
//! `anyhow` and is recovered by the `From<anyhow::Error>` conversion.

use thiserror::Error;

/// Result alias used by engine operations.
pub type DamResult<T> = Result<T, DamError>;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum DamError {
    /// No valid identity could be resolved from the presented credential.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// The identity lacks the required `resource:action` permission.
    #[error("permission denied: {resource}:{action} is required")]
    Authorization { resource: String, action: String },

    /// An asset, version, user or token does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// A share link or reset token is past its expiry.
    #[error("{kind} has expired")]
    ExpiredCredential { kind: String },

    /// The blob store is unreachable or refused a write.
    #[error("blob storage failure: {message}")]
    Storage { message: String },

    /// A unique field collided, or a version number was already assigned.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Malformed operation parameters.
    #[error("invalid request: {message}")]
    Validation { message: String },

    /// Unexpected store fault.
    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

impl DamError {
    pub fn authentication(message: impl Into<String>) -> Self {
        DamError::Authentication {
            message: message.into(),
        }
    }

    pub fn authorization(resource: &str, action: &str) -> Self {
        DamError::Authorization {
            resource: resource.to_string(),
            action: action.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        DamError::NotFound { what: what.into() }
    }

    pub fn expired(kind: impl Into<String>) -> Self {
        DamError::ExpiredCredential { kind: kind.into() }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        DamError::Storage {
            message: err.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        DamError::Conflict {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        DamError::Validation {
            message: message.into(),
        }
    }

    /// Stable error code string, suitable for an outer API layer.
    pub fn code(&self) -> &'static str {
        match self {
            DamError::Authentication { .. } => "AuthenticationError",
            DamError::Authorization { .. } => "AuthorizationError",
            DamError::NotFound { .. } => "NotFoundError",
            DamError::ExpiredCredential { .. } => "ExpiredCredentialError",
            DamError::Storage { .. } => "StorageError",
            DamError::Conflict { .. } => "ConflictError",
            DamError::Validation { .. } => "ValidationError",
            DamError::Internal(_) => "InternalError",
        }
    }
}

impl From<anyhow::Error> for DamError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<DamError>() {
            Ok(typed) => typed,
            Err(other) => DamError::Internal(other),
        }
    }
}

impl From<garde::Report> for DamError {
    fn from(report: garde::Report) -> Self {
        DamError::Validation {
            message: report.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_error_survives_anyhow() {
        let wrapped: anyhow::Error = DamError::conflict("version 2 already assigned").into();
        let back: DamError = wrapped.into();
        assert_eq!(back.code(), "ConflictError");
    }

    #[test]
    fn test_untyped_error_is_internal() {
        let back: DamError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(back.code(), "InternalError");
        assert!(back.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_authorization_message_names_permission() {
        let err = DamError::authorization("asset", "delete");
        assert_eq!(err.to_string(), "permission denied: asset:delete is required");
    }
}
