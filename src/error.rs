//! Error types for the query front end

use thiserror::Error;

use crate::session::SessionId;

pub type Result<T> = std::result::Result<T, FrontendError>;

#[derive(Error, Debug)]
pub enum FrontendError {
    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    #[error("Cached table '{0}' already exists")]
    DuplicateName(String),

    #[error("Cached table '{0}' not found")]
    CacheEntryNotFound(String),

    #[error("Invalid value '{value}' for option '{key}': {reason}")]
    InvalidConfig {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrontendError {
    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            FrontendError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            FrontendError::DuplicateName(_) => "DUPLICATE_NAME",
            FrontendError::CacheEntryNotFound(_) => "CACHE_ENTRY_NOT_FOUND",
            FrontendError::InvalidConfig { .. } => "INVALID_CONFIG",
            FrontendError::InvalidTableName(_) => "INVALID_TABLE_NAME",
            FrontendError::Syntax(_) => "SYNTAX_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Registry errors come from bookkeeping (names, sessions), not from
    /// the statement's own input.
    pub fn is_registry_error(&self) -> bool {
        matches!(
            self,
            FrontendError::SessionNotFound(_)
                | FrontendError::DuplicateName(_)
                | FrontendError::CacheEntryNotFound(_)
        )
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_registry_codes() {
        assert_eq!(FrontendError::SessionNotFound(7).code(), "SESSION_NOT_FOUND");
        assert_eq!(FrontendError::DuplicateName("t".into()).code(), "DUPLICATE_NAME");
        assert_eq!(
            FrontendError::CacheEntryNotFound("t".into()).code(),
            "CACHE_ENTRY_NOT_FOUND"
        );
    }

    #[test]
    fn test_io_maps_to_internal() {
        let err = FrontendError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(!err.is_registry_error());
    }

    #[test]
    fn test_registry_classification() {
        assert!(FrontendError::DuplicateName("t".into()).is_registry_error());
        assert!(!FrontendError::Syntax("x".into()).is_registry_error());
    }
}
