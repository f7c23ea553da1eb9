//! Store error types
//!
//! Every store operation returns [`StoreError`]. Callers branch on
//! [`StoreError::is_not_found`] versus database failures; crypto failures are
//! carried through untranslated.

use crate::crypto::CryptoError;
use thiserror::Error;
use tracing::{debug, error};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreErrorKind {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("foreign key constraint violated: {message}")]
    ForeignKeyViolation { message: String },

    #[error("database connection failed: {message}")]
    Connection { message: String },

    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("migration step '{step}' failed: {message}")]
    Migration { step: &'static str, message: String },

    #[error("database error: {message}")]
    Unknown { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind) -> Self {
        Self { kind }
    }

    pub fn not_found(entity: &'static str) -> Self {
        debug!(entity, "No matching row");
        Self::new(StoreErrorKind::NotFound { entity })
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::InvalidInput {
            message: message.into(),
        })
    }

    /// Classify a driver error.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if !matches!(err, sqlx::Error::RowNotFound) {
            error!(error = %err, "Database operation failed");
        }

        let kind = match err {
            sqlx::Error::RowNotFound => StoreErrorKind::NotFound { entity: "row" },
            sqlx::Error::PoolTimedOut => StoreErrorKind::PoolTimeout,
            sqlx::Error::PoolClosed => StoreErrorKind::Connection {
                message: "pool closed".to_string(),
            },
            sqlx::Error::Io(e) => StoreErrorKind::Connection {
                message: e.to_string(),
            },
            sqlx::Error::Tls(e) => StoreErrorKind::Connection {
                message: e.to_string(),
            },
            sqlx::Error::Database(db_err) => match db_err.kind() {
                sqlx::error::ErrorKind::UniqueViolation => StoreErrorKind::UniqueViolation {
                    constraint: db_err
                        .constraint()
                        .map(str::to_string)
                        .unwrap_or_else(|| db_err.message().to_string()),
                },
                sqlx::error::ErrorKind::ForeignKeyViolation => {
                    StoreErrorKind::ForeignKeyViolation {
                        message: db_err.message().to_string(),
                    }
                }
                _ => StoreErrorKind::Unknown {
                    message: db_err.message().to_string(),
                },
            },
            other => StoreErrorKind::Unknown {
                message: other.to_string(),
            },
        };

        Self { kind }
    }

    /// Attach the entity name to a bare row-not-found.
    pub fn for_entity(mut self, entity: &'static str) -> Self {
        if let StoreErrorKind::NotFound { .. } = self.kind {
            self.kind = StoreErrorKind::NotFound { entity };
        }
        self
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, StoreErrorKind::NotFound { .. })
    }

    /// Connectivity, constraint or driver failure.
    pub fn is_database_error(&self) -> bool {
        !matches!(
            self.kind,
            StoreErrorKind::NotFound { .. }
                | StoreErrorKind::Crypto(_)
                | StoreErrorKind::InvalidInput { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            StoreErrorKind::Connection { .. } | StoreErrorKind::PoolTimeout
        )
    }

    /// Suggested HTTP status for callers that expose the store over HTTP.
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            StoreErrorKind::NotFound { .. } => 404,
            StoreErrorKind::UniqueViolation { .. } => 409,
            StoreErrorKind::InvalidInput { .. } => 400,
            StoreErrorKind::PoolTimeout | StoreErrorKind::Connection { .. } => 503,
            _ => 500,
        }
    }
}

impl From<CryptoError> for StoreError {
    fn from(err: CryptoError) -> Self {
        Self::new(StoreErrorKind::Crypto(err))
    }
}
