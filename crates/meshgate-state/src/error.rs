//! Error types for the storage layer

use meshgate_core::GatewayError;
use thiserror::Error;

/// Errors that can occur in storage operations
#[derive(Error, Debug)]
pub enum StateError {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Record not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored value could not be interpreted
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Duplicate entry
    #[error("Duplicate {entity}: {id}")]
    Duplicate { entity: String, id: String },

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Schema setup failed
    #[error("Migration error: {0}")]
    Migration(String),
}

impl StateError {
    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            StateError::Database(_) => "DATABASE_ERROR",
            StateError::NotFound { .. } => "NOT_FOUND",
            StateError::Serialization(_) => "SERIALIZATION_ERROR",
            StateError::InvalidData(_) => "INVALID_DATA",
            StateError::Duplicate { .. } => "DUPLICATE",
            StateError::Connection(_) => "CONNECTION_ERROR",
            StateError::Migration(_) => "MIGRATION_ERROR",
        }
    }
}

impl From<sqlx::Error> for StateError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StateError::NotFound {
                entity: "record".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::Database(db_err) => {
                if db_err.message().contains("UNIQUE constraint") {
                    StateError::Duplicate {
                        entity: "record".to_string(),
                        id: "unknown".to_string(),
                    }
                } else {
                    StateError::Database(db_err.to_string())
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StateError::Connection(err.to_string())
            }
            _ => StateError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

impl From<StateError> for GatewayError {
    fn from(err: StateError) -> Self {
        GatewayError::Persistence(err.to_string())
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StateError>;
