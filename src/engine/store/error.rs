//! Store Error Types

use thiserror::Error;

use super::blob::BlobError;
use crate::engine::database::DatabaseError;

/// Outcome codes, modelled on HTTP statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 200,
    Created = 201,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
    Conflict = 409,
    Internal = 500,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn is_successful(self) -> bool {
        self.code() < 300
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),
}

impl StoreError {
    /// Classify into the status taxonomy; engine failures are all Internal
    pub fn status(&self) -> Status {
        match self {
            StoreError::BadRequest(_) => Status::BadRequest,
            StoreError::NotFound(_) => Status::NotFound,
            StoreError::Conflict(_) => Status::Conflict,
            StoreError::Forbidden(_) => Status::Forbidden,
            StoreError::Internal(_)
            | StoreError::Database(_)
            | StoreError::Sqlite(_)
            | StoreError::Pool(_)
            | StoreError::Json(_)
            | StoreError::Blob(_) => Status::Internal,
        }
    }

    pub(crate) fn bad_request(msg: impl Into<String>) -> Self {
        StoreError::BadRequest(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        StoreError::NotFound(msg.into())
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        StoreError::Conflict(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(StoreError::conflict("x").status(), Status::Conflict);
        assert_eq!(
            StoreError::Database(DatabaseError::RolledBack).status(),
            Status::Internal
        );
        assert_eq!(Status::Created.code(), 201);
        assert!(Status::Ok.is_successful());
        assert!(!Status::NotFound.is_successful());
    }
}
