use thiserror::Error;

use toolcrib_core::store::StorageError;

pub mod request;

pub use request::SqlRequestStorage;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StorageError {
    fn from(value: RepositoryError) -> Self {
        StorageError::Backend(value.to_string())
    }
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.is_unique_violation())
}
