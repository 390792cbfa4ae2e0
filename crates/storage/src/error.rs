use thiserror::Error;

/// An error from an operation on a `ContentStore`.
#[derive(Debug, Error)]
pub enum ContentStoreError {
    #[error("An error from the underlying database: {0}")]
    Database(String),

    #[error("Invalid content key: {0}")]
    InvalidContentKey(String),

    #[error("Content was not found in the store")]
    NotFound,
}
