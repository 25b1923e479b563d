//! Errors raised by the database node and its storage engines.

use shared::{BridgeError, DatagramError, DoId, SchemaError};
use thiserror::Error;

/// Failures of a [`DatabaseBackend`](crate::backend::DatabaseBackend) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The object was not created; nothing was written.
    #[error("create failed: {0}")]
    CreateFailed(String),

    #[error("object {0} not found")]
    NotFound(DoId),

    /// The write violated the schema; nothing was written.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The storage engine itself failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl BackendError {
    pub fn storage(e: impl std::fmt::Display) -> Self {
        BackendError::Storage(e.to_string())
    }
}

macro_rules! storage_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for BackendError {
                fn from(e: $ty) -> Self {
                    BackendError::storage(e)
                }
            }
        )*
    };
}

storage_error_from!(
    std::io::Error,
    bincode::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    tokio::task::JoinError,
);

/// Failures of the database node while handling a request.
#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("unknown class {0}")]
    UnknownClass(u16),

    #[error("unknown field {0}")]
    UnknownField(u16),

    #[error(transparent)]
    Datagram(#[from] DatagramError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
