use thiserror::Error;

use crate::{fees::FeeError, links::LinkError, storage::StorageError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    /// The request is well-formed but conflicts with the current state.
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Fee(#[from] FeeError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
