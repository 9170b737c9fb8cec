//! Runtime error types.

use skald_engine::EngineError;
use skald_types::{ConvId, NodeId, Status};
use thiserror::Error;

/// Errors produced by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No function was ever compiled for this pair.
    #[error("Not found pair ({0}, {1})")]
    NotFoundPair(ConvId, NodeId),

    /// The pair exists but its function was removed or never
    /// materialized.
    #[error("Pair (conv, node) does not contain compiled function.")]
    NotFunction,

    /// The engine rejected the operation.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RegistryError {
    /// Wire status code for this error.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::NotFoundPair(..) => Status::NotFoundPairErr,
            Self::NotFunction => Status::NotFunctionErr,
            Self::Engine(e) => e.status(),
        }
    }
}
