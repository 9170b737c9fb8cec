//! Engine error types.

use skald_types::Status;
use thiserror::Error;

/// Errors produced by engine operations.
///
/// Every variant except [`EngineError::Init`] maps onto a wire status
/// code via [`EngineError::status`]. `Init` failures are fatal at
/// startup and never reach the wire.
#[derive(Debug, Error)]
pub enum EngineError {
    /// VM construction or hook installation failed.
    #[error("engine setup failed: {0}")]
    Init(#[source] mlua::Error),

    /// The chunk failed to compile or did not evaluate to a function.
    #[error("{0}")]
    Compile(String),

    /// The run payload was not valid JSON.
    #[error("Error during parse JSON.")]
    BadInput,

    /// The script raised an error while running.
    #[error("{0}")]
    Runtime(String),

    /// The script was terminated for exceeding its time budget.
    #[error("Script has been terminated.")]
    Terminated,

    /// `require` target or cache lookup missed.
    #[error("Don't have cache for {0}")]
    ModuleNotCached(String),

    /// A library file could not be read from disk.
    #[error("Error opening file: {0}")]
    ModuleRead(String),
}

impl EngineError {
    /// Wire status code for this error.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::Init(_) => Status::Err,
            Self::Compile(_) => Status::CompileErr,
            Self::BadInput => Status::BadInputErr,
            Self::Runtime(_) => Status::ScriptRuntimeErr,
            Self::Terminated => Status::ScriptTerminatedErr,
            Self::ModuleNotCached(_) | Self::ModuleRead(_) => Status::CachedRequireFileErr,
        }
    }
}
