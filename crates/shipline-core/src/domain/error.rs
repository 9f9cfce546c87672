//! Domain-level error taxonomy for Shipline.
//!
//! Only conditions that stop an operation from producing a result live here.
//! Application failures, infrastructure failures and timeouts are attempt
//! outcomes ([`shipline_ledger::AttemptOutcome`]) and never surface as `Err`.

use shipline_ledger::StorageError;

/// Shipline domain errors.
#[derive(Debug, thiserror::Error)]
pub enum ShiplineError {
    /// Bad configuration document, registry entry or stage graph.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown environment: {id}")]
    UnknownEnvironment { id: String },

    #[error("duplicate environment: {id}")]
    DuplicateEnvironment { id: String },

    /// Rollback requested for an environment with no successful deploy on record.
    #[error("no known good state for environment '{environment}'")]
    NoKnownGoodState { environment: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ShiplineError {
    /// Process exit code the operator CLI reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ShiplineError::Configuration(_)
            | ShiplineError::UnknownEnvironment { .. }
            | ShiplineError::DuplicateEnvironment { .. } => 2,
            ShiplineError::NoKnownGoodState { .. } => 3,
            ShiplineError::Storage(_) => 1,
        }
    }
}

/// Result type for Shipline domain operations.
pub type Result<T> = std::result::Result<T, ShiplineError>;
