use thiserror::Error;

use crate::trainer::TrainerState;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FlowError {
    /// A caller contract violation: a batch, integrand result or
    /// coefficient vector with the wrong size.
    #[error("shape mismatch for {what}: expected {expected}, found {found}")]
    Shape {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("integrand returned an unrecoverable error")]
    Integrand(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("training failed after {consecutive} consecutive bad steps")]
    TrainingFailed { consecutive: u64 },
    #[error("trainer can not take a step in state {0:?}")]
    InvalidState(TrainerState),
    #[error("no channel produced a usable estimate")]
    NoUsableChannel,
    #[error("unsupported checkpoint format version {0}")]
    UnsupportedCheckpoint(u32),
    #[error("checkpoint i/o failed")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization failed")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
