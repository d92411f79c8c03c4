use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::IdentityKind;

/// A failure raised while executing a workflow step.
///
/// Raised errors short-circuit the run: the engine records them, stores them
/// as the run's failure and stops. Only validation *outcomes* lead to repair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("no {0} identity could be resolved from the registry")]
    MissingIdentity(IdentityKind),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("validation endpoint unavailable: {0}")]
    ValidationTransport(String),

    #[error("submission failed: {0}")]
    Submission(String),
}

impl StepError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::Precondition(_) => FailureKind::Precondition,
            StepError::MissingIdentity(_) => FailureKind::MissingIdentity,
            StepError::Generation(_) => FailureKind::Generation,
            StepError::ValidationTransport(_) => FailureKind::ValidationTransport,
            StepError::Submission(_) => FailureKind::Submission,
        }
    }
}

/// User-visible classification of why a run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Precondition,
    MissingIdentity,
    Generation,
    ValidationTransport,
    Submission,
    /// Validation kept failing until the retry ceiling was reached.
    RetriesExhausted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Precondition => write!(f, "PreconditionError"),
            FailureKind::MissingIdentity => write!(f, "MissingIdentityError"),
            FailureKind::Generation => write!(f, "GenerationError"),
            FailureKind::ValidationTransport => write!(f, "ValidationTransportError"),
            FailureKind::Submission => write!(f, "SubmissionError"),
            FailureKind::RetriesExhausted => write!(f, "RetriesExhausted"),
        }
    }
}

/// Durability failure of the audit trail or the checkpoint store.
///
/// Never fatal to a run; the engine logs it and carries on.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt record in {path} at line {line}")]
    Corrupt { path: PathBuf, line: usize },
}
