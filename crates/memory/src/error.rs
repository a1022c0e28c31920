//! Error taxonomy for the consolidation core.
//!
//! Scoring failures are recovered inside the store (the record is kept as
//! unscored), synthesis failures end a dreaming cycle without touching memory,
//! and storage failures always reach the caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("axis scoring reply malformed: {0}")]
    ScoringFormat(String),

    #[error("record {id} was already appended within the replay window")]
    DuplicateRecord { id: String },

    #[error("insight synthesis reply malformed: {0}")]
    SynthesisFormat(String),

    #[error("oracle did not answer within {after:?}")]
    OracleTimeout { after: Duration },

    #[error("oracle call failed: {0}")]
    Oracle(String),

    #[error("dreaming cycle cancelled by shutdown")]
    Cancelled,

    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stable, serialisable discriminant reported by the trigger API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    ScoringFormat,
    DuplicateRecord,
    SynthesisFormat,
    Timeout,
    Oracle,
    Cancelled,
    Storage,
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::ScoringFormat(_) => ErrorKind::ScoringFormat,
            Self::DuplicateRecord { .. } => ErrorKind::DuplicateRecord,
            Self::SynthesisFormat(_) => ErrorKind::SynthesisFormat,
            Self::OracleTimeout { .. } => ErrorKind::Timeout,
            Self::Oracle(_) => ErrorKind::Oracle,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage(_) | Self::Serialization(_) => ErrorKind::Storage,
        }
    }

    /// True for failures that leave memory untouched and can simply be
    /// retried by the next trigger.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SynthesisFormat | ErrorKind::Timeout | ErrorKind::Oracle | ErrorKind::Cancelled
        )
    }
}
