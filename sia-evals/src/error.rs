//! Error types for tracking, assembly and validation.

use std::path::PathBuf;

use thiserror::Error;

use crate::window::TimeWindow;

/// Result type for sia-evals operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
///
/// Every kind except `External` is fatal for the current operation and is
/// never retried inside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing identifiers, credentials, or invalid arguments.
    Configuration,
    /// A required resource (evaluator history, telemetry, checkpoint) is absent.
    DataAvailability,
    /// Input data exists but does not have the expected shape.
    DataShape,
    /// A persisted document failed to parse or validate.
    Schema,
    /// Local filesystem or encoding failure.
    Io,
    /// A collaborator (telemetry, judge, provider, evaluator) failed.
    External,
}

/// Errors that can occur in sia-evals.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An evaluator call was rejected before it ran.
    #[error("invalid evaluator call: {0}")]
    InvalidCall(String),

    /// A requested evaluator has no tracked calls.
    #[error("no tracked calls for evaluator '{name}'")]
    MissingEvaluator { name: String },

    /// The telemetry window contained no records.
    #[error("telemetry window {window} returned no records")]
    EmptyWindow { window: TimeWindow },

    /// No policy checkpoint has been stored yet.
    #[error("no policy checkpoint found in {}", dir.display())]
    NoCheckpoint { dir: PathBuf },

    /// Nothing was left to score.
    #[error("no scorable samples: {0}")]
    NoScorableSamples(String),

    /// A telemetry record or judge row has an unexpected shape.
    #[error("record {record}: {reason}")]
    DataShape { record: usize, reason: String },

    /// Values assumed constant across a window differ.
    #[error("{field} diverges across the window ({count} of {total} entries differ)")]
    Divergent {
        field: String,
        count: usize,
        total: usize,
    },

    /// A persisted evaluator or checkpoint file is invalid.
    #[error("invalid document {}: {reason}", path.display())]
    Schema { path: PathBuf, reason: String },

    /// Filesystem error with the offending path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Telemetry source failure.
    #[error("telemetry fetch failed: {0}")]
    Telemetry(String),

    /// Judge failure; aborts the whole batch.
    #[error("judge failed: {0}")]
    Judge(String),

    /// The wrapped evaluator returned an error.
    #[error("evaluator '{name}' failed: {reason}")]
    Evaluator { name: String, reason: String },

    /// Completion provider failure.
    #[error(transparent)]
    Provider(#[from] sia_models::Error),
}

impl Error {
    /// Build an [`Error::Io`] carrying the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build an [`Error::Schema`] for a file.
    pub fn schema(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Schema {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Build an [`Error::DataShape`] for a record index.
    pub fn shape(record: usize, reason: impl Into<String>) -> Self {
        Self::DataShape {
            record,
            reason: reason.into(),
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::InvalidCall(_) => ErrorKind::Configuration,
            Self::MissingEvaluator { .. }
            | Self::EmptyWindow { .. }
            | Self::NoCheckpoint { .. }
            | Self::NoScorableSamples(_) => ErrorKind::DataAvailability,
            Self::DataShape { .. } | Self::Divergent { .. } => ErrorKind::DataShape,
            Self::Schema { .. } => ErrorKind::Schema,
            Self::Io { .. } | Self::Serialization(_) => ErrorKind::Io,
            Self::Telemetry(_) | Self::Judge(_) | Self::Evaluator { .. } | Self::Provider(_) => {
                ErrorKind::External
            }
        }
    }
}
