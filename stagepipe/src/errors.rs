//! Error types for stagepipe.
//!
//! Configuration errors (`InvalidPolicy`, `InvalidBatchSize`, `Config`) are raised
//! before any worker exists. Stage errors carry the original transform error as
//! their source so callers can downcast to it.

use thiserror::Error;

/// Result alias used across the crate.
pub type StagepipeResult<T> = Result<T, StagepipeError>;

#[derive(Debug, Error)]
pub enum StagepipeError {
    /// A stage declared a statefulness policy that cannot be classified.
    #[error("invalid stage policy: {0}")]
    InvalidPolicy(String),

    /// Batch grouping was requested with a size below 1.
    #[error("invalid batch size {0}: must be at least 1")]
    InvalidBatchSize(i64),

    /// A stage transform failed (returned an error or panicked).
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    /// A dedicated stateful worker exited without answering.
    #[error("worker for stage '{0}' exited unexpectedly")]
    WorkerLost(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Work was submitted after shutdown began.
    #[error("pipeline is closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StagepipeError {
    /// Wrap a transform error for the named stage.
    pub fn stage(stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Stage {
            stage: stage.into(),
            source,
        }
    }

    /// Whether this error comes from configuration rather than execution.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidPolicy(_) | Self::InvalidBatchSize(_) | Self::Config(_)
        )
    }
}
