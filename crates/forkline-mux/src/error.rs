//! Pipeline dispatch errors.

/// Errors raised while an event travels through a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("Malformed routing header: {0}")]
    MalformedHeader(String),

    #[error("Pipeline {pipeline} has nothing below its bottom stage")]
    NoSink { pipeline: String },

    #[error("Stage {stage} is no longer attached to pipeline {pipeline}")]
    Detached { pipeline: String, stage: String },

    #[error("No stage named {0} in pipeline")]
    NeighborNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stage {stage} failed: {reason}")]
    Failed { stage: String, reason: String },
}

impl StageError {
    pub fn failed(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}
