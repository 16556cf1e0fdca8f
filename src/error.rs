//! Pipeline and caller-facing error kinds.
//!
//! Stage failures are fatal to a task and end up as its `Failed` status.
//! `EnrichmentFailure` is recovered per chunk. `NotFound`, `InvalidState`
//! and `InvalidRequest` are returned to callers and never mutate a task.

use thiserror::Error;

use crate::models::TaskStatus;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("download failed for {url}: {reason}")]
    DownloadFailure { url: String, reason: String },

    #[error("conversion failed: {0}")]
    ConversionFailure(String),

    #[error("document {0} has no markdown content to chunk")]
    EmptyContent(String),

    #[error("chunking invariant violated: {0}")]
    ChunkingFailure(String),

    #[error("enrichment failed for chunk {chunk_id}: {reason}")]
    EnrichmentFailure { chunk_id: String, reason: String },

    #[error("stage '{stage}' timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid state: task {task_id} is {status}, cannot {action}")]
    InvalidState {
        task_id: String,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn task_not_found(id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            kind: "task",
            id: id.into(),
        }
    }

    /// True for failures that end a task in `Failed`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::DownloadFailure { .. }
                | PipelineError::ConversionFailure(_)
                | PipelineError::EmptyContent(_)
                | PipelineError::ChunkingFailure(_)
                | PipelineError::Timeout { .. }
        )
    }

    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::DownloadFailure { .. } => "download_failure",
            PipelineError::ConversionFailure(_) => "conversion_failure",
            PipelineError::EmptyContent(_) => "empty_content",
            PipelineError::ChunkingFailure(_) => "chunking_failure",
            PipelineError::EnrichmentFailure { .. } => "enrichment_failure",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::InvalidState { .. } => "invalid_state",
            PipelineError::InvalidRequest(_) => "bad_request",
            PipelineError::Store(_) => "internal",
        }
    }
}
