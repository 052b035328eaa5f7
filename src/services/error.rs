use std::time::Duration;

use crate::services::llm::LlmError;

/// Why a generation tier did not produce a story.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("hosted API failed: {0}")]
    Hosted(#[from] LlmError),

    #[error("local model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("local generation failed: {0}")]
    Generation(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
