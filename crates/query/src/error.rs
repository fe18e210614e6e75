use extract::LlmError;
use index::IndexError;
use thiserror::Error;

use crate::state::Stage;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("language model failed: {0}")]
    Llm(#[from] LlmError),

    #[error("store failed: {0}")]
    Index(#[from] IndexError),

    #[error("run was cancelled")]
    Cancelled,

    #[error("{stage} timed out")]
    Timeout { stage: Stage },

    #[error("invalid pipeline state: {0}")]
    InvalidState(String),
}

impl PipelineError {
    /// Message safe to show to the caller. Details stay in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::Cancelled => "The request was cancelled before an answer was produced.",
            PipelineError::Timeout { .. } => {
                "The request took too long to answer. Please try again shortly."
            }
            PipelineError::Llm(e) if e.is_transient() => {
                "The answer service is temporarily unavailable. Please try again shortly."
            }
            PipelineError::Index(e) if e.is_transient() => {
                "The document search service is temporarily unavailable. Please try again shortly."
            }
            _ => "Something went wrong while answering this question. Please contact support if it persists.",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_details() {
        let err = PipelineError::Llm(LlmError::Status { status: 503, body: "upstream secret".into() });
        assert!(!err.user_message().contains("secret"));
        assert!(err.user_message().contains("temporarily unavailable"));

        let err = PipelineError::InvalidState("no evidence pack at FUSE".into());
        assert!(!err.user_message().contains("FUSE"));
    }
}
