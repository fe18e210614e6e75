use extract::RetryableError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("graph store error: {0}")]
    Graph(#[from] neo4rs::Error),

    #[error("{store} does not support {capability}")]
    Unsupported {
        store: &'static str,
        capability: &'static str,
    },

    #[error("malformed store response: {0}")]
    Malformed(String),

    #[error("embedding failed: {0}")]
    Embedding(String),
}

impl RetryableError for IndexError {
    fn is_transient(&self) -> bool {
        match self {
            IndexError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            IndexError::Status { status, .. } => *status == 429 || *status >= 500,
            IndexError::Timeout { .. } => true,
            IndexError::Graph(_)
            | IndexError::Unsupported { .. }
            | IndexError::Malformed(_)
            | IndexError::Embedding(_) => false,
        }
    }
}

impl IndexError {
    pub fn is_transient(&self) -> bool {
        RetryableError::is_transient(self)
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
