/// Shared error type used across all opsdeck crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("tool server: {0}")]
    ToolServer(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("illegal status transition for call {call_id}: {from} -> {to}")]
    IllegalTransition {
        call_id: String,
        from: String,
        to: String,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transport-level failures that a bounded backoff may recover from.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Http(_) => true,
            Error::Provider { message, .. } => {
                message.contains("HTTP 429") || message.contains("HTTP 503")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
