use thiserror::Error;

/// Failure taxonomy for chat-completion calls.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("prompt exceeds the model context window: {0}")]
    ContextLengthExceeded(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },

    #[error("malformed provider response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Timeout { .. } | LlmError::Network(_) => true,
            LlmError::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
