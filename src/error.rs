//! Error types for the agent interaction layer

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {

    // =============================
    // Provider Errors
    // =============================

    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    #[error("Provider call failed ({provider}): {message}")]
    ProviderCallFailed {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Unsupported AI provider: {0}")]
    UnsupportedProvider(String),

    #[error("{message} after {attempts} attempt(s): {source}")]
    RetryExhausted {
        message: String,
        attempts: u32,
        #[source]
        source: Box<AgentError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // =============================
    // Session Errors
    // =============================

    #[error("Transport closed")]
    TransportClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    // =============================
    // Collaborator Errors
    // =============================

    #[error("Balance source error: {0}")]
    BalanceSource(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the Backoff Executor may attempt the failed work again.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::TransientProvider(_) => true,
            AgentError::ProviderCallFailed { status, .. } => {
                !matches!(status, Some(400 | 401 | 403 | 404))
            }
            AgentError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            AgentError::BalanceSource(_) | AgentError::Agent(_) | AgentError::Io(_) => true,
            AgentError::UnsupportedProvider(_)
            | AgentError::RetryExhausted { .. }
            | AgentError::Cancelled
            | AgentError::TransportClosed
            | AgentError::Transport(_)
            | AgentError::Config(_)
            | AgentError::Database(_)
            | AgentError::Serialization(_) => false,
        }
    }

    /// Classify an HTTP status returned by a provider.
    pub fn from_provider_status(provider: &str, status: u16, body: String) -> Self {
        if status == 429 || status >= 500 {
            AgentError::TransientProvider(format!("{} returned {}: {}", provider, status, body))
        } else {
            AgentError::ProviderCallFailed {
                provider: provider.to_string(),
                status: Some(status),
                message: body,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let busy = AgentError::from_provider_status("openai", 503, "overloaded".into());
        assert!(matches!(busy, AgentError::TransientProvider(_)));
        assert!(busy.is_retryable());

        let throttled = AgentError::from_provider_status("openai", 429, "slow down".into());
        assert!(throttled.is_retryable());

        let denied = AgentError::from_provider_status("atoma", 401, "bad key".into());
        assert!(matches!(
            denied,
            AgentError::ProviderCallFailed { status: Some(401), .. }
        ));
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_fatal_errors_are_not_retryable() {
        assert!(!AgentError::UnsupportedProvider("venice".into()).is_retryable());
        assert!(!AgentError::Cancelled.is_retryable());
        assert!(!AgentError::TransportClosed.is_retryable());
    }

    #[test]
    fn test_retry_exhausted_message_carries_cause() {
        let err = AgentError::RetryExhausted {
            message: "Completion failed".into(),
            attempts: 3,
            source: Box::new(AgentError::TransientProvider("timeout".into())),
        };
        let text = err.to_string();
        assert!(text.starts_with("Completion failed after 3 attempt(s)"));
        assert!(text.contains("timeout"));
    }
}
