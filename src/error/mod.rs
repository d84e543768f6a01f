use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {message}")]
    User { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Agent {agent} failed: {message}")]
    Agent { agent: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// LLM gateway errors (chat, embedding, rerank providers)
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Upstream error: {status} - {body}")]
    Upstream { status: u16, body: String },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Provider not configured: {message}")]
    NotConfigured { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Error kinds shared by the HTTP layer, the CLI and the UI strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    ConfigError,
    Timeout,
    Cancelled,
    UpstreamError,
    SchemaValidationError,
    StorageError,
    NotFound,
    Conflict,
    Internal,
}

impl LlmError {
    /// Whether the agent runtime may retry the failed call.
    ///
    /// Rate limiting, 5xx responses and schema failures are transient;
    /// timeouts and authentication failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::SchemaValidation { .. } => true,
            LlmError::Upstream { status, .. } => *status >= 500,
            LlmError::Http(e) => e.is_connect(),
            _ => false,
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            LlmError::NotConfigured { .. } => ErrorKind::ConfigError,
            LlmError::Timeout { .. } => ErrorKind::Timeout,
            LlmError::SchemaValidation { .. } => ErrorKind::SchemaValidationError,
            _ => ErrorKind::UpstreamError,
        }
    }
}

impl StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound { .. } => ErrorKind::NotFound,
            StorageError::Conflict { .. } => ErrorKind::Conflict,
            _ => ErrorKind::StorageError,
        }
    }
}

impl AppError {
    /// Shorthand for a user input error.
    pub fn user(message: impl Into<String>) -> Self {
        AppError::User {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::User { .. } => ErrorKind::UserError,
            AppError::Config { .. } => ErrorKind::ConfigError,
            AppError::Timeout { .. } => ErrorKind::Timeout,
            AppError::Cancelled => ErrorKind::Cancelled,
            AppError::Storage(e) => e.kind(),
            AppError::Llm(e) => e.kind(),
            AppError::Agent { .. } => ErrorKind::UpstreamError,
            AppError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// One-line message suitable for a terminal or UI banner.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Timeout { timeout_ms } => format!(
                "timed out after {}s (retry, or raise LLM_TIMEOUT_MS)",
                timeout_ms / 1000
            ),
            AppError::Llm(LlmError::Timeout { timeout_ms }) => format!(
                "timed out after {}s (retry, or raise REQUEST_TIMEOUT_MS)",
                timeout_ms / 1000
            ),
            AppError::Cancelled => "cancelled".to_string(),
            AppError::Llm(LlmError::Auth { .. }) => "API authentication failed".to_string(),
            other => other.to_string(),
        }
    }
}

impl ErrorKind {
    /// HTTP status used by the API layer.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::UserError => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::ConfigError => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Cancelled => 499,
            _ => 500,
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::UserError | ErrorKind::ConfigError => 1,
            ErrorKind::Cancelled => 130,
            _ => 2,
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for LLM gateway operations
pub type LlmResult<T> = Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::Timeout { timeout_ms: 60000 };
        assert_eq!(err.to_string(), "Operation timed out after 60000ms");

        let err = AppError::Cancelled;
        assert_eq!(err.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::NotFound {
            entity: "Plan",
            id: "plan-1".to_string(),
        };
        assert_eq!(err.to_string(), "Plan not found: plan-1");

        let err = StorageError::Conflict {
            message: "embedding dimension 3 != 4".to_string(),
        };
        assert_eq!(err.to_string(), "Conflict: embedding dimension 3 != 4");
    }

    #[test]
    fn test_llm_error_display() {
        let err = LlmError::Upstream {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "Upstream error: 502 - bad gateway");

        let err = LlmError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Request timeout after 5000ms");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::RateLimited {
            retry_after_ms: None
        }
        .is_retryable());
        assert!(LlmError::SchemaValidation {
            message: "x".into()
        }
        .is_retryable());
        assert!(LlmError::Upstream {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!LlmError::Upstream {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(!LlmError::Timeout { timeout_ms: 1 }.is_retryable());
        assert!(!LlmError::Auth {
            message: "x".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_kind_status_mapping() {
        assert_eq!(AppError::user("bad").kind().status_code(), 400);
        assert_eq!(
            AppError::from(StorageError::NotFound {
                entity: "Node",
                id: "n".into()
            })
            .kind()
            .status_code(),
            404
        );
        assert_eq!(
            AppError::Config {
                message: "k".into()
            }
            .kind()
            .status_code(),
            503
        );
        assert_eq!(
            AppError::from(LlmError::NotConfigured {
                message: "k".into()
            })
            .kind()
            .status_code(),
            503
        );
        assert_eq!(AppError::Timeout { timeout_ms: 1 }.kind().status_code(), 504);
        assert_eq!(AppError::Cancelled.kind().status_code(), 499);
        assert_eq!(
            AppError::Internal {
                message: "x".into()
            }
            .kind()
            .status_code(),
            500
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ErrorKind::UserError.exit_code(), 1);
        assert_eq!(ErrorKind::ConfigError.exit_code(), 1);
        assert_eq!(ErrorKind::UpstreamError.exit_code(), 2);
        assert_eq!(ErrorKind::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            AppError::Timeout { timeout_ms: 60000 }.user_message(),
            "timed out after 60s (retry, or raise LLM_TIMEOUT_MS)"
        );
        assert_eq!(AppError::Cancelled.user_message(), "cancelled");
        assert_eq!(
            AppError::from(LlmError::Auth {
                message: "invalid key".into()
            })
            .user_message(),
            "API authentication failed"
        );
    }
}
