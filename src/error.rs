use thiserror::Error;

/// Main error type for the database client
#[derive(Error, Debug)]
pub enum DbError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    // Network errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    // Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Transaction errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transaction rejected by server: {tx_id}: {reason}")]
    Conflict { tx_id: String, reason: String },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    // Wire decode errors
    #[error("Decode error: {0}")]
    Decode(String),

    // Query errors
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    // Lifecycle errors
    #[error("Client is disposed")]
    Disposed,

    #[error("Client is in read-only mode after a storage failure")]
    ReadOnly,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DbError {
    /// True for failures the sync engine recovers from by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::WebSocket(_) | DbError::Transport(_) | DbError::Io(_)
        )
    }
}

/// Result type alias for DbError
pub type Result<T> = std::result::Result<T, DbError>;
