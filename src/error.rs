//! Stormgr Error Types

use thiserror::Error;

/// Result type alias for stormgr operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stormgr error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Store errors
    #[error("Cluster store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Version conflict on {key}: expected {expected:?}")]
    VersionConflict { key: String, expected: Option<u64> },

    #[error("No cluster database found for {0}")]
    DatabaseNotFound(String),

    #[error("Cluster bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("Cluster database update failed: {0}")]
    UpdateFailed(String),

    #[error("Database encoding error: {0}")]
    Json(#[from] serde_json::Error),

    // Listener errors
    #[error("Listener {listener} rejected {event}: {reason}")]
    ListenerSetupFailed {
        listener: String,
        event: &'static str,
        reason: String,
    },

    #[error("Listener {listener} failed to handle {event}: {reason}")]
    ListenerEventFailed {
        listener: String,
        event: &'static str,
        reason: String,
    },

    #[error("Listener already registered: {0}")]
    DuplicateListener(String),

    // Cluster manager errors
    #[error("Cluster manager already started")]
    AlreadyStarted,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Cluster is not initialized")]
    NotInitialized,

    #[error("Invalid cluster manager state: {0}")]
    InvalidState(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Local state errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if a store operation failing with this error may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::VersionConflict { .. }
                | Error::ConnectionTimeout(_)
                | Error::Network(_)
        )
    }

    /// Check if this error means another writer won a conditional write
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }
}
