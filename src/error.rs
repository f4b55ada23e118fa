//! Error types for redub.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RedubError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Request validation errors
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    // On-disk state errors
    #[error("Corrupt task state in {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("Invalid segment table: {message}")]
    InvalidSegments { message: String },

    // Engine errors
    #[error("{engine} engine failed: {message}")]
    EngineFailure { engine: String, message: String },

    #[error("Unsupported input: {message}")]
    InputUnsupported { message: String },

    // Cooperative cancellation observed at a suspension point
    #[error("cancelled")]
    Cancelled,

    // IPC errors
    #[error("IPC socket error: {message}")]
    IpcSocket { message: String },

    #[error("IPC protocol error: {message}")]
    IpcProtocol { message: String },

    // Serialization and I/O errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl RedubError {
    /// Domain error kind, as surfaced in `status.json` and error events.
    pub fn kind(&self) -> &'static str {
        match self {
            RedubError::ConfigFileNotFound { .. }
            | RedubError::ConfigInvalidValue { .. }
            | RedubError::Config(_) => "InvalidConfig",
            RedubError::InvalidRequest { .. } | RedubError::InvalidSegments { .. } => {
                "InvalidRequest"
            }
            RedubError::TaskNotFound { .. } => "NotFound",
            RedubError::Conflict { .. } => "Conflict",
            RedubError::Corrupt { .. } => "Corrupt",
            RedubError::EngineFailure { .. } | RedubError::InputUnsupported { .. } => {
                "EngineFailure"
            }
            RedubError::Cancelled => "Cancelled",
            RedubError::IpcSocket { .. } | RedubError::IpcProtocol { .. } => "Transport",
            RedubError::Json(_) | RedubError::Wav(_) | RedubError::Io(_) => "IOFailure",
            RedubError::Other(_) => "Internal",
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, RedubError>;
