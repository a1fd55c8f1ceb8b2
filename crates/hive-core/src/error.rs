//! Error types for hive-core
//!
//! These are infrastructure errors. Task-level failures never surface here;
//! they travel as data inside `TaskResult` and `Diagnostic`.

use thiserror::Error;

/// Main error type for hive-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid status transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for hive-core
pub type Result<T> = std::result::Result<T, Error>;
