//! Error types for mcp-hub.

use serde::Serialize;
use strum::Display;
use thiserror::Error;

/// Primary error type for all gateway operations.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Backend error ({backend}): {message}")]
    Backend { backend: String, message: String },

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

/// Coarse classification used to pick HTTP statuses and protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    InvalidRequest,
    Conflict,
    Upstream,
    Internal,
}

impl HubError {
    /// Build a not-found error for the given entity kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Build a backend error tagged with the backend's derived name.
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::InvalidArgument(_) | Self::Serialization(_) | Self::Toml(_) => {
                ErrorCategory::InvalidRequest
            }
            Self::InvalidState(_) => ErrorCategory::Conflict,
            Self::Backend { .. } | Self::ToolExecution { .. } | Self::Timeout(_) => {
                ErrorCategory::Upstream
            }
            Self::Configuration(_) | Self::Io(_) | Self::Stream(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the caller caused this error (bad identifiers or payloads).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::NotFound | ErrorCategory::InvalidRequest | ErrorCategory::Conflict
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, HubError>;
