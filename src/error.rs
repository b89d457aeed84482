//! Custom error types for flowtap
//!
//! Provides structured error handling scoped to a single flow or event,
//! plus user-friendly messages for the CLI.

use std::path::PathBuf;

use thiserror::Error;

use crate::flow::FlowId;

/// Main error type for flowtap operations
#[derive(Error, Debug)]
pub enum FlowtapError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Flow state invariant violations
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Transport-facing delivery errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Dump encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialize(#[from] SerializeError),

    /// Script/event hook failures
    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {path}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {field} - {reason}")]
    ValidationError { field: String, reason: String },
}

/// Refused mutations of the flow model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Flow {0} already has a response or error")]
    AlreadyResolved(FlowId),

    #[error("Flow {0} is paused for interception")]
    Intercepting(FlowId),

    #[error("Flow not found: {0}")]
    UnknownFlow(FlowId),
}

/// Errors surfaced to the transport layer when delivering a flow's message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Client for flow {0} has disconnected")]
    ClientDisconnected(FlowId),

    #[error("Flow {0} was killed")]
    Killed(FlowId),

    #[error("Intercept decision for flow {0} was abandoned")]
    InterceptAbandoned(FlowId),

    #[error("Flow not found: {0}")]
    UnknownFlow(FlowId),
}

/// Dump format errors; `offset` is the byte position of the offending frame
#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("I/O error while reading flows: {0}")]
    Io(#[from] std::io::Error),

    #[error("Truncated frame at offset {offset}")]
    Truncated { offset: u64 },

    #[error("Malformed frame at offset {offset}: {reason}")]
    MalformedFrame { offset: u64, reason: String },

    #[error("Invalid flow snapshot at offset {offset}: {reason}")]
    InvalidSnapshot { offset: u64, reason: String },
}

/// Script/event hook failures
#[derive(Error, Debug)]
pub enum HookError {
    #[error("Script {path} returned error ({status}): {stderr}")]
    ReturnedError {
        path: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("Script {path} produced invalid response: {reason}")]
    InvalidData { path: PathBuf, reason: String },

    #[error("Script {path} is not runnable: {reason}")]
    NotRunnable { path: PathBuf, reason: String },
}

impl FlowtapError {
    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            FlowtapError::Config(e) => format!("Configuration problem: {}", e.user_hint()),
            FlowtapError::State(e) => format!("Flow problem: {}", e),
            FlowtapError::Proxy(e) => format!("Delivery problem: {}", e),
            FlowtapError::Serialize(e) => format!("Dump file problem: {}", e.user_hint()),
            FlowtapError::Hook(e) => format!("Script problem: {}", e.user_hint()),
            FlowtapError::Io(e) => format!("File system issue: {}", e),
        }
    }
}

/// Trait for providing user-friendly hints
pub trait UserHint {
    fn user_hint(&self) -> String;
}

impl UserHint for ConfigError {
    fn user_hint(&self) -> String {
        match self {
            ConfigError::ReadError { path, .. } => {
                format!("Could not read '{}'. Check if the file exists and you have read permissions.", path)
            }
            ConfigError::ParseError(_) => {
                "The configuration file has invalid syntax. Check for TOML formatting errors.".into()
            }
            ConfigError::ValidationError { field, reason } => {
                format!("Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl UserHint for SerializeError {
    fn user_hint(&self) -> String {
        match self {
            SerializeError::Truncated { offset } => {
                format!("The dump ends mid-flow at byte {}. It may still be being written.", offset)
            }
            SerializeError::MalformedFrame { offset, .. }
            | SerializeError::InvalidSnapshot { offset, .. } => {
                format!("The dump is corrupt at byte {}. Flows before it were read.", offset)
            }
            SerializeError::Io(e) => e.to_string(),
        }
    }
}

impl UserHint for HookError {
    fn user_hint(&self) -> String {
        match self {
            HookError::NotRunnable { path, .. } => {
                format!("Script '{}' could not be started. Check that it exists and is executable.", path.display())
            }
            HookError::InvalidData { path, .. } => {
                format!("Script '{}' must print a flow snapshot as JSON on stdout.", path.display())
            }
            _ => self.to_string(),
        }
    }
}
