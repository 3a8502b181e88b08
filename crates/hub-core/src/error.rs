//! Application error types with rich context

use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Device / Driver Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Device discovery failed: {message}")]
    Discovery { message: String },

    #[error("Device not found: {id}")]
    DeviceNotFound { id: String },

    #[error("{operation} failed on device {device_id}: {message}")]
    Installation {
        device_id: String,
        operation: String,
        message: String,
    },

    #[error("Device {device_id} already runs session {session_id}")]
    SessionConflict {
        device_id: String,
        session_id: String,
    },

    #[error("Device {device_id} failed to connect within timeout ({timeout:?})")]
    ConnectionTimeout { device_id: String, timeout: Duration },

    #[error("Invalid device state: {message}")]
    InvalidState { message: String },

    #[error("Tool not found: {tool}. Ensure it is installed and in your PATH.")]
    ToolNotFound { tool: String },

    #[error("Process error: {message}")]
    Process { message: String },

    #[error("Failed to spawn process: {reason}")]
    ProcessSpawn { reason: String },

    // ─────────────────────────────────────────────────────────────
    // Node Transport Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Node transport error: {message}")]
    Transport { message: String },

    #[error("Remote device reported an application error in {method}: {message}")]
    RemoteInvocation { method: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    pub fn device_not_found(id: impl Into<String>) -> Self {
        Self::DeviceNotFound { id: id.into() }
    }

    pub fn installation(
        device_id: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Installation {
            device_id: device_id.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn session_conflict(device_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::SessionConflict {
            device_id: device_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn connection_timeout(device_id: impl Into<String>, timeout: Duration) -> Self {
        Self::ConnectionTimeout {
            device_id: device_id.into(),
            timeout,
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn remote(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteInvocation {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this is a recoverable error
    ///
    /// None of these are retried here; the caller decides.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Discovery { .. }
                | Error::Installation { .. }
                | Error::SessionConflict { .. }
                | Error::ConnectionTimeout { .. }
                | Error::Transport { .. }
                | Error::RemoteInvocation { .. }
        )
    }

    /// Check if this error should trigger application exit
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProcessSpawn { .. } | Error::Config { .. }
        )
    }

    /// Check if this error was produced by the node transport layer
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::ChannelClosed)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
