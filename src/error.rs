//! Error types for virtnode.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using virtnode's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in virtnode operations.
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors (never mutate state, always reported)
    /// Malformed or unrecognized instruction.
    #[error("invalid instruction: {0}")]
    Validation(String),

    /// Guest UUID absent from the current enumeration.
    #[error("guest not found: {0}")]
    GuestNotFound(String),

    // Engine capacity errors
    /// Node is too busy to take the instruction now.
    #[error("node overloaded: {0}")]
    Overloaded(String),

    /// The dispatch engine is stopping and no longer takes work.
    #[error("dispatch engine is shutting down")]
    ShuttingDown,

    /// An instruction handler panicked.
    #[error("instruction aborted: {0}")]
    Panicked(String),

    // External tool errors
    /// Disk-image tool exited non-zero.
    #[error("command failed on {}: {output}", path.display())]
    CommandExecFailed {
        /// Image the command operated on.
        path: PathBuf,
        /// Combined stdout and stderr.
        output: String,
    },

    /// External command could not be run or failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    // Hypervisor errors
    /// Hypervisor call returned failure.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    // Transport errors
    /// Message bus is unreachable.
    #[error("transport error: {0}")]
    Transport(String),

    // Event loop errors
    /// The poll primitive failed; the reactor cannot continue.
    #[error("reactor failed: {0}")]
    Reactor(#[source] std::io::Error),

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    // Serialization errors
    /// JSON encode/decode error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error with a message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a hypervisor error with a message.
    pub fn hypervisor(msg: impl Into<String>) -> Self {
        Self::Hypervisor(msg.into())
    }

    /// Create an overload error with a message.
    pub fn overloaded(msg: impl Into<String>) -> Self {
        Self::Overloaded(msg.into())
    }

    /// Create a transport error with a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a command exec failure for an image path.
    pub fn command_exec_failed(path: impl Into<PathBuf>, output: impl Into<String>) -> Self {
        Self::CommandExecFailed {
            path: path.into(),
            output: output.into(),
        }
    }

    /// Whether the error was raised before any state was touched.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::GuestNotFound(_))
    }

    /// Whether the error came from the message bus.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
