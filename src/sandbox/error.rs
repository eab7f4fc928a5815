//! Domain-specific error types for sandbox operations.
//!
//! Every provider and PTY operation fails with exactly one of these kinds.
//! Backend errors are translated into them at the provider boundary so
//! callers can match on the condition rather than parse message strings.

use std::time::Duration;

use crate::engine::EngineError;

/// Errors that can occur during sandbox operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    /// No sandbox exists for the session.
    #[error("Sandbox not found for session: {session_id}")]
    NotFound { session_id: String },

    /// A sandbox already exists for the session.
    #[error("Sandbox already exists for session: {session_id}")]
    AlreadyExists { session_id: String },

    /// The sandbox exists but is not running.
    #[error("Sandbox is not running for session: {session_id}")]
    NotRunning { session_id: String },

    /// The sandbox is already running.
    #[error("Sandbox is already running for session: {session_id}")]
    AlreadyRunning { session_id: String },

    /// The backend failed to bring the sandbox (or accelerator) up.
    #[error("Sandbox failed to start: {message}")]
    StartFailed { message: String },

    /// A command could not be executed.
    #[error("Exec failed: {message}")]
    ExecFailed { message: String },

    /// An interactive session could not be attached.
    #[error("Attach failed: {message}")]
    AttachFailed { message: String },

    /// The operation exceeded its deadline.
    #[error("Operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// The image reference is malformed or cannot be resolved.
    #[error("Invalid image: {image}")]
    InvalidImage { image: String },

    /// The backend refused the requested resources.
    #[error("Resource limit exceeded: {message}")]
    ResourceLimitExceeded { message: String },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The backend is unreachable or replied unexpectedly.
    #[error("Sandbox backend unavailable: {message}")]
    Unavailable { message: String },
}

impl SandboxError {
    /// Creates a `NotFound` error.
    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::NotFound {
            session_id: session_id.into(),
        }
    }

    /// Creates an `AlreadyExists` error.
    pub fn already_exists(session_id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            session_id: session_id.into(),
        }
    }

    /// Creates a `NotRunning` error.
    pub fn not_running(session_id: impl Into<String>) -> Self {
        Self::NotRunning {
            session_id: session_id.into(),
        }
    }

    /// Creates an `AlreadyRunning` error.
    pub fn already_running(session_id: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            session_id: session_id.into(),
        }
    }

    /// Creates a `StartFailed` error.
    pub fn start_failed(message: impl Into<String>) -> Self {
        Self::StartFailed {
            message: message.into(),
        }
    }

    /// Creates an `ExecFailed` error.
    pub fn exec_failed(message: impl Into<String>) -> Self {
        Self::ExecFailed {
            message: message.into(),
        }
    }

    /// Creates an `AttachFailed` error.
    pub fn attach_failed(message: impl Into<String>) -> Self {
        Self::AttachFailed {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates an `InvalidImage` error.
    pub fn invalid_image(image: impl Into<String>) -> Self {
        Self::InvalidImage {
            image: image.into(),
        }
    }

    /// Creates a `ResourceLimitExceeded` error.
    pub fn resource_limit_exceeded(message: impl Into<String>) -> Self {
        Self::ResourceLimitExceeded {
            message: message.into(),
        }
    }

    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is an already-exists error.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true if this is a not-running error.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::NotRunning { .. })
    }

    /// Returns true if this is an already-running error.
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }

    /// Returns true if this is a start failure.
    pub fn is_start_failed(&self) -> bool {
        matches!(self, Self::StartFailed { .. })
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns true if this is an invalid image error.
    pub fn is_invalid_image(&self) -> bool {
        matches!(self, Self::InvalidImage { .. })
    }

    /// Returns true if the backend refused for lack of capacity.
    pub fn is_resource_limit_exceeded(&self) -> bool {
        matches!(self, Self::ResourceLimitExceeded { .. })
    }

    /// Translates an engine error raised while starting something.
    ///
    /// Image and resource problems keep their own kinds; everything else
    /// is a start failure.
    pub(crate) fn from_engine_start(err: EngineError) -> Self {
        match err {
            EngineError::InvalidImage { image } => Self::invalid_image(image),
            EngineError::ResourceLimit { message } => Self::resource_limit_exceeded(message),
            other => Self::start_failed(other.to_string()),
        }
    }

    /// Translates an engine error for operations without a more specific
    /// failure kind (stop, remove, inspect).
    pub(crate) fn from_engine(err: EngineError) -> Self {
        match err {
            EngineError::InvalidImage { image } => Self::invalid_image(image),
            EngineError::ResourceLimit { message } => Self::resource_limit_exceeded(message),
            other => Self::unavailable(other.to_string()),
        }
    }
}
