//! Error taxonomy for environment and package operations.
//!
//! Every public manager operation returns [`EnvError`]. Callers that need a
//! transport-friendly shape use [`EnvError::report`], which yields the
//! `{kind, message, details?}` object with `kind` drawn from [`ErrorKind`].

use env_tools::ToolUnavailable;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error categories exposed to callers.
///
/// `SessionNotFound` and `Io` sit outside the per-operation taxonomy: the
/// first only comes from session lookup, the second from filesystem work
/// that no tool was involved in (removing an environment directory, writing
/// a requirements file).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ToolNotAvailableError")]
    ToolNotAvailable,
    #[serde(rename = "EnvironmentNotFoundError")]
    EnvironmentNotFound,
    #[serde(rename = "EnvironmentCreationError")]
    EnvironmentCreation,
    #[serde(rename = "EnvironmentCorruptedError")]
    EnvironmentCorrupted,
    #[serde(rename = "NoActiveEnvironmentError")]
    NoActiveEnvironment,
    #[serde(rename = "RequirementsNotFoundError")]
    RequirementsNotFound,
    #[serde(rename = "RegistryUnavailableError")]
    RegistryUnavailable,
    #[serde(rename = "BusyError")]
    Busy,
    #[serde(rename = "NotFoundError")]
    NotFound,
    #[serde(rename = "SubprocessFailure")]
    SubprocessFailure,
    #[serde(rename = "SessionNotFoundError")]
    SessionNotFound,
    #[serde(rename = "IoError")]
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ToolNotAvailable => "ToolNotAvailableError",
            ErrorKind::EnvironmentNotFound => "EnvironmentNotFoundError",
            ErrorKind::EnvironmentCreation => "EnvironmentCreationError",
            ErrorKind::EnvironmentCorrupted => "EnvironmentCorruptedError",
            ErrorKind::NoActiveEnvironment => "NoActiveEnvironmentError",
            ErrorKind::RequirementsNotFound => "RequirementsNotFoundError",
            ErrorKind::RegistryUnavailable => "RegistryUnavailableError",
            ErrorKind::Busy => "BusyError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::SubprocessFailure => "SubprocessFailure",
            ErrorKind::SessionNotFound => "SessionNotFoundError",
            ErrorKind::Io => "IoError",
        };
        f.write_str(name)
    }
}

/// Error type for environment and package operations.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("{0}")]
    ToolNotAvailable(#[from] ToolUnavailable),

    #[error("Environment '{0}' not found")]
    EnvironmentNotFound(String),

    #[error("Failed to create environment '{name}': {reason}")]
    EnvironmentCreation {
        name: String,
        reason: String,
        /// Captured tool output, when a tool ran.
        output: Option<String>,
    },

    /// Rejected environment name or interpreter selector.
    #[error("Invalid environment request: {0}")]
    InvalidName(String),

    #[error("Environment '{name}' is corrupted: interpreter missing at {python}")]
    EnvironmentCorrupted { name: String, python: String },

    #[error("No active environment")]
    NoActiveEnvironment,

    #[error("Requirements file not found: {0}")]
    RequirementsNotFound(String),

    #[error("Package index unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Another operation is already running for {0}")]
    Busy(String),

    #[error("Package '{0}' not found")]
    NotFound(String),

    #[error("{} failed{}", .command, cancel_suffix(.cancelled))]
    SubprocessFailure {
        command: String,
        output: String,
        cancelled: bool,
    },

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn cancel_suffix(cancelled: &bool) -> &'static str {
    if *cancelled {
        " (cancelled)"
    } else {
        ""
    }
}

impl EnvError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnvError::ToolNotAvailable(_) => ErrorKind::ToolNotAvailable,
            EnvError::EnvironmentNotFound(_) => ErrorKind::EnvironmentNotFound,
            EnvError::EnvironmentCreation { .. } | EnvError::InvalidName(_) => {
                ErrorKind::EnvironmentCreation
            }
            EnvError::EnvironmentCorrupted { .. } => ErrorKind::EnvironmentCorrupted,
            EnvError::NoActiveEnvironment => ErrorKind::NoActiveEnvironment,
            EnvError::RequirementsNotFound(_) => ErrorKind::RequirementsNotFound,
            EnvError::RegistryUnavailable(_) => ErrorKind::RegistryUnavailable,
            EnvError::Busy(_) => ErrorKind::Busy,
            EnvError::NotFound(_) => ErrorKind::NotFound,
            EnvError::SubprocessFailure { .. } => ErrorKind::SubprocessFailure,
            EnvError::UnknownSession(_) => ErrorKind::SessionNotFound,
            EnvError::Io(_) => ErrorKind::Io,
        }
    }

    /// Captured tool output attached to this error, if any.
    pub fn details(&self) -> Option<&str> {
        match self {
            EnvError::EnvironmentCreation { output, .. } => output.as_deref(),
            EnvError::SubprocessFailure { output, .. } => Some(output.as_str()),
            EnvError::ToolNotAvailable(e) => e.reason(),
            _ => None,
        }
        .filter(|s| !s.trim().is_empty())
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            details: self.details().map(str::to_string),
        }
    }

    /// Creation of `name` failed because its tool is missing.
    pub(crate) fn creation_without_tool(name: &str, missing: ToolUnavailable) -> Self {
        EnvError::EnvironmentCreation {
            name: name.to_string(),
            reason: missing.to_string(),
            output: missing.reason().map(str::to_string),
        }
    }

    pub(crate) fn creation(name: &str, reason: impl Into<String>) -> Self {
        EnvError::EnvironmentCreation {
            name: name.to_string(),
            reason: reason.into(),
            output: None,
        }
    }
}

/// Serializable error object handed to external callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<EnvError> for ErrorReport {
    fn from(err: EnvError) -> Self {
        err.report()
    }
}
