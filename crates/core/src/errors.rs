//! Error types for the cmbridge core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and
//! [`AdapterError`] unifies them: every public adapter operation returns it,
//! so callers only ever handle one error type with a readable message.

use std::path::PathBuf;

use thiserror::Error;

use crate::features::Feature;

// ---------------------------------------------------------------------------
// Adapter (top-level) errors
// ---------------------------------------------------------------------------

/// Unified error type returned by every [`WorkingCopyAdapter`] operation.
///
/// [`WorkingCopyAdapter`]: crate::adapter::WorkingCopyAdapter
#[derive(Debug, Error)]
pub enum AdapterError {
    /// `add` was called on entries that are already under version control.
    #[error("already under version control: {}", display_paths(.paths))]
    AlreadyTracked { paths: Vec<PathBuf> },

    /// Conflict data was requested for an entry that is not conflicted.
    #[error("'{}' is not conflicted", .0.display())]
    NotConflicted(PathBuf),

    /// The adapter does not support the requested optional feature.
    #[error("feature '{0}' is not supported by this adapter")]
    UnsupportedFeature(Feature),

    /// An entry is locked by another sandbox.
    #[error("exclusive checkout violated: {0}")]
    ExclusivityViolation(String),

    /// One or more entries of a batched operation failed.
    #[error("{operation} failed: {message}")]
    Batch { operation: String, message: String },

    /// A single backend call failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The backend accepted the resolve request but left the conflict open.
    #[error("failed to resolve conflict on '{}'", .0.display())]
    ResolveFailed(PathBuf),

    /// A revision handed back by the caller carries no repository path.
    #[error("internal error: revision {0} has no path data")]
    MissingRevisionPath(u64),

    /// `export` was given an entry without a destination.
    #[error("no export destination given for '{}'", .0.display())]
    MissingDestination(PathBuf),

    /// A path is outside the adapter's sandbox.
    #[error("'{}' is not inside the sandbox", .0.display())]
    NotInSandbox(PathBuf),

    /// No workspace is bound to the sandbox root.
    #[error("no workspace found for directory '{}'", .0.display())]
    NoWorkspace(PathBuf),

    /// A sandbox already exists where a new one was requested.
    #[error("a sandbox already exists at '{}'", .0.display())]
    SandboxExists(PathBuf),

    /// The adapter was used before `connect`.
    #[error("adapter is not connected")]
    NotConnected,

    /// The session the adapter was built on has been closed.
    #[error("repository session is closed")]
    SessionClosed,

    #[error(transparent)]
    Revision(#[from] RevisionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Local file system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Backend errors
// ---------------------------------------------------------------------------

/// A failure reported by a repository backend.
///
/// `code` is a stable, machine-readable identifier (see
/// [`crate::backend::codes`]); `message` is the backend's diagnostic text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: String,
    pub message: String,
}

impl BackendError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        Self::new(crate::backend::codes::IO, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Revision errors
// ---------------------------------------------------------------------------

/// Errors from parsing revision specifiers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RevisionError {
    /// The text is not a valid revision or revision range.
    #[error("invalid revision specifier '{spec}': {detail}")]
    InvalidSpec { spec: String, detail: String },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = AdapterError::AlreadyTracked {
            paths: vec![PathBuf::from("/sb/a.txt"), PathBuf::from("/sb/b.txt")],
        };
        assert_eq!(
            err.to_string(),
            "already under version control: /sb/a.txt, /sb/b.txt"
        );

        let err = AdapterError::UnsupportedFeature(Feature::Lock);
        assert_eq!(err.to_string(), "feature 'lock' is not supported by this adapter");

        let err = BackendError::new("ItemLocked", "locked by sandbox-2");
        assert_eq!(err.to_string(), "ItemLocked: locked by sandbox-2");

        let err = ConfigError::InvalidValue {
            field: "history.max_entries".into(),
            detail: "must be > 0".into(),
        };
        assert!(err.to_string().contains("history.max_entries"));
    }

    #[test]
    fn test_adapter_error_from_subsystem() {
        let err: AdapterError = BackendError::new("OutOfDate", "stale").into();
        assert!(matches!(err, AdapterError::Backend(_)));

        let err: AdapterError = RevisionError::InvalidSpec {
            spec: "x".into(),
            detail: "not a number".into(),
        }
        .into();
        assert!(matches!(err, AdapterError::Revision(_)));
    }
}
