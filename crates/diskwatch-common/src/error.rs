//! Error types for diskwatch
//!
//! This module defines the common error type used throughout the daemon
//! and its library crates.

use thiserror::Error;

/// Common result type for diskwatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for diskwatch
#[derive(Debug, Error)]
pub enum Error {
    // Transport errors
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command timed out")]
    Timeout,

    // Protocol errors
    #[error("command not supported: {0}")]
    UnsupportedCommand(String),

    #[error("malformed response: {0}")]
    BadResponse(String),

    #[error("device not ready")]
    NotReady,

    #[error("no medium present")]
    NoMedium,

    #[error("device becoming ready")]
    BecomingReady,

    // Capability errors: the device lacks the requested feature.
    // The caller downgrades the directive instead of failing the device.
    #[error("device lacks capability: {0}")]
    Capability(String),

    // Configuration errors, fatal at initial load
    #[error("file {file} line {line}: {msg}")]
    Config {
        file: String,
        line: u32,
        msg: String,
    },

    // State file errors, log and reset
    #[error("state file error: {0}")]
    State(String),

    // Scheduling errors, fatal at load
    #[error("invalid test schedule: {0}")]
    Schedule(String),

    // Resource errors, fatal
    #[error("resource error: {0}")]
    Resource(String),
}

impl Error {
    /// Create an unsupported-command error
    pub fn unsupported(cmd: impl Into<String>) -> Self {
        Self::UnsupportedCommand(cmd.into())
    }

    /// Create a malformed-response error
    pub fn bad_response(msg: impl Into<String>) -> Self {
        Self::BadResponse(msg.into())
    }

    /// Create a capability error
    pub fn capability(msg: impl Into<String>) -> Self {
        Self::Capability(msg.into())
    }

    /// Create a configuration error with file/line context
    pub fn config(file: impl Into<String>, line: u32, msg: impl Into<String>) -> Self {
        Self::Config {
            file: file.into(),
            line,
            msg: msg.into(),
        }
    }

    /// Create a state file error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Check if this is a transport-level error
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout)
    }

    /// Check if this error means the device lacks the requested feature
    #[must_use]
    pub fn is_capability(&self) -> bool {
        matches!(self, Self::UnsupportedCommand(_) | Self::Capability(_))
    }

    /// Check if this error is a transient not-ready condition
    #[must_use]
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady | Self::NoMedium | Self::BecomingReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        assert!(Error::unsupported("SMART READ LOG").is_capability());
        assert!(Error::capability("no self-test log").is_capability());
        assert!(Error::Timeout.is_transport());
        assert!(Error::NotReady.is_not_ready());
        assert!(!Error::NotReady.is_capability());
    }

    #[test]
    fn test_config_error_display() {
        let err = Error::config("/etc/diskwatchd.conf", 12, "unknown Directive: -Z");
        assert_eq!(
            err.to_string(),
            "file /etc/diskwatchd.conf line 12: unknown Directive: -Z"
        );
    }
}
