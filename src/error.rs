//! Error types and handling for the DLM control plane
//!
//! This module defines the error taxonomy used throughout the system,
//! providing consistent error handling and reporting across the Allocator,
//! Capability Registry, Driver Contract, and external interfaces.

use thiserror::Error;

/// Result type alias for DLM operations
pub type Result<T> = std::result::Result<T, DlmError>;

/// Main error type for the DLM control plane
#[derive(Debug, Error)]
pub enum DlmError {
    /// Command violates a capability envelope, references an unknown
    /// station/meter, or is missing a required field.
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Transport/network/protocol failure talking to a driver. Retryable.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The circuit breaker for this station/endpoint is open.
    #[error("Circuit open: {message}")]
    CircuitOpen { message: String },

    /// `validate`/`ramp_limit`/etc. called before `discover` completed.
    #[error("Capability not discovered: {message}")]
    NotDiscovered { message: String },

    /// Command invalid for the station's current status (e.g. set-power on offline).
    #[error("State conflict: {message}")]
    StateConflict { message: String },

    /// Site electrical envelope breached. Recorded, never fatal.
    #[error("Constraint violation: {message}")]
    ConstraintViolation { message: String },

    /// Configuration error (missing/invalid file, failed validation).
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Serialization/deserialization errors.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Web server / API errors.
    #[error("Web server error: {message}")]
    Web { message: String },

    /// Timeout waiting on a call or an operation deadline.
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// State store corruption or unrecoverable serialization failure.
    /// Initiates graceful shutdown.
    #[error("Fatal error: {message}")]
    Fatal { message: String },

    /// Generic errors with context.
    #[error("Error: {message}")]
    Generic { message: String },
}

impl DlmError {
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        DlmError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        DlmError::Transport {
            message: message.into(),
        }
    }

    pub fn circuit_open<S: Into<String>>(message: S) -> Self {
        DlmError::CircuitOpen {
            message: message.into(),
        }
    }

    pub fn not_discovered<S: Into<String>>(message: S) -> Self {
        DlmError::NotDiscovered {
            message: message.into(),
        }
    }

    pub fn state_conflict<S: Into<String>>(message: S) -> Self {
        DlmError::StateConflict {
            message: message.into(),
        }
    }

    pub fn constraint_violation<S: Into<String>>(message: S) -> Self {
        DlmError::ConstraintViolation {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        DlmError::Config {
            message: message.into(),
        }
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        DlmError::Io {
            message: message.into(),
        }
    }

    pub fn web<S: Into<String>>(message: S) -> Self {
        DlmError::Web {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        DlmError::Timeout {
            message: message.into(),
        }
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        DlmError::Fatal {
            message: message.into(),
        }
    }

    pub fn generic<S: Into<String>>(message: S) -> Self {
        DlmError::Generic {
            message: message.into(),
        }
    }

    /// Taxonomy code surfaced on the `{ok, error, code}` API envelope (§7).
    pub fn code(&self) -> &'static str {
        match self {
            DlmError::Validation { .. } => "VALIDATION_ERROR",
            DlmError::Transport { .. } => "TRANSPORT_ERROR",
            DlmError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            DlmError::NotDiscovered { .. } => "NOT_DISCOVERED",
            DlmError::StateConflict { .. } => "STATE_CONFLICT",
            DlmError::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            DlmError::Config { .. } => "CONFIG_ERROR",
            DlmError::Serialization { .. } => "SERIALIZATION_ERROR",
            DlmError::Io { .. } => "IO_ERROR",
            DlmError::Web { .. } => "WEB_ERROR",
            DlmError::Timeout { .. } => "TIMEOUT",
            DlmError::Fatal { .. } => "FATAL",
            DlmError::Generic { .. } => "ERROR",
        }
    }

    /// Whether a retry loop (§4.4) may retry this error class.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DlmError::Transport { .. })
    }
}

impl From<std::io::Error> for DlmError {
    fn from(err: std::io::Error) -> Self {
        DlmError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for DlmError {
    fn from(err: serde_yaml::Error) -> Self {
        DlmError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for DlmError {
    fn from(err: serde_json::Error) -> Self {
        DlmError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DlmError::config("test config error");
        assert!(matches!(err, DlmError::Config { .. }));

        let err = DlmError::validation("field", "test validation error");
        assert!(matches!(err, DlmError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = DlmError::config("test error");
        assert_eq!(format!("{}", err), "Configuration error: test error");

        let err = DlmError::validation("test_field", "invalid value");
        assert_eq!(
            format!("{}", err),
            "Validation error: test_field - invalid value"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DlmError::transport("x").code(), "TRANSPORT_ERROR");
        assert_eq!(DlmError::circuit_open("x").code(), "CIRCUIT_OPEN");
        assert!(DlmError::transport("x").is_retryable());
        assert!(!DlmError::circuit_open("x").is_retryable());
    }
}
