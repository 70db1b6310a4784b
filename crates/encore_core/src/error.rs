//! Core error types for ENCORE.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid identifier format
    InvalidId {
        /// Why the identifier was rejected
        reason: String,
    },

    /// Parse error
    ParseError {
        /// Parser message
        message: String,
    },

    /// I/O failure
    Io {
        /// Rendered I/O error
        reason: String,
    },

    /// Not found
    NotFound {
        /// Kind of entity
        kind: String,
        /// Identifier looked up
        id: String,
    },

    /// Already exists
    AlreadyExists {
        /// Kind of entity
        kind: String,
        /// Conflicting identifier
        id: String,
    },

    /// Operation not legal in the current state
    InvalidState {
        /// Operation attempted
        operation: String,
        /// State the entity was in
        state: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId { reason } => write!(f, "Invalid ID: {}", reason),
            Self::ParseError { message } => write!(f, "Parse error: {}", message),
            Self::Io { reason } => write!(f, "IO error: {}", reason),
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::AlreadyExists { kind, id } => write!(f, "{} already exists: {}", kind, id),
            Self::InvalidState { operation, state } => {
                write!(f, "Cannot {} while {}", operation, state)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::ParseError {
            message: "trailing comma".to_string(),
        };
        assert_eq!(format!("{}", err), "Parse error: trailing comma");

        let err = CoreError::NotFound {
            kind: "Simulation".to_string(),
            id: "default".to_string(),
        };
        assert_eq!(format!("{}", err), "Simulation not found: default");
    }

    #[test]
    fn test_invalid_state_error() {
        let err = CoreError::InvalidState {
            operation: "checkpoint".to_string(),
            state: "unstarted".to_string(),
        };
        assert_eq!(err.to_string(), "Cannot checkpoint while unstarted");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Io { ref reason } if reason.contains("gone")));
    }

    #[test]
    fn test_error_equality() {
        let err1 = CoreError::InvalidId {
            reason: "empty".to_string(),
        };
        let err2 = CoreError::InvalidId {
            reason: "empty".to_string(),
        };
        assert_eq!(err1, err2);

        let err3 = CoreError::Io {
            reason: "empty".to_string(),
        };
        assert_ne!(err1, err3);
    }
}
