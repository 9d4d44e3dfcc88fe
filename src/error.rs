//! WolfElect Error Types

use thiserror::Error;

use crate::coordination::CoordError;

/// Result type alias for WolfElect operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfElect error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Session errors
    #[error("Connection failed to {addresses}: {reason}")]
    Connection { addresses: String, reason: String },

    #[error("Session lost")]
    SessionLost,

    // Election errors
    #[error("Registration failed under {path}: {reason}")]
    Registration { path: String, reason: String },

    #[error("Malformed ticket {name:?} under {path}")]
    Scan { path: String, name: String },

    #[error("Invalid ticket sequence in {0:?}")]
    InvalidSequence(String),

    #[error("Participant is not registered")]
    NotRegistered,

    // Coordination service errors
    #[error("Coordination service error: {0}")]
    Coordination(#[from] CoordError),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is the expected end of a session rather than a fault
    pub fn is_session_lost(&self) -> bool {
        match self {
            Error::SessionLost | Error::ShuttingDown => true,
            Error::Coordination(e) => e.is_session_lost(),
            _ => false,
        }
    }

    /// Check if this error is a protocol violation by the coordination service
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Scan { .. } | Error::InvalidSequence(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lost_classification() {
        assert!(Error::SessionLost.is_session_lost());
        assert!(Error::Coordination(CoordError::Closing).is_session_lost());
        assert!(Error::Coordination(CoordError::ConnectionLoss).is_session_lost());
        assert!(!Error::Coordination(CoordError::NodeExists("/a".into())).is_session_lost());
        assert!(!Error::NotRegistered.is_session_lost());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Scan {
            path: "/election".into(),
            name: "node-x".into(),
        };
        assert_eq!(err.to_string(), "Malformed ticket \"node-x\" under /election");
        assert!(err.is_protocol_violation());

        let err = Error::Registration {
            path: "/election".into(),
            reason: "denied".into(),
        };
        assert!(err.to_string().contains("Registration failed"));
        assert!(!err.is_protocol_violation());
    }
}
