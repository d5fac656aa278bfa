//! Error types for transport operations.

use thiserror::Error;

/// Error type for memif transport operations.
#[derive(Debug, Error)]
pub enum MemifError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation by the peer; closes the control channel.
    #[error("protocol error: {0}")]
    Protocol(#[from] memif_core::Error),

    /// Configuration error, returned to the caller immediately.
    #[error("configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// The peer sent DISCONNECT.
    #[error("peer disconnected: {reason}")]
    Disconnected {
        /// Numeric disconnect code.
        code: u32,
        /// Reason carried in the message.
        reason: String,
    },

    /// The peer hung up on the control channel.
    #[error("hang up: {name}")]
    HangUp {
        /// Name of the port or socket the channel belonged to.
        name: String,
    },

    /// A queue index beyond the negotiated queue-pair count.
    #[error("invalid queue index {index}")]
    InvalidQueueIndex {
        /// Requested index.
        index: usize,
    },

    /// A readiness event arrived for a descriptor the reactor does not own.
    #[error("fd not found: {fd}")]
    FdNotFound {
        /// The unowned file descriptor.
        fd: i32,
    },
}

impl MemifError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// The reason string carried in a DISCONNECT message for this
    /// error. Protocol errors travel bare; peers match on them.
    pub(crate) fn wire_reason(&self) -> String {
        match self {
            Self::Protocol(err) => err.to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for memif transport operations.
pub type Result<T> = std::result::Result<T, MemifError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = MemifError::config("port with id 0 role Server already exists on this socket");
        assert!(err.to_string().contains("already exists"));
        assert!(err.to_string().starts_with("configuration error"));
    }

    #[test]
    fn test_protocol_error_from_core() {
        let err: MemifError = memif_core::Error::InvalidSecret.into();
        assert_eq!(err.to_string(), "protocol error: invalid secret");
    }

    #[test]
    fn test_disconnected_display() {
        let err = MemifError::Disconnected {
            code: 0,
            reason: "Socket deleted".into(),
        };
        assert_eq!(err.to_string(), "peer disconnected: Socket deleted");
    }
}
