//! Protocol error taxonomy.
//!
//! These are the failures a peer can cause on the wire or in shared
//! memory. Their display strings travel inside DISCONNECT messages, so
//! they are part of the observable protocol surface and must stay
//! stable.

use thiserror::Error;

/// Protocol error raised while validating peer input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer's advertised version range does not contain ours.
    #[error("incompatible memif version")]
    IncompatibleVersion,

    /// The INIT version does not match ours exactly.
    #[error("incompatible memif driver version")]
    IncompatibleDriverVersion,

    /// No free server-role port with the requested id exists.
    #[error("invalid interface id")]
    InvalidInterfaceId,

    /// The INIT secret does not match the port's configured secret.
    #[error("invalid secret")]
    InvalidSecret,

    /// ADD_RING names a queue pair beyond the negotiated count.
    #[error("invalid ring index")]
    InvalidRingIndex,

    /// ADD_REGION or a descriptor names a region that does not exist.
    #[error("invalid memory region index")]
    InvalidRegionIndex,

    /// A descriptor points outside its region.
    #[error("descriptor out of region bounds")]
    DescriptorOutOfBounds,

    /// Unrecognised message kind on the control channel.
    #[error("unknown message {0}")]
    UnknownMessage(u16),

    /// A known message arrived in a handshake state that cannot accept it.
    #[error("unexpected message {0}")]
    UnexpectedMessage(u16),

    /// A control message arrived with a size other than 128 bytes.
    #[error("invalid message size {0}")]
    InvalidMessageSize(usize),

    /// ADD_REGION or ADD_RING arrived without its ancillary fd.
    #[error("missing file descriptor")]
    MissingFd,

    /// A ring header's cookie does not match the well-known constant.
    #[error("wrong cookie")]
    WrongCookie,

    /// A NEXT-chained packet ended before its final descriptor.
    #[error("incomplete chained buffer, may suggest peer error")]
    IncompleteChain,
}

/// Result type alias for protocol-level operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_reason_strings() {
        // These strings are matched by peers; keep them verbatim.
        assert_eq!(
            Error::IncompatibleVersion.to_string(),
            "incompatible memif version"
        );
        assert_eq!(Error::InvalidSecret.to_string(), "invalid secret");
        assert_eq!(
            Error::InvalidInterfaceId.to_string(),
            "invalid interface id"
        );
        assert_eq!(Error::WrongCookie.to_string(), "wrong cookie");
    }

    #[test]
    fn test_unknown_message_includes_kind() {
        assert_eq!(Error::UnknownMessage(42).to_string(), "unknown message 42");
    }
}
