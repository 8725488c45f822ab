//! Error types shared by the client and server roles

use thiserror::Error;

/// A packet that does not match the command schema of the receiving role.
///
/// Protocol errors are never fatal: the offending packet is dropped and the
/// receiving host decides whether the sender has misbehaved often enough to
/// be disconnected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet of {0} bytes is too short to carry a command tag")]
    MissingTag(usize),

    #[error("unrecognized command tag {0}")]
    UnknownCommand(u16),

    #[error("no handler bound for command tag {0}")]
    Unhandled(u16),

    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),

    #[error("{0} unread bytes after payload")]
    TrailingBytes(usize),

    #[error("invalid field `{0}` in payload")]
    InvalidField(&'static str),
}

/// Failures of the datagram transport underneath the command protocol.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes is shorter than the frame header")]
    Truncated(usize),

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("unknown channel {0}")]
    UnknownChannel(u8),
}
