use thiserror::Error;

/// Errors that end a single peer link.
///
/// None of these are fatal to the session; the coordinator drops the peer
/// and carries on with the rest of the swarm.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a malformed handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer is sharing a different torrent.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// A frame whose payload does not fit its message ID.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The length prefix was negative or over the frame limit.
    #[error("invalid frame length: {0}")]
    InvalidLength(i64),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connect, handshake or read timed out.
    #[error("timeout")]
    Timeout,

    /// The link was closed locally.
    #[error("link cancelled")]
    Cancelled,
}
