//! Peer wire protocol.
//!
//! A [`PeerLink`] owns one TCP connection: it performs the 68-byte
//! handshake, frames messages (4-byte big-endian length, ID byte, payload),
//! tracks the choke/interest flags for both sides and sends keepalives.
//! Have, bitfield, request, piece and cancel messages are surfaced to the
//! session as [`PeerEvent`]s.

mod bitfield;
mod error;
mod link;
mod message;
mod peer_id;
mod piece;
mod transport;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use link::{
    Direction, LinkSettings, LinkState, PeerEvent, PeerEventKind, PeerFlags, PeerLink, RemotePeer,
};
pub use message::{Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use piece::{Block, BlockRequest};
pub use transport::{FrameReader, FrameWriter};

#[cfg(test)]
mod tests;
