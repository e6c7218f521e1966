//! rswarm - a single-file BitTorrent client
//!
//! The crate downloads one torrent payload from a swarm, serves verified
//! pieces back to reciprocating peers and keeps enough state on disk to
//! resume after a restart.
//!
//! # Modules
//!
//! - [`bencode`] - Bencode decoding
//! - [`metainfo`] - Single-file `.torrent` parsing into a [`SessionInfo`]
//! - [`peer`] - Peer wire protocol: handshake, framing, choke/interest flags
//! - [`storage`] - Piece assembly, SHA-1 verification, resume files
//! - [`tracker`] - HTTP tracker announces
//! - [`session`] - Rarest-first scheduling, choking, uploads and the
//!   [`Coordinator`] tying them together
//! - [`config`] - Layered configuration

pub mod bencode;
pub mod config;
pub mod constants;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod session;
pub mod storage;
pub mod tracker;

pub use bencode::{decode, BencodeError, Value};
pub use config::{Config, ConfigError};
pub use error::{Error, Result};
pub use metainfo::{MetainfoError, SessionInfo};
pub use peer::{Bitfield, Block, BlockRequest, Handshake, Message, PeerError, PeerId, PeerLink};
pub use session::{ChokeController, Coordinator, Progress, Scheduler, UploadServicer};
pub use storage::{PieceStore, ResumeStatus, StorageError, StoreOutcome};
pub use tracker::{Announce, AnnounceResponse, HttpTracker, TrackerError, TrackerEvent};
