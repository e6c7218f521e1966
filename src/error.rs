use thiserror::Error;

use crate::bencode::BencodeError;
use crate::config::ConfigError;
use crate::metainfo::MetainfoError;
use crate::peer::PeerError;
use crate::storage::StorageError;
use crate::tracker::TrackerError;

/// Any error surfaced by the client.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Metainfo(#[from] MetainfoError),

    #[error(transparent)]
    Bencode(#[from] BencodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("session already started")]
    AlreadyStarted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
