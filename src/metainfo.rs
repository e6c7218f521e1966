//! Torrent metainfo.
//!
//! Only single-file torrents are supported. A parsed torrent is reduced to
//! a [`SessionInfo`]: the announce URL, the info hash and the piece layout
//! every other part of the client works from.

mod error;
mod session;
mod torrent;

pub use error::MetainfoError;
pub use session::SessionInfo;

#[cfg(test)]
mod tests;
