//! Piece storage, verification and resume.
//!
//! [`PieceStore`] assembles blocks into pieces in memory, checks each
//! finished piece against its SHA-1, writes verified pieces into a single
//! pre-allocated payload file and persists the completion bitfield to a
//! sidecar file after every change so a later run can resume.

mod error;
mod resume;
mod store;

pub use error::StorageError;
pub use store::{PieceStore, ResumeStatus, StoreOutcome};

#[cfg(test)]
mod tests;
