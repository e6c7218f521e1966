use std::fmt::Write as _;

use super::error::MetainfoError;

/// Immutable description of one download, shared as `Arc<SessionInfo>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Tracker announce URL.
    pub announce: String,
    /// SHA-1 of the bencoded info dictionary.
    pub info_hash: [u8; 20],
    /// Suggested file name.
    pub name: String,
    /// Total payload length in bytes.
    pub file_length: u64,
    /// Nominal piece length; every piece but the last has this length.
    pub piece_length: u32,
    /// Length of the final piece, in `1..=piece_length`.
    pub last_piece_length: u32,
    /// Expected SHA-1 digest of each piece, in order.
    pub piece_hashes: Vec<[u8; 20]>,
}

impl SessionInfo {
    /// Builds a session from its parts, deriving the last piece length.
    ///
    /// Fails if the number of hashes does not match
    /// `ceil(file_length / piece_length)`.
    pub fn new(
        announce: impl Into<String>,
        info_hash: [u8; 20],
        name: impl Into<String>,
        file_length: u64,
        piece_length: u32,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self, MetainfoError> {
        if piece_length == 0 {
            return Err(MetainfoError::InvalidField("piece length"));
        }
        if file_length == 0 {
            return Err(MetainfoError::InvalidField("length"));
        }

        let expected = file_length.div_ceil(piece_length as u64);
        if piece_hashes.len() as u64 != expected {
            return Err(MetainfoError::InvalidField("pieces"));
        }

        let remainder = (file_length % piece_length as u64) as u32;
        let last_piece_length = if remainder == 0 {
            piece_length
        } else {
            remainder
        };

        Ok(Self {
            announce: announce.into(),
            info_hash,
            name: name.into(),
            file_length,
            piece_length,
            last_piece_length,
            piece_hashes,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`, or 0 if out of range.
    pub fn piece_len(&self, index: u32) -> u32 {
        let count = self.piece_count() as u32;
        if index >= count {
            0
        } else if index == count - 1 {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }

    /// Byte offset of piece `index` in the payload file.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }

    pub fn info_hash_hex(&self) -> String {
        self.info_hash
            .iter()
            .fold(String::with_capacity(40), |mut out, b| {
                let _ = write!(out, "{b:02x}");
                out
            })
    }
}
