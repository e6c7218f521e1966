use std::path::Path;

use sha1::{Digest, Sha1};

use super::error::MetainfoError;
use super::session::SessionInfo;
use crate::bencode::{decode, raw_value, Value};

impl SessionInfo {
    /// Parses a single-file `.torrent`.
    ///
    /// The info hash is the SHA-1 of the info dictionary exactly as it
    /// appears in `data`.
    pub fn from_torrent_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = decode(data)?;
        if root.as_dict().is_none() {
            return Err(MetainfoError::InvalidField("root"));
        }

        let announce = root
            .get(b"announce")
            .and_then(Value::as_str)
            .ok_or(MetainfoError::MissingField("announce"))?;

        let info = root
            .get(b"info")
            .ok_or(MetainfoError::MissingField("info"))?;
        if info.as_dict().is_none() {
            return Err(MetainfoError::InvalidField("info"));
        }
        if info.get(b"files").is_some() {
            return Err(MetainfoError::MultiFile);
        }

        let name = info
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or(MetainfoError::MissingField("name"))?;

        let file_length = info
            .get(b"length")
            .ok_or(MetainfoError::MissingField("length"))?
            .as_integer()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or(MetainfoError::InvalidField("length"))?;

        let piece_length = info
            .get(b"piece length")
            .ok_or(MetainfoError::MissingField("piece length"))?
            .as_integer()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(MetainfoError::InvalidField("piece length"))?;

        let pieces = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidField("pieces"));
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let raw_info = raw_value(data, b"info")?.ok_or(MetainfoError::MissingField("info"))?;
        let info_hash: [u8; 20] = Sha1::digest(raw_info).into();

        Self::new(
            announce,
            info_hash,
            name,
            file_length,
            piece_length,
            piece_hashes,
        )
    }

    /// Reads and parses a `.torrent` file.
    pub async fn from_torrent_file(path: impl AsRef<Path>) -> Result<Self, MetainfoError> {
        let data = tokio::fs::read(path).await?;
        Self::from_torrent_bytes(&data)
    }
}
