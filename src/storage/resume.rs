use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::StorageError;
use crate::peer::Bitfield;

const MAGIC: &[u8; 4] = b"RSWM";
const VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

/// Serializes the completion bitfield: magic, version byte, big-endian
/// piece count, then the bitfield bytes.
pub fn encode(bitfield: &Bitfield) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + bitfield.as_bytes().len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u32(bitfield.len() as u32);
    buf.put_slice(bitfield.as_bytes());
    buf.freeze()
}

/// Parses a saved bitfield, checking it against the session's piece count.
pub fn decode(mut data: &[u8], piece_count: usize) -> Result<Bitfield, StorageError> {
    if data.len() < HEADER_LEN {
        return Err(StorageError::CorruptResume("truncated header".into()));
    }
    if &data[..4] != MAGIC {
        return Err(StorageError::CorruptResume("bad magic".into()));
    }
    data.advance(4);

    let version = data.get_u8();
    if version != VERSION {
        return Err(StorageError::CorruptResume(format!(
            "unsupported version {version}"
        )));
    }

    let saved_count = data.get_u32() as usize;
    if saved_count != piece_count {
        return Err(StorageError::CorruptResume(format!(
            "saved for {saved_count} pieces, session has {piece_count}"
        )));
    }

    Bitfield::try_from_bytes(data, piece_count)
        .map_err(|e| StorageError::CorruptResume(e.to_string()))
}

/// Writes `data` to a sibling temp file and renames it over `path`.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
