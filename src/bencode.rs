//! Bencode decoding.
//!
//! Torrent files and tracker responses are bencoded. Only decoding is
//! needed here; [`raw_value`] additionally returns the exact bytes of one
//! top-level dictionary entry so the info hash can be taken over the
//! original encoding rather than a re-encoding.

mod decode;
mod error;
mod value;

pub use decode::{decode, raw_value};
pub use error::BencodeError;
pub use value::Value;
