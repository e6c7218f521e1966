use bytes::Bytes;

use super::error::PeerError;

/// One bit per piece, most significant bit of byte 0 first.
///
/// Pad bits past `piece_count` are kept at zero. The local copy is the only
/// durable progress record, so anything that builds a bitfield from untrusted
/// bytes either masks the pad bits ([`from_bytes`](Self::from_bytes)) or
/// rejects them ([`try_from_bytes`](Self::try_from_bytes)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a bitfield with every piece set.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Builds a bitfield from a peer's `bitfield` message.
    ///
    /// Short payloads are zero-extended, long ones truncated, and pad bits
    /// masked off. Remote peers are not trusted to get this exactly right.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let expected = piece_count.div_ceil(8);
        let mut bits = bytes[..bytes.len().min(expected)].to_vec();
        bits.resize(expected, 0);

        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    /// Builds a bitfield from saved state, rejecting anything inconsistent.
    pub fn try_from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        if bytes.len() != piece_count.div_ceil(8) {
            return Err(PeerError::InvalidMessage(format!(
                "bitfield is {} bytes, expected {}",
                bytes.len(),
                piece_count.div_ceil(8)
            )));
        }

        let bf = Self {
            bits: bytes.to_vec(),
            piece_count,
        };
        if bf.spare_bits_set() {
            return Err(PeerError::InvalidMessage("bitfield has spare bits set".into()));
        }
        Ok(bf)
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn len(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Indices of set pieces, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.has(i))
    }

    /// Indices of unset pieces, ascending.
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| !self.has(i))
    }

    /// Returns true if `self` holds any piece that `ours` lacks.
    pub fn has_any_missing_from(&self, ours: &Bitfield) -> bool {
        self.ones().any(|i| !ours.has(i))
    }

    fn spare_mask(&self) -> u8 {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare == 0 {
            0
        } else {
            !(0xFFu8 << spare)
        }
    }

    fn spare_bits_set(&self) -> bool {
        match self.bits.last() {
            Some(last) => last & self.spare_mask() != 0,
            None => false,
        }
    }

    fn clear_spare_bits(&mut self) {
        let mask = self.spare_mask();
        if let Some(last) = self.bits.last_mut() {
            *last &= !mask;
        }
    }
}
