use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes a single bencoded value spanning all of `data`.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut cursor = Cursor::new(data);
    let value = cursor.value(0)?;

    if cursor.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(value)
}

/// Returns the raw encoded bytes of `key` in the top-level dictionary of
/// `data`, or `None` if the key is absent.
pub fn raw_value<'a>(data: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>, BencodeError> {
    let mut cursor = Cursor::new(data);
    cursor.expect(b'd')?;

    while cursor.peek()? != b'e' {
        let found = cursor.byte_string()?;
        let start = cursor.pos;
        cursor.skip(1)?;
        if found == key {
            return Ok(Some(&data[start..cursor.pos]));
        }
    }

    Ok(None)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn expect(&mut self, byte: u8) -> Result<(), BencodeError> {
        let found = self.peek()?;
        if found != byte {
            return Err(BencodeError::UnexpectedChar(found as char, self.pos));
        }
        self.pos += 1;
        Ok(())
    }

    /// Reads up to (not including) `delim` and consumes the delimiter.
    fn until(&mut self, delim: u8) -> Result<&'a [u8], BencodeError> {
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == delim)
            .ok_or(BencodeError::UnexpectedEof)?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer().map(Value::Integer),
            b'l' => {
                self.pos += 1;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(list))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    if !self.peek()?.is_ascii_digit() {
                        return Err(BencodeError::NonStringKey);
                    }
                    let key = Bytes::copy_from_slice(self.byte_string()?);
                    let value = self.value(depth + 1)?;
                    dict.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(dict))
            }
            b'0'..=b'9' => Ok(Value::Bytes(Bytes::copy_from_slice(self.byte_string()?))),
            c => Err(BencodeError::UnexpectedChar(c as char, self.pos)),
        }
    }

    fn integer(&mut self) -> Result<i64, BencodeError> {
        self.expect(b'i')?;
        let digits = std::str::from_utf8(self.until(b'e')?)
            .map_err(|_| BencodeError::InvalidInteger("invalid utf8".into()))?;

        if digits.is_empty() {
            return Err(BencodeError::InvalidInteger("empty".into()));
        }
        if digits.starts_with("-0") || (digits.starts_with('0') && digits.len() > 1) {
            return Err(BencodeError::InvalidInteger("leading zeros".into()));
        }

        digits
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(digits.into()))
    }

    fn byte_string(&mut self) -> Result<&'a [u8], BencodeError> {
        let len: usize = std::str::from_utf8(self.until(b':')?)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;

        let data: &'a [u8] = self.data;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Advances past one value without building it.
    fn skip(&mut self, depth: usize) -> Result<(), BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer().map(|_| ()),
            b'l' | b'd' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.skip(depth + 1)?;
                }
                self.pos += 1;
                Ok(())
            }
            b'0'..=b'9' => self.byte_string().map(|_| ()),
            c => Err(BencodeError::UnexpectedChar(c as char, self.pos)),
        }
    }
}
