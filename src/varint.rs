//! LEB128 varints used by the message codec and the replicated state.
//!
//! `uvarint` is the base-128 encoding of a u64 (at most 10 bytes), `varint`
//! zigzag-maps an i64 first so small negative numbers stay short.

use bytes::BufMut;

/// Longest encoding of a u64.
pub const MAX_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// Input ended in the middle of a varint
    Truncated,
    /// More than 64 bits of payload
    Overflow,
}

impl std::fmt::Display for VarintError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarintError::Truncated => write!(f, "truncated varint"),
            VarintError::Overflow => write!(f, "varint overflows 64 bits"),
        }
    }
}

impl std::error::Error for VarintError {}

#[inline]
pub fn put_uvarint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

#[inline]
pub fn put_varint<B: BufMut>(buf: &mut B, value: i64) {
    put_uvarint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

/// Returns (value, bytes consumed).
#[inline]
pub fn read_uvarint(buf: &[u8]) -> Result<(u64, usize), VarintError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_LEN {
            return Err(VarintError::Overflow);
        }
        if byte < 0x80 {
            if i == MAX_LEN - 1 && byte > 1 {
                return Err(VarintError::Overflow);
            }
            return Ok((value | (byte as u64) << shift, i + 1));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }

    Err(VarintError::Truncated)
}

#[inline]
pub fn read_varint(buf: &[u8]) -> Result<(i64, usize), VarintError> {
    let (u, n) = read_uvarint(buf)?;
    let value = ((u >> 1) as i64) ^ -((u & 1) as i64);
    Ok((value, n))
}

/// Encoded length of a uvarint.
#[inline]
pub fn uvarint_len(mut value: u64) -> usize {
    let mut n = 1;
    while value >= 0x80 {
        value >>= 7;
        n += 1;
    }
    n
}

/// Cursor over a byte slice for sequential varint-framed reads.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn uvarint(&mut self) -> Result<u64, VarintError> {
        let (v, n) = read_uvarint(self.buf)?;
        self.buf = &self.buf[n..];
        Ok(v)
    }

    pub fn varint(&mut self) -> Result<i64, VarintError> {
        let (v, n) = read_varint(self.buf)?;
        self.buf = &self.buf[n..];
        Ok(v)
    }

    pub fn byte(&mut self) -> Result<u8, VarintError> {
        let (&b, tail) = self.buf.split_first().ok_or(VarintError::Truncated)?;
        self.buf = tail;
        Ok(b)
    }

    /// Length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<&'a [u8], VarintError> {
        let len = self.uvarint()? as usize;
        if len > self.buf.len() {
            return Err(VarintError::Truncated);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}
