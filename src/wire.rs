//! Deterministic binary codec for every consensus record.
//!
//! One encoding exists per record: fixed field order, big-endian fixed-width
//! integers, and byte strings prefixed with a u32 length. Encoding is total;
//! decoding fails with [`CoreError::Malformed`] on truncation, over-limit
//! lengths, unknown tags or trailing bytes, so `decode(encode(x)) == x` for
//! every valid record and nothing else parses.

use crate::crypto::{Address, Hash32, ADDRESS_SIZE};
use crate::error::CoreError;
use crate::Result;

/// Absolute ceiling on any single length-prefixed field. Individual decoders
/// pass tighter limits; this guards the codec itself.
pub const MAX_FIELD_BYTES: usize = 8 * 1024 * 1024;

pub trait WireEncode {
    fn encode_into(&self, out: &mut Vec<u8>);

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

pub trait WireDecode: Sized {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self>;

    /// Decode a complete record; trailing bytes are a violation.
    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let value = Self::decode_from(&mut reader)?;
        reader.expect_end()?;
        Ok(value)
    }
}

/// Bounds-checked cursor over an input buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn expect_end(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(CoreError::Malformed(format!(
                "{} trailing bytes after record",
                self.remaining()
            )));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CoreError::Malformed(format!(
                "truncated record: wanted {n} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CoreError::Malformed(format!("bad bool byte {other:#04x}"))),
        }
    }

    pub fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn hash(&mut self) -> Result<Hash32> {
        let bytes = self.take(32)?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(bytes);
        Ok(hash)
    }

    pub fn address(&mut self) -> Result<Address> {
        let bytes = self.take(ADDRESS_SIZE)?;
        let mut raw = [0u8; ADDRESS_SIZE];
        raw.copy_from_slice(bytes);
        Ok(Address::from_raw(raw))
    }

    /// Length-prefixed byte string, rejected above `max` bytes.
    pub fn bytes(&mut self, max: usize) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > max.min(MAX_FIELD_BYTES) {
            return Err(CoreError::Malformed(format!(
                "field length {len} exceeds limit {}",
                max.min(MAX_FIELD_BYTES)
            )));
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Count-prefixed sequence, rejected above `max` items.
    pub fn vec<T>(&mut self, max: usize, item: impl Fn(&mut Reader<'a>) -> Result<T>) -> Result<Vec<T>> {
        let count = self.u32()? as usize;
        if count > max {
            return Err(CoreError::Malformed(format!(
                "sequence length {count} exceeds limit {max}"
            )));
        }
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(item(self)?);
        }
        Ok(items)
    }
}

/// Encoding helpers mirroring the [`Reader`] accessors.
pub trait Writer {
    fn put_u8(&mut self, v: u8);
    fn put_bool(&mut self, v: bool);
    fn put_u16(&mut self, v: u16);
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
    fn put_hash(&mut self, v: &Hash32);
    fn put_address(&mut self, v: &Address);
    fn put_bytes(&mut self, v: &[u8]);
}

impl Writer for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_bool(&mut self, v: bool) {
        self.push(v as u8);
    }

    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_hash(&mut self, v: &Hash32) {
        self.extend_from_slice(v);
    }

    fn put_address(&mut self, v: &Address) {
        self.extend_from_slice(v.as_bytes());
    }

    fn put_bytes(&mut self, v: &[u8]) {
        debug_assert!(v.len() <= u32::MAX as usize);
        self.put_u32(v.len() as u32);
        self.extend_from_slice(v);
    }
}
