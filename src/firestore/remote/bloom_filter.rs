use std::error::Error;
use std::fmt::{Display, Formatter};

use md5::{Digest, Md5};

use crate::firestore::remote::watch_change::BloomFilterPayload;
use crate::firestore::value::BytesValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloomFilterErrorCode {
    InvalidBitmap,
    InvalidPadding,
    InvalidHashCount,
}

/// Raised when an `unchangedNames` payload cannot be turned into a filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilterError {
    pub code: BloomFilterErrorCode,
    message: String,
}

impl BloomFilterError {
    fn new(code: BloomFilterErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for BloomFilterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.message, self.code)
    }
}

impl Error for BloomFilterError {}

/// Bloom filter over document resource names, as sent by the backend with
/// existence filters. Bits are numbered least significant first within each
/// byte; the last `padding` bits of the bitmap are unused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> Result<Self, BloomFilterError> {
        if !(0..8).contains(&padding) {
            return Err(BloomFilterError::new(
                BloomFilterErrorCode::InvalidPadding,
                format!("Invalid padding: {padding}"),
            ));
        }
        if hash_count < 0 {
            return Err(BloomFilterError::new(
                BloomFilterErrorCode::InvalidHashCount,
                format!("Invalid hash count: {hash_count}"),
            ));
        }
        if bitmap.is_empty() && hash_count > 0 {
            return Err(BloomFilterError::new(
                BloomFilterErrorCode::InvalidHashCount,
                format!("Invalid hash count for an empty bitmap: {hash_count}"),
            ));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(BloomFilterError::new(
                BloomFilterErrorCode::InvalidHashCount,
                "Invalid hash count: 0",
            ));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(BloomFilterError::new(
                BloomFilterErrorCode::InvalidPadding,
                format!("Invalid padding when bitmap length is 0: {padding}"),
            ));
        }
        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    /// Decodes the wire payload, including its base64 bitmap.
    pub fn from_payload(payload: &BloomFilterPayload) -> Result<Self, BloomFilterError> {
        let bitmap = BytesValue::from_base64(&payload.bitmap).map_err(|err| {
            BloomFilterError::new(
                BloomFilterErrorCode::InvalidBitmap,
                format!("Invalid base64 bitmap: {err}"),
            )
        })?;
        Self::new(bitmap.as_slice().to_vec(), payload.padding, payload.hash_count)
    }

    /// Empty filter of `bit_count` bits with `values` inserted.
    pub fn create<'a, I>(bit_count: u64, hash_count: i32, values: I) -> Result<Self, BloomFilterError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let padding = if bit_count % 8 == 0 { 0 } else { 8 - bit_count % 8 };
        let bitmap = vec![0u8; bit_count.div_ceil(8) as usize];
        let mut filter = Self::new(bitmap, padding as i32, hash_count)?;
        for value in values {
            filter.insert(value);
        }
        Ok(filter)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    /// `false` means definitely absent; `true` may be a false positive.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (hash1, hash2) = hash_halves(value);
        (0..self.hash_count).all(|index| self.is_bit_set(self.bit_index(hash1, hash2, index)))
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (hash1, hash2) = hash_halves(value);
        for index in 0..self.hash_count {
            let bit = self.bit_index(hash1, hash2, index);
            self.bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    fn bit_index(&self, hash1: u64, hash2: u64, index: u32) -> u64 {
        hash1.wrapping_add(hash2.wrapping_mul(index as u64)) % self.bit_count
    }

    fn is_bit_set(&self, bit: u64) -> bool {
        self.bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }
}

/// The two little-endian 64-bit halves of the MD5 digest of `value`.
fn hash_halves(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut low = [0u8; 8];
    let mut high = [0u8; 8];
    low.copy_from_slice(&digest[..8]);
    high.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(low), u64::from_le_bytes(high))
}
