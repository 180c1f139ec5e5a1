use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;

/// Opaque byte string; ordered lexicographically by unsigned byte value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BytesValue(Vec<u8>);

impl BytesValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Accepts both padded and unpadded standard base64.
    pub fn from_base64(value: &str) -> Result<Self, base64::DecodeError> {
        STANDARD
            .decode(value)
            .or_else(|_| STANDARD_NO_PAD.decode(value))
            .map(Self)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<u8>> for BytesValue {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrip() {
        let bytes = BytesValue::new(vec![1, 2, 3, 4]);
        let encoded = bytes.to_base64();
        assert_eq!(encoded, "AQIDBA==");
        let decoded = BytesValue::from_base64(&encoded).unwrap();
        assert_eq!(decoded.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(BytesValue::from_base64("AQIDBA").unwrap(), decoded);
    }

    #[test]
    fn rejects_garbage() {
        assert!(BytesValue::from_base64("!!!").is_err());
    }
}
