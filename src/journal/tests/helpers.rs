//! Shared test record type for journal tests.

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Miniature write record — a key plus an optional value, shaped like the
/// nursery's real journal records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRecord {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl TestRecord {
    pub fn put(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            value: Some(value.to_vec()),
        }
    }

    pub fn delete(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            value: None,
        }
    }
}

impl encoding::Encode for TestRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for TestRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (value, n) = <Option<Vec<u8>>>::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { key, value }, off))
    }
}
