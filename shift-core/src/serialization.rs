//! Canonical CBOR encoding for journal entries and destruction proofs.
//!
//! Counterparties exchange destruction proofs as bytes and the settlement
//! journal persists entries as bytes, so both must decode identically on every
//! implementation. Encoding follows RFC 8949 §4.2: definite lengths only,
//! minimal integer encoding, struct fields in declaration order.

use serde::{Deserialize, Serialize};
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("CBOR encoding error: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("CBOR decoding error: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Non-canonical CBOR: {0}")]
    NonCanonical(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SerializationError>;

/// Serialize a value to canonical CBOR bytes.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    verify_canonical(&buf)?;
    Ok(buf)
}

/// Deserialize a value from canonical CBOR bytes, rejecting indefinite-length input.
pub fn from_canonical_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    verify_canonical(bytes)?;
    let value = ciborium::from_reader(bytes)?;
    Ok(value)
}

fn verify_canonical(bytes: &[u8]) -> Result<()> {
    let mut cursor = std::io::Cursor::new(bytes);
    verify_canonical_item(&mut cursor)?;
    if (cursor.position() as usize) != bytes.len() {
        return Err(SerializationError::NonCanonical("trailing bytes after item"));
    }
    Ok(())
}

fn verify_canonical_item<R: Read>(reader: &mut R) -> Result<()> {
    let mut head = [0u8; 1];
    reader.read_exact(&mut head)?;

    let major_type = head[0] >> 5;
    let additional_info = head[0] & 0x1F;

    if additional_info == 31 {
        return Err(SerializationError::NonCanonical("indefinite-length item"));
    }

    let argument: u64 = match additional_info {
        0..=23 => u64::from(additional_info),
        24 => {
            let mut buf = [0u8; 1];
            reader.read_exact(&mut buf)?;
            if buf[0] < 24 && major_type != 7 {
                return Err(SerializationError::NonCanonical("non-minimal integer"));
            }
            u64::from(buf[0])
        }
        25 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;
            u64::from(u16::from_be_bytes(buf))
        }
        26 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            u64::from(u32::from_be_bytes(buf))
        }
        27 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            u64::from_be_bytes(buf)
        }
        _ => return Err(SerializationError::NonCanonical("reserved additional info")),
    };

    match major_type {
        // unsigned, negative, simple/float: no nested content
        0 | 1 | 7 => {}
        2 | 3 => {
            let len = usize::try_from(argument)
                .map_err(|_| SerializationError::NonCanonical("string length overflow"))?;
            let mut sink = vec![0u8; len];
            reader.read_exact(&mut sink)?;
        }
        4 => {
            for _ in 0..argument {
                verify_canonical_item(reader)?;
            }
        }
        5 => {
            for _ in 0..argument {
                verify_canonical_item(reader)?;
                verify_canonical_item(reader)?;
            }
        }
        6 => verify_canonical_item(reader)?,
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceId, SignatureBytes};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Envelope {
        device: DeviceId,
        key_index: u32,
        signature: SignatureBytes,
    }

    fn envelope() -> Envelope {
        Envelope {
            device: DeviceId([9u8; 32]),
            key_index: 300,
            signature: SignatureBytes([0xaa; 64]),
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let bytes1 = to_canonical_cbor(&envelope()).unwrap();
        let bytes2 = to_canonical_cbor(&envelope()).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn test_decode_preserves_fixed_arrays() {
        let bytes = to_canonical_cbor(&envelope()).unwrap();
        let decoded: Envelope = from_canonical_cbor(&bytes).unwrap();
        assert_eq!(decoded, envelope());
    }

    #[test]
    fn test_rejects_indefinite_length() {
        // indefinite-length array [1] terminated by break
        let bytes = [0x9f, 0x01, 0xff];
        let result: Result<Vec<u8>> = from_canonical_cbor(&bytes);
        assert!(matches!(result, Err(SerializationError::NonCanonical(_))));
    }

    #[test]
    fn test_rejects_non_minimal_integer() {
        // 5 encoded with a one-byte argument
        let bytes = [0x18, 0x05];
        let result: Result<u64> = from_canonical_cbor(&bytes);
        assert!(matches!(result, Err(SerializationError::NonCanonical(_))));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = to_canonical_cbor(&7u32).unwrap();
        bytes.push(0x00);
        let result: Result<u32> = from_canonical_cbor(&bytes);
        assert!(result.is_err());
    }
}
