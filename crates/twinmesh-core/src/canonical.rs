//! CBOR encoding for wire payloads and signed messages.
//!
//! Payloads (profiles, deltas, signals) are plain serde structs encoded with
//! ciborium. Signatures are never computed over those encodings: signed
//! messages are built with [`signing_bytes`], a deterministic encoding of an
//! explicit field list (RFC 8949 core deterministic rules):
//! - Integers use the smallest valid encoding
//! - Definite lengths only
//! - Map keys sorted by encoded bytes

use ciborium::value::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CoreError;

/// Encode a value to CBOR bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    Ok(buf)
}

/// Decode a value from CBOR bytes. Trailing bytes are rejected.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CoreError> {
    let mut cursor = std::io::Cursor::new(bytes);
    let value = ciborium::from_reader(&mut cursor)
        .map_err(|e| CoreError::DecodingError(e.to_string()))?;
    if cursor.position() as usize != bytes.len() {
        return Err(CoreError::DecodingError("trailing bytes".into()));
    }
    Ok(value)
}

/// Build the message a signature covers: `[domain, fields...]` as a
/// deterministic CBOR array.
///
/// The domain string separates signatures made for different purposes, so
/// a signature over a QR payload can never verify as a delta signature.
pub fn signing_bytes(domain: &str, fields: Vec<Value>) -> Vec<u8> {
    let mut items = Vec::with_capacity(fields.len() + 1);
    items.push(Value::Text(domain.to_string()));
    items.extend(fields);

    let mut buf = Vec::new();
    encode_value_to(&mut buf, &Value::Array(items));
    buf
}

/// Recursively encode a CBOR value deterministically.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => encode_bytes(buf, b),
        Value::Text(s) => encode_text(buf, s),
        Value::Array(arr) => {
            encode_uint(buf, 4, arr.len() as u64);
            for item in arr {
                encode_value_to(buf, item);
            }
        }
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Tag(tag, inner) => {
            encode_uint(buf, 6, *tag);
            encode_value_to(buf, inner);
        }
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        // Always the 64-bit form so a value has exactly one encoding.
        Value::Float(f) => {
            buf.push(0xfb);
            buf.extend_from_slice(&f.to_be_bytes());
        }
        _ => buf.push(0xf7),
    }
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();
    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // -1 encodes as 0, -2 as 1, etc.
        encode_uint(buf, 1, (-1 - n) as u64);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_uint(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn encode_text(buf: &mut Vec<u8>, s: &str) {
    encode_uint(buf, 3, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// Encode a map with keys sorted by their encoded bytes.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| {
            let mut key_buf = Vec::new();
            encode_value_to(&mut key_buf, k);
            (key_buf, v)
        })
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}

/// Serde adapter for fixed-size byte arrays.
///
/// Encodes as a CBOR byte string. Decoding also accepts a sequence so the
/// same types work with serde_json.
pub mod bytes_fixed {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        deserializer.deserialize_bytes(FixedVisitor::<N>)
    }

    struct FixedVisitor<const N: usize>;

    impl<'de, const N: usize> Visitor<'de> for FixedVisitor<N> {
        type Value = [u8; N];

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} bytes", N)
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            v.try_into()
                .map_err(|_| E::invalid_length(v.len(), &self))
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = [0u8; N];
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(i, &self))?;
            }
            if seq.next_element::<u8>()?.is_some() {
                return Err(de::Error::invalid_length(N + 1, &self));
            }
            Ok(out)
        }
    }
}

/// Serde adapter for variable-length byte buffers.
pub mod bytes_vec {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_byte_buf(VecVisitor)
    }

    struct VecVisitor;

    impl<'de> Visitor<'de> for VecVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte string")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
            while let Some(b) = seq.next_element()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "bytes_fixed")]
        key: [u8; 32],
        #[serde(with = "bytes_vec")]
        body: Vec<u8>,
        n: u64,
    }

    fn sample() -> Sample {
        Sample {
            key: [7u8; 32],
            body: vec![1, 2, 3],
            n: 42,
        }
    }

    #[test]
    fn test_cbor_roundtrip() {
        let bytes = encode(&sample()).unwrap();
        let decoded: Sample = decode(&bytes).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_json_roundtrip_uses_sequences() {
        let json = serde_json::to_string(&sample()).unwrap();
        let decoded: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = encode(&sample()).unwrap();
        bytes.push(0x00);
        assert!(decode::<Sample>(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_fixed_length() {
        #[derive(Serialize)]
        struct Short {
            #[serde(with = "bytes_vec")]
            key: Vec<u8>,
            #[serde(with = "bytes_vec")]
            body: Vec<u8>,
            n: u64,
        }
        let bytes = encode(&Short {
            key: vec![1; 31],
            body: vec![],
            n: 0,
        })
        .unwrap();
        assert!(decode::<Sample>(&bytes).is_err());
    }

    #[test]
    fn test_decode_garbage_is_error() {
        assert!(decode::<Sample>(&[]).is_err());
        assert!(decode::<Sample>(&[0xff, 0x00, 0x13]).is_err());
    }

    #[test]
    fn test_signing_bytes_deterministic() {
        let a = signing_bytes("test", vec![Value::Integer(1.into()), Value::Bytes(vec![9; 4])]);
        let b = signing_bytes("test", vec![Value::Integer(1.into()), Value::Bytes(vec![9; 4])]);
        assert_eq!(a, b);

        let other_domain = signing_bytes("other", vec![Value::Integer(1.into()), Value::Bytes(vec![9; 4])]);
        assert_ne!(a, other_domain);
    }

    #[test]
    fn test_integer_encoding() {
        let mut buf = Vec::new();
        encode_uint(&mut buf, 0, 23);
        assert_eq!(buf, vec![0x17]);

        buf.clear();
        encode_uint(&mut buf, 0, 24);
        assert_eq!(buf, vec![0x18, 24]);

        buf.clear();
        encode_uint(&mut buf, 0, 256);
        assert_eq!(buf, vec![0x19, 0x01, 0x00]);

        buf.clear();
        encode_integer(&mut buf, (-1i64).into());
        assert_eq!(buf, vec![0x20]);
    }

    #[test]
    fn test_map_keys_sorted() {
        let unsorted = Value::Map(vec![
            (Value::Integer(2.into()), Value::Null),
            (Value::Integer(1.into()), Value::Null),
        ]);
        let sorted = Value::Map(vec![
            (Value::Integer(1.into()), Value::Null),
            (Value::Integer(2.into()), Value::Null),
        ]);
        let mut a = Vec::new();
        let mut b = Vec::new();
        encode_value_to(&mut a, &unsorted);
        encode_value_to(&mut b, &sorted);
        assert_eq!(a, b);
    }
}
