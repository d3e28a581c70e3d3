// SPDX-License-Identifier: MIT OR Apache-2.0

//! `serde` helpers for byte fields.
//!
//! Keys, nonces and ciphertexts are written as hex strings when a human readable encoding is used
//! (JSON on the wire) and as raw byte strings otherwise (CBOR in storage).
use serde::{Deserialize, Serialize};
use serde_bytes::{ByteBuf as SerdeByteBuf, Bytes as SerdeBytes};

/// Serialize bytes into a hex string when using a human readable encoding (JSON), otherwise
/// serialize the bytes directly (CBOR).
pub fn serialize_hex<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if serializer.is_human_readable() {
        hex::serde::serialize(value, serializer)
    } else {
        SerdeBytes::new(value).serialize(serializer)
    }
}

/// Deserialize from a hex string into bytes when using a human readable encoding (JSON),
/// otherwise deserialize the bytes directly (CBOR).
pub fn deserialize_hex<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    if deserializer.is_human_readable() {
        hex::serde::deserialize(deserializer)
    } else {
        let bytes = <SerdeByteBuf>::deserialize(deserializer)?;
        Ok(bytes.into_vec())
    }
}

/// Same as [`deserialize_hex`] but checks that exactly `N` bytes were given.
pub fn deserialize_hex_array<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let bytes = deserialize_hex(deserializer)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        serde::de::Error::custom(format!("invalid length {len}, expected {N} bytes"))
    })
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use crate::cbor::{decode_cbor, encode_cbor};

    use super::{deserialize_hex, deserialize_hex_array, serialize_hex};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob {
        #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
        data: Vec<u8>,
        #[serde(
            serialize_with = "serialize_hex",
            deserialize_with = "deserialize_hex_array"
        )]
        nonce: [u8; 4],
    }

    #[test]
    fn hex_in_json() {
        let blob = Blob {
            data: vec![0xde, 0xad],
            nonce: [1, 2, 3, 4],
        };

        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"data":"dead","nonce":"01020304"}"#);

        let again: Blob = serde_json::from_str(&json).unwrap();
        assert_eq!(blob, again);
    }

    #[test]
    fn bytes_in_cbor() {
        let blob = Blob {
            data: vec![0xbe, 0xef],
            nonce: [9, 9, 9, 9],
        };

        let bytes = encode_cbor(&blob).unwrap();
        let again: Blob = decode_cbor(&bytes[..]).unwrap();
        assert_eq!(blob, again);
    }

    #[test]
    fn wrong_array_length() {
        let result: Result<Blob, _> = serde_json::from_str(r#"{"data":"","nonce":"0102"}"#);
        assert!(result.is_err());
    }
}
