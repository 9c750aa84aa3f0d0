//! Compact string codec for everything sent to the extension backend.
//!
//! Wire format:
//! ```text
//! value ──serde_json──► JSON text ──LZ4 (size-prepended)──► bytes ──base64──► String
//! ```
//!
//! The remote platform only accepts strings, and its configuration segment
//! is size-bounded, so payloads are compressed before being made text-safe.
//! Decoding is the exact inverse.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Decoding an empty string. There is no such thing as decoding nothing.
    #[error("No data to decode")]
    Empty,
    #[error("Serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("Deserialization failed: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Size figures for one encode call, for logging only.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncodeStats {
    /// Bytes of canonical JSON before compression.
    pub json_bytes: usize,
    /// Bytes of the final encoded string.
    pub encoded_bytes: usize,
}

impl EncodeStats {
    /// Encoded size relative to the JSON size, as a signed percentage.
    pub fn change_percent(&self) -> i64 {
        if self.json_bytes == 0 {
            return 0;
        }
        let delta = self.encoded_bytes as f64 - self.json_bytes as f64;
        (100.0 * delta / self.json_bytes as f64).round() as i64
    }
}

/// Encode a value into its compact string form.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    encode_with_stats(value).map(|(encoded, _)| encoded)
}

/// Encode a value and report how much the compression saved.
pub fn encode_with_stats<T: Serialize + ?Sized>(
    value: &T,
) -> Result<(String, EncodeStats), CodecError> {
    let json = serde_json::to_vec(value).map_err(CodecError::Serialize)?;
    let compressed = lz4_flex::compress_prepend_size(&json);
    let encoded = STANDARD.encode(compressed);

    let stats = EncodeStats {
        json_bytes: json.len(),
        encoded_bytes: encoded.len(),
    };
    log::debug!(
        "Encoded {} JSON bytes to {} chars ({}%)",
        stats.json_bytes,
        stats.encoded_bytes,
        stats.change_percent()
    );

    Ok((encoded, stats))
}

/// Decode a string produced by [`encode`] back into a value.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    if text.is_empty() {
        return Err(CodecError::Empty);
    }
    let compressed = STANDARD.decode(text)?;
    let json = lz4_flex::decompress_size_prepended(&compressed)?;
    log::trace!("Decoded {} chars to {} JSON bytes", text.len(), json.len());
    serde_json::from_slice(&json).map_err(CodecError::Deserialize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_roundtrip_structured_value() {
        let value = json!({
            "type": "bulkUpdateState",
            "payload": {
                "page": "Grimoire",
                "seats": [
                    { "user": "alice", "isDead": false, "isVoteless": false, "revealed": true },
                    { "isDead": true, "isVoteless": true, "revealed": false }
                ],
                "ratio": 0.22,
                "nothing": null
            }
        });

        let encoded = encode(&value).unwrap();
        let decoded: Value = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_roundtrip_scalars() {
        for value in [json!(0), json!("ünïcödé"), json!([]), json!({}), json!(true)] {
            let decoded: Value = decode(&encode(&value).unwrap()).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_decode_empty_fails() {
        let result: Result<Value, _> = decode("");
        assert!(matches!(result, Err(CodecError::Empty)));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<Value, _> = decode("not base64 at all!");
        assert!(matches!(result, Err(CodecError::Base64(_))));

        // valid base64, invalid LZ4 block
        let bogus = STANDARD.encode([16u8, 0, 0, 0, 0xF0]);
        let result: Result<Value, _> = decode(&bogus);
        assert!(matches!(result, Err(CodecError::Decompress(_))));
    }

    #[test]
    fn test_output_is_text_safe() {
        let encoded = encode(&json!({ "k": "\u{0}\u{1}\u{2}" })).unwrap();
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='));
    }

    #[test]
    fn test_repetitive_payload_shrinks() {
        let seats: Vec<Value> = (0..15)
            .map(|i| {
                json!({
                    "user": format!("player{i}"),
                    "isDead": false,
                    "isVoteless": false,
                    "revealed": false
                })
            })
            .collect();
        let (_, stats) = encode_with_stats(&json!({ "seats": seats })).unwrap();

        assert!(stats.encoded_bytes < stats.json_bytes, "{stats:?}");
        assert!(stats.change_percent() < 0);
    }

    #[test]
    fn test_stats_zero_json() {
        assert_eq!(EncodeStats::default().change_percent(), 0);
    }
}
