//! Codec for encoding and decoding relay envelopes.
//!
//! Text frames carry JSON, binary frames carry named MessagePack. Older
//! producers send the JSON envelope base64-encoded inside a text frame;
//! [`decode_lenient`] accepts both.
//!
//! Decoding never panics on arbitrary input. Every failure is a
//! [`ProtocolError`] the caller is free to drop.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::Envelope;
use crate::topic::Topic;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Nesting limit for binary frames, the same as `serde_json`'s recursion limit.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The frame is not a well-formed envelope.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    /// The topic string is not `<channel>:<event>`.
    #[error("Invalid topic {topic:?}: {reason}")]
    InvalidTopic {
        /// The rejected string.
        topic: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Encode an envelope as JSON text.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Encode an envelope as named MessagePack.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode_binary(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(envelope)?))
}

/// Decode an envelope from JSON text.
///
/// # Errors
///
/// Returns an error if the text is not a JSON object with a valid `event`
/// topic and a `data` field.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|_| ProtocolError::MalformedEnvelope("not a structured value"))?;
    from_value(value)
}

/// Decode an envelope from named MessagePack.
///
/// # Errors
///
/// Returns an error if the bytes are not a MessagePack map shaped like an envelope.
pub fn decode_binary(data: &[u8]) -> Result<Envelope, ProtocolError> {
    let mut deserializer = rmp_serde::Deserializer::from_read_ref(data);
    deserializer.set_max_depth(MAX_NESTING_DEPTH);
    let value = Value::deserialize(&mut deserializer)
        .map_err(|_| ProtocolError::MalformedEnvelope("not a structured value"))?;
    from_value(value)
}

/// Decode an envelope sent in the legacy base64 text encoding.
///
/// # Errors
///
/// Returns an error if the text is not base64 or does not wrap a valid envelope.
pub fn decode_legacy(text: &str) -> Result<Envelope, ProtocolError> {
    let raw = STANDARD
        .decode(text.trim())
        .map_err(|_| ProtocolError::MalformedEnvelope("not base64"))?;
    let value: Value = serde_json::from_slice(&raw)
        .map_err(|_| ProtocolError::MalformedEnvelope("not a structured value"))?;
    from_value(value)
}

/// Decode text in the standard encoding, falling back to the legacy one.
///
/// # Errors
///
/// Returns the standard decoder's error if neither encoding matches.
pub fn decode_lenient(text: &str) -> Result<Envelope, ProtocolError> {
    decode(text).or_else(|err| decode_legacy(text).map_err(|_| err))
}

/// Validate a structured value as an envelope.
///
/// # Errors
///
/// Returns an error if the value is not an object, the `event` field is
/// missing or not a valid topic, or the `data` field is missing.
pub fn from_value(value: Value) -> Result<Envelope, ProtocolError> {
    let Value::Object(mut fields) = value else {
        return Err(ProtocolError::MalformedEnvelope("not an object"));
    };

    let topic = take_topic(&mut fields)?;
    // `null` is a present payload; only an absent field is malformed.
    let payload = fields
        .remove("data")
        .ok_or(ProtocolError::MalformedEnvelope("missing data field"))?;

    Ok(Envelope { topic, payload })
}

fn take_topic(fields: &mut Map<String, Value>) -> Result<Topic, ProtocolError> {
    match fields.remove("event") {
        Some(Value::String(raw)) => Topic::parse(raw),
        Some(_) => Err(ProtocolError::MalformedEnvelope("event field is not a string")),
        None => Err(ProtocolError::MalformedEnvelope("missing event field")),
    }
}

/// Size-limited codec used on live connections.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    max_frame_size: usize,
}

impl EnvelopeCodec {
    /// Create a codec that rejects frames larger than `max_frame_size`.
    ///
    /// The limit is clamped to [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    /// The effective frame size limit.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Decode a text frame in the standard encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or malformed.
    pub fn decode_text(&self, text: &str) -> Result<Envelope, ProtocolError> {
        self.check_size(text.len())?;
        decode(text)
    }

    /// Decode a text frame in either the standard or the legacy encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or malformed.
    pub fn decode_text_lenient(&self, text: &str) -> Result<Envelope, ProtocolError> {
        self.check_size(text.len())?;
        decode_lenient(text)
    }

    /// Decode a binary frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or malformed.
    pub fn decode_binary(&self, data: &[u8]) -> Result<Envelope, ProtocolError> {
        self.check_size(data.len())?;
        decode_binary(data)
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(topic: &str, payload: Value) -> Envelope {
        Envelope::new(Topic::parse(topic).unwrap(), payload)
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let envelopes = vec![
            envelope("game:goal_scored", json!({"scorer": "X"})),
            envelope("game:update_state", json!({"time": 10, "teams": [1, 2.5, null]})),
            envelope("relay:register", json!("game:clock")),
            envelope("game:clock", Value::Null),
        ];

        for env in envelopes {
            let text = encode(&env).unwrap();
            assert_eq!(decode(&text).unwrap(), env);

            let bin = encode_binary(&env).unwrap();
            assert_eq!(decode_binary(&bin).unwrap(), env);
        }
    }

    #[test]
    fn test_wire_field_names() {
        let text = encode(&envelope("game:clock", json!(3))).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"event": "game:clock", "data": 3}));
    }

    #[test]
    fn test_decode_malformed() {
        let cases = [
            "",
            "not json",
            "[1,2,3]",
            r#"{"data": {}}"#,
            r#"{"event": 5, "data": {}}"#,
            r#"{"event": "noseparator", "data": {}}"#,
            r#"{"event": ":event", "data": {}}"#,
            r#"{"event": "game:goal_scored"}"#,
        ];

        for raw in cases {
            assert!(decode(raw).is_err(), "expected failure for {raw:?}");
        }
    }

    #[test]
    fn test_decode_null_payload_is_present() {
        let env = decode(r#"{"event": "game:clock", "data": null}"#).unwrap();
        assert_eq!(env.payload, Value::Null);
    }

    #[test]
    fn test_decode_legacy_base64() {
        let json = r#"{"event":"game:goal_scored","data":{"scorer":"X"}}"#;
        let legacy = STANDARD.encode(json);

        assert!(decode(&legacy).is_err());
        let env = decode_lenient(&legacy).unwrap();
        assert_eq!(env, envelope("game:goal_scored", json!({"scorer": "X"})));

        // Standard frames still take the fast path.
        assert_eq!(decode_lenient(json).unwrap(), env);
    }

    #[test]
    fn test_decode_lenient_rejects_garbage() {
        assert!(decode_lenient("%%%").is_err());
        assert!(decode_lenient(&STANDARD.encode("plain words")).is_err());
    }

    #[test]
    fn test_decode_binary_garbage() {
        assert!(decode_binary(&[0xc1, 0xff, 0x00]).is_err());
        assert!(decode_binary(&[]).is_err());
    }

    /// `{"event": "game:clock", "data": [[[...null...]]]}` with `depth` arrays.
    fn nested_binary_frame(depth: usize) -> Vec<u8> {
        let mut frame = vec![0x82, 0xa5];
        frame.extend_from_slice(b"event");
        frame.push(0xaa);
        frame.extend_from_slice(b"game:clock");
        frame.push(0xa4);
        frame.extend_from_slice(b"data");
        frame.extend(std::iter::repeat(0x91).take(depth));
        frame.push(0xc0);
        frame
    }

    #[test]
    fn test_decode_binary_nesting_limit() {
        let shallow = decode_binary(&nested_binary_frame(64)).unwrap();
        assert_eq!(shallow.topic.as_str(), "game:clock");

        // Run on a small stack so unbounded recursion would abort the test.
        let deep = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| {
                EnvelopeCodec::new(64 * 1024)
                    .decode_binary(&nested_binary_frame(1_000))
                    .is_err()
            })
            .unwrap()
            .join()
            .unwrap();
        assert!(deep);
    }

    #[test]
    fn test_codec_frame_limit() {
        let codec = EnvelopeCodec::new(32);
        let text = encode(&envelope("game:update_state", json!({"padding": "x".repeat(64)})))
            .unwrap();

        match codec.decode_text(&text) {
            Err(ProtocolError::FrameTooLarge { max: 32, .. }) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }

        assert_eq!(EnvelopeCodec::new(usize::MAX).max_frame_size(), MAX_FRAME_SIZE);
    }
}
