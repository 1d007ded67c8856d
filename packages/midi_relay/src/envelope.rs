//! Relay envelope: the wire shape of one relayed MIDI event.
//!
//! Wire format (JSON object, no framing or version field):
//!
//! ```json
//! { "senderId": "user_k3j2...", "payload": [144, 64, 127], "sentAtMillis": 1718000000000 }
//! ```
//!
//! Browser peers publish `{ "userId", "data", "timestamp" }`; those names are
//! accepted on decode and never written.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;
use crate::ids::ParticipantId;

/// Broadcast event name every envelope travels under.
pub const MIDI_EVENT: &str = "midi-message";

/// One MIDI event as relayed between participants. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MidiEventEnvelope {
    #[serde(alias = "userId")]
    sender_id: ParticipantId,
    #[serde(alias = "data")]
    payload: Vec<u8>,
    #[serde(alias = "timestamp")]
    sent_at_millis: u64,
}

impl MidiEventEnvelope {
    /// Build an envelope. Returns `None` for an empty payload.
    pub fn new(sender_id: ParticipantId, payload: Vec<u8>, sent_at_millis: u64) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }
        Some(Self {
            sender_id,
            payload,
            sent_at_millis,
        })
    }

    pub fn sender_id(&self) -> &ParticipantId {
        &self.sender_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn sent_at_millis(&self) -> u64 {
        self.sent_at_millis
    }
}

/// Encode an envelope into the transport's structured payload.
pub fn encode(envelope: &MidiEventEnvelope) -> Value {
    serde_json::json!({
        "senderId": envelope.sender_id.as_str(),
        "payload": envelope.payload,
        "sentAtMillis": envelope.sent_at_millis,
    })
}

/// Decode a transport payload. Out-of-range bytes, missing fields and empty
/// payloads are all reported as [`DecodeError::MalformedEnvelope`].
pub fn decode(payload: &Value) -> Result<MidiEventEnvelope, DecodeError> {
    let envelope = MidiEventEnvelope::deserialize(payload)
        .map_err(|e| DecodeError::MalformedEnvelope(e.to_string()))?;
    if envelope.payload.is_empty() {
        return Err(DecodeError::MalformedEnvelope(
            "payload must contain at least one byte".to_string(),
        ));
    }
    Ok(envelope)
}

/// Render MIDI bytes for the activity log: `[90 40 7f]`.
pub fn format_midi_bytes(bytes: &[u8]) -> String {
    let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("[{}]", hex.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note_on() -> MidiEventEnvelope {
        MidiEventEnvelope::new("user_a".into(), vec![0x90, 0x40, 0x7f], 1_700_000_000_000)
            .unwrap()
    }

    #[test]
    fn encode_uses_canonical_field_names() {
        let value = encode(&note_on());
        assert_eq!(
            value,
            json!({
                "senderId": "user_a",
                "payload": [144, 64, 127],
                "sentAtMillis": 1_700_000_000_000u64,
            })
        );
    }

    #[test]
    fn decode_round_trip() {
        let envelope = note_on();
        assert_eq!(decode(&encode(&envelope)).unwrap(), envelope);
    }

    #[test]
    fn decode_full_byte_range() {
        let value = json!({ "senderId": "u", "payload": [0, 128, 255], "sentAtMillis": 1 });
        assert_eq!(decode(&value).unwrap().payload(), &[0, 128, 255]);
    }

    #[test]
    fn decode_missing_sender_is_malformed() {
        let value = json!({ "payload": [144, 64, 127], "sentAtMillis": 1 });
        let err = decode(&value).unwrap_err();
        assert_eq!(err.error_code(), "malformed_envelope");
    }

    #[test]
    fn decode_missing_payload_is_malformed() {
        let value = json!({ "senderId": "u", "sentAtMillis": 1 });
        assert!(matches!(
            decode(&value),
            Err(DecodeError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn decode_out_of_range_byte_is_malformed() {
        let value = json!({ "senderId": "u", "payload": [144, 256], "sentAtMillis": 1 });
        assert!(decode(&value).is_err());

        let value = json!({ "senderId": "u", "payload": [-1], "sentAtMillis": 1 });
        assert!(decode(&value).is_err());
    }

    #[test]
    fn decode_non_integer_byte_is_malformed() {
        let value = json!({ "senderId": "u", "payload": [1.5], "sentAtMillis": 1 });
        assert!(decode(&value).is_err());
    }

    #[test]
    fn decode_empty_payload_is_malformed() {
        let value = json!({ "senderId": "u", "payload": [], "sentAtMillis": 1 });
        assert!(decode(&value).is_err());
    }

    #[test]
    fn decode_accepts_browser_field_names() {
        let value = json!({ "userId": "user_web", "data": [176, 7, 100], "timestamp": 42 });
        let envelope = decode(&value).unwrap();
        assert_eq!(envelope.sender_id().as_str(), "user_web");
        assert_eq!(envelope.payload(), &[176, 7, 100]);
        assert_eq!(envelope.sent_at_millis(), 42);
    }

    #[test]
    fn empty_payload_cannot_be_built() {
        assert!(MidiEventEnvelope::new("u".into(), Vec::new(), 0).is_none());
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(format_midi_bytes(&[0x90, 0x40, 0x7f]), "[90 40 7f]");
        assert_eq!(format_midi_bytes(&[0x0a]), "[0a]");
    }
}
