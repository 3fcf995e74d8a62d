//! KDE Connect packet envelope: parse, validate, build, serialize.
//!
//! Packets are JSON objects terminated by a single `0x0A` byte on the wire
//! (framing itself lives in [`crate::channel`]). This module only concerns
//! itself with the envelope: `id`, `type`, `body`, and the optional payload
//! coordinates.

use crate::error::{ProtocolError, Result};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// A single KDE Connect wire packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// UNIX-epoch-ms timestamp. May be `0` before the packet has been sent
    /// for the first time; [`crate::channel::Channel::write_packet`]
    /// refreshes it on every write.
    pub id: i64,
    /// Packet type, e.g. `"kdeconnect.identity"`.
    pub packet_type: String,
    /// Opaque body, interpreted by the plugin that owns `packet_type`.
    pub body: Value,
    /// Declared payload size in bytes, `-1` for indefinite.
    pub payload_size: Option<i64>,
    /// Transport-specific payload connection hints.
    pub payload_transfer_info: Option<Map<String, Value>>,
}

impl Packet {
    /// Build an empty packet of the given type with the given body.
    ///
    /// `id` starts at `0`; it is stamped with the current time when the
    /// packet is actually written to a channel.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: 0,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Build a packet with an explicit id (used when replaying persisted
    /// identity packets, where the original timestamp should be kept).
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Set a field on the body object in place.
    ///
    /// No-op if `body` is not a JSON object (it always should be for a
    /// packet that passed [`Packet::validate`]).
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    pub fn with_payload_transfer_info(mut self, info: Map<String, Value>) -> Self {
        self.payload_transfer_info = Some(info);
        self
    }

    /// Structural validation rules from the wire format:
    /// `body` must be an object; if present, `payloadSize` must already be
    /// an integer and `payloadTransferInfo` an object (both are enforced at
    /// parse time by [`Packet::from_bytes`], so this mainly guards
    /// programmatically constructed packets before they're written).
    pub fn validate(&self) -> Result<()> {
        if !self.body.is_object() {
            return Err(ProtocolError::InvalidField("body".to_string()));
        }
        if self.packet_type.is_empty() {
            return Err(ProtocolError::MissingField("type".to_string()));
        }
        Ok(())
    }

    /// Serialize to a newline-terminated UTF-8 JSON byte sequence.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse and validate one packet from a (possibly whitespace-padded)
    /// byte slice.
    ///
    /// Fails with [`ProtocolError::InvalidData`] on empty input,
    /// [`ProtocolError::Malformed`] on non-JSON input, and
    /// [`ProtocolError::MissingField`]/[`ProtocolError::InvalidField`] on a
    /// structurally invalid envelope.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = trim_control_bytes(data);
        if trimmed.is_empty() {
            return Err(ProtocolError::InvalidData("empty packet".to_string()));
        }

        let value: Value = serde_json::from_slice(trimmed)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::InvalidData("root is not a JSON object".to_string()))?;

        let packet_type = match obj.get("type") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(ProtocolError::InvalidField("type".to_string())),
            None => return Err(ProtocolError::MissingField("type".to_string())),
        };

        let body = match obj.get("body") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(_) => return Err(ProtocolError::InvalidField("body".to_string())),
            None => return Err(ProtocolError::MissingField("body".to_string())),
        };

        let payload_size = match obj.get("payloadSize") {
            Some(Value::Number(n)) => Some(
                n.as_i64()
                    .ok_or_else(|| ProtocolError::InvalidField("payloadSize".to_string()))?,
            ),
            Some(_) => return Err(ProtocolError::InvalidField("payloadSize".to_string())),
            None => None,
        };

        let payload_transfer_info = match obj.get("payloadTransferInfo") {
            Some(Value::Object(map)) => Some(map.clone()),
            Some(_) => {
                return Err(ProtocolError::InvalidField(
                    "payloadTransferInfo".to_string(),
                ))
            }
            None => None,
        };

        let id = match obj.get("id") {
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| ProtocolError::InvalidField("id".to_string()))?,
            Some(Value::String(s)) => s
                .parse::<i64>()
                .map_err(|_| ProtocolError::InvalidField("id".to_string()))?,
            Some(_) => return Err(ProtocolError::InvalidField("id".to_string())),
            None => 0,
        };

        Ok(Self {
            id,
            packet_type,
            body,
            payload_size,
            payload_transfer_info,
        })
    }

    /// A packet "has payload" iff `payloadTransferInfo` is present.
    pub fn has_payload(&self) -> bool {
        self.payload_transfer_info.is_some()
    }

    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Deserialize an arbitrary body field, returning `None` on absence or
    /// type mismatch rather than propagating an error.
    pub fn get_body_field<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.body.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.body.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.body.get(key).and_then(Value::as_f64)
    }

    /// Returns `None` for a missing field *and* for a present-but-empty
    /// string, so callers can treat both uniformly as "not supplied".
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn get_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.body.get(key).and_then(Value::as_array)
    }

    pub fn get_object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.body.get(key).and_then(Value::as_object)
    }

    pub fn get_string_array(&self, key: &str) -> Vec<String> {
        self.get_array(key)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Serialize for Packet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut len = 3;
        if self.payload_size.is_some() {
            len += 1;
        }
        if self.payload_transfer_info.is_some() {
            len += 1;
        }
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("type", &self.packet_type)?;
        map.serialize_entry("body", &self.body)?;
        if let Some(size) = self.payload_size {
            map.serialize_entry("payloadSize", &size)?;
        }
        if let Some(info) = &self.payload_transfer_info {
            map.serialize_entry("payloadTransferInfo", info)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Packet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

/// Strip leading/trailing NUL and whitespace bytes (the LF delimiter and any
/// stray padding a transport might leave behind).
fn trim_control_bytes(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|&b| b != 0 && !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|&b| b != 0 && !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(0);
    if start >= end {
        &[]
    } else {
        &data[start..end]
    }
}

/// Current UNIX epoch time in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_bytes() {
        let p = Packet::new("kdeconnect.ping", json!({"message": "hi"}));
        let bytes = p.to_bytes().unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
        let back = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(back.packet_type, "kdeconnect.ping");
        assert_eq!(back.get_string("message"), Some("hi"));
    }

    #[test]
    fn empty_input_is_invalid_data() {
        let err = Packet::from_bytes(b"   \n").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidData(_)));
    }

    #[test]
    fn non_json_is_malformed() {
        let err = Packet::from_bytes(b"not json\n").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn missing_type_is_missing_field() {
        let err = Packet::from_bytes(br#"{"id":1,"body":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField(_)));
    }

    #[test]
    fn wrong_type_for_body_is_invalid_field() {
        let err = Packet::from_bytes(br#"{"id":1,"type":"x","body":"nope"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField(_)));
    }

    #[test]
    fn id_accepts_number_or_string() {
        let from_num = Packet::from_bytes(br#"{"id":5,"type":"x","body":{}}"#).unwrap();
        assert_eq!(from_num.id, 5);
        let from_str = Packet::from_bytes(br#"{"id":"5","type":"x","body":{}}"#).unwrap();
        assert_eq!(from_str.id, 5);
    }

    #[test]
    fn empty_string_field_reads_as_absent() {
        let p = Packet::new("x", json!({"name": ""}));
        assert_eq!(p.get_string("name"), None);
    }

    #[test]
    fn has_payload_requires_transfer_info() {
        let p = Packet::new("x", json!({})).with_payload_size(10);
        assert!(!p.has_payload());
        let p = p.with_payload_transfer_info(Map::new());
        assert!(p.has_payload());
    }

    #[test]
    fn string_array_filters_non_strings() {
        let p = Packet::new("x", json!({"caps": ["a", 1, "b"]}));
        assert_eq!(p.get_string_array("caps"), vec!["a".to_string(), "b".to_string()]);
    }
}
