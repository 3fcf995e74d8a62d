//! Identity packets, device id/name validation, and the `DeviceType` enum.

use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;

/// One of the wire-level device type strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Desktop
    }
}

impl DeviceType {
    /// Parse the wire string, defaulting to `Desktop` for anything
    /// unrecognized or absent.
    pub fn parse_or_default(s: Option<&str>) -> Self {
        match s {
            Some("laptop") => DeviceType::Laptop,
            Some("phone") => DeviceType::Phone,
            Some("tablet") => DeviceType::Tablet,
            Some("tv") => DeviceType::Tv,
            _ => DeviceType::Desktop,
        }
    }

    pub fn as_wire_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }

    /// Icon tag associated with this device type, used by UI layers this
    /// crate does not itself implement.
    pub fn icon_name(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "computer-symbolic",
            DeviceType::Laptop => "laptop-symbolic",
            DeviceType::Phone => "phone-symbolic",
            DeviceType::Tablet => "tablet-symbolic",
            DeviceType::Tv => "tv-symbolic",
        }
    }
}

/// Highest protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u32 = 8;

const DEVICE_ID_LEN: usize = 32;
const DEVICE_ID_MIN_LEN: usize = 32;
const DEVICE_ID_MAX_LEN: usize = 38;
const DEVICE_NAME_MAX_LEN: usize = 32;

/// Characters disallowed anywhere in a device name.
const FORBIDDEN_NAME_CHARS: &[char] = &['"', '\'', ',', '.', ';', ':', '!', '?', '(', ')', '[', ']', '<', '>'];

/// Generate a fresh device id: 32 lowercase hex characters.
pub fn generate_device_id() -> String {
    let mut rng = rand::thread_rng();
    (0..DEVICE_ID_LEN)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// A deviceId is 32-38 characters from `[A-Za-z0-9_-]`.
pub fn validate_device_id(id: &str) -> bool {
    (DEVICE_ID_MIN_LEN..=DEVICE_ID_MAX_LEN).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 1-32 characters, at least one non-whitespace, none of the forbidden set.
pub fn validate_device_name(name: &str) -> bool {
    if name.is_empty() || name.chars().count() > DEVICE_NAME_MAX_LEN {
        return false;
    }
    if !name.chars().any(|c| !c.is_whitespace()) {
        return false;
    }
    !name.chars().any(|c| FORBIDDEN_NAME_CHARS.contains(&c))
}

/// Repair a device name received on the wire: drop disallowed characters,
/// truncate to 32, and fall back to `fallback_id` if nothing remains.
pub fn sanitize_device_name(name: &str, fallback_id: &str) -> String {
    if validate_device_name(name) {
        return name.to_string();
    }

    let cleaned: String = name
        .chars()
        .filter(|c| !FORBIDDEN_NAME_CHARS.contains(c))
        .take(DEVICE_NAME_MAX_LEN)
        .collect();

    if cleaned.chars().any(|c| !c.is_whitespace()) {
        cleaned
    } else {
        fallback_id.to_string()
    }
}

/// A validated, typed view over an identity packet's body.
#[derive(Debug, Clone)]
pub struct IdentityPacket {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: u32,
    pub incoming_capabilities: HashSet<String>,
    pub outgoing_capabilities: HashSet<String>,
}

impl IdentityPacket {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        incoming_capabilities: HashSet<String>,
        outgoing_capabilities: HashSet<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities,
            outgoing_capabilities,
        }
    }

    /// Build the wire packet for this identity.
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            "kdeconnect.identity",
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_wire_str(),
                "protocolVersion": self.protocol_version,
                "incomingCapabilities": self.incoming_capabilities.iter().cloned().collect::<Vec<_>>(),
                "outgoingCapabilities": self.outgoing_capabilities.iter().cloned().collect::<Vec<_>>(),
            }),
        )
    }

    /// Parse and validate an identity packet's body. `deviceName` is
    /// sanitized (never rejected); `deviceId` is rejected outright if
    /// invalid since there is no safe repair for it.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type("kdeconnect.identity") {
            return Err(ProtocolError::InvalidField("type".to_string()));
        }

        let device_id = packet
            .get_string("deviceId")
            .ok_or_else(|| ProtocolError::MissingField("deviceId".to_string()))?
            .to_string();
        if !validate_device_id(&device_id) {
            return Err(ProtocolError::InvalidField("deviceId".to_string()));
        }

        let raw_name = packet.get_string("deviceName").unwrap_or(&device_id);
        let device_name = sanitize_device_name(raw_name, &device_id);

        let device_type = DeviceType::parse_or_default(packet.get_string("deviceType"));
        let protocol_version = packet
            .get_i64("protocolVersion")
            .unwrap_or(PROTOCOL_VERSION as i64) as u32;

        let incoming_capabilities = packet.get_string_array("incomingCapabilities").into_iter().collect();
        let outgoing_capabilities = packet.get_string_array("outgoingCapabilities").into_iter().collect();

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities,
            outgoing_capabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_validate() {
        for _ in 0..50 {
            let id = generate_device_id();
            assert_eq!(id.len(), 32);
            assert!(validate_device_id(&id));
        }
    }

    #[test]
    fn device_id_length_boundaries() {
        assert!(validate_device_id(&"a".repeat(32)));
        assert!(validate_device_id(&"a".repeat(38)));
        assert!(!validate_device_id(&"a".repeat(31)));
        assert!(!validate_device_id(&"a".repeat(39)));
    }

    #[test]
    fn device_id_rejects_bad_chars() {
        assert!(!validate_device_id("has a space and 32 characters!!"));
    }

    #[test]
    fn device_name_rules() {
        assert!(validate_device_name("My Phone"));
        assert!(!validate_device_name(""));
        assert!(!validate_device_name("   "));
        assert!(!validate_device_name("bad;name"));
        assert!(!validate_device_name(&"x".repeat(33)));
    }

    #[test]
    fn sanitize_is_identity_for_valid_names() {
        assert_eq!(sanitize_device_name("My Phone", "fallback"), "My Phone");
    }

    #[test]
    fn sanitize_strips_forbidden_chars() {
        assert_eq!(sanitize_device_name("My; Phone!", "fallback"), "My Phone");
    }

    #[test]
    fn sanitize_falls_back_when_nothing_remains() {
        assert_eq!(sanitize_device_name(";;;!!!", "fallback-id"), "fallback-id");
    }

    #[test]
    fn sanitize_truncates_long_names() {
        let long = "a".repeat(50);
        assert_eq!(sanitize_device_name(&long, "fallback").len(), 32);
    }

    #[test]
    fn identity_round_trips() {
        let identity = IdentityPacket::new(
            "a".repeat(32),
            "My Desktop",
            DeviceType::Desktop,
            ["kdeconnect.ping".to_string()].into_iter().collect(),
            HashSet::new(),
        );
        let packet = identity.to_packet();
        let parsed = IdentityPacket::from_packet(&packet).unwrap();
        assert_eq!(parsed.device_id, identity.device_id);
        assert_eq!(parsed.device_name, "My Desktop");
        assert!(parsed.incoming_capabilities.contains("kdeconnect.ping"));
    }

    #[test]
    fn identity_defaults_device_type_on_absence() {
        let packet = Packet::new(
            "kdeconnect.identity",
            json!({"deviceId": "a".repeat(32), "deviceName": "X"}),
        );
        let parsed = IdentityPacket::from_packet(&packet).unwrap();
        assert_eq!(parsed.device_type, DeviceType::Desktop);
    }
}
