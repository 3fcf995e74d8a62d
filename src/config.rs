//! In-process configuration surface for [`crate::manager::DeviceManager`].
//!
//! Callers build a [`ManagerConfig`] value however they like (env vars, a
//! config crate, hardcoded defaults for tests) and hand it to
//! [`crate::manager::DeviceManager::start`]. This crate parses no
//! configuration file format itself.

use crate::identity::DeviceType;
use std::path::PathBuf;

/// Default certificate validity in years for a freshly generated local
/// certificate.
pub const DEFAULT_CERT_VALIDITY_YEARS: i64 = 10;

/// Maximum number of concurrently known unpaired devices.
pub const DEFAULT_MAX_UNPAIRED_DEVICES: usize = 10;

/// Configuration consulted by [`crate::manager::DeviceManager::start`].
///
/// No file format is parsed to produce this value; it's the caller's
/// responsibility to construct one, typically from whatever configuration
/// mechanism the embedding application already uses.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Overrides the local display name. `None` or empty falls back to the
    /// system hostname.
    pub display_name: Option<String>,
    /// Install-wide directory holding this device's `certificate.pem`,
    /// `key.pem`, and the known-peers `devices.json`.
    pub state_dir: PathBuf,
    /// Root directory under which each device gets a per-device context
    /// directory (keyed by deviceId) holding `certificate.pem` (the peer's,
    /// iff paired) and plugin-owned files.
    pub device_context_dir: PathBuf,
    /// Validity period for a freshly generated local certificate.
    pub cert_validity_years: i64,
    /// Cap on concurrently known unpaired devices. Exposed so tests can
    /// exercise the cap cheaply without creating ten devices.
    pub max_unpaired_devices: usize,
    /// Overrides the device type advertised in the local identity packet.
    /// `None` defaults to `Desktop`: this crate ships no DMI/chassis probe.
    pub device_type: Option<DeviceType>,
}

impl ManagerConfig {
    /// Build a config rooted at `state_dir`, with `device_context_dir`
    /// defaulting to `state_dir/devices` and every other field at its
    /// documented default.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        let device_context_dir = state_dir.join("devices");
        Self {
            display_name: None,
            state_dir,
            device_context_dir,
            cert_validity_years: DEFAULT_CERT_VALIDITY_YEARS,
            max_unpaired_devices: DEFAULT_MAX_UNPAIRED_DEVICES,
            device_type: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_max_unpaired_devices(mut self, max: usize) -> Self {
        self.max_unpaired_devices = max;
        self
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = Some(device_type);
        self
    }

    /// Resolve the display name to use: the configured value if non-empty,
    /// else the system hostname, else a fixed fallback.
    pub fn resolve_display_name(&self) -> String {
        match &self.display_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => hostname(),
        }
    }

    pub fn local_cert_path(&self) -> PathBuf {
        self.state_dir.join("certificate.pem")
    }

    pub fn local_key_path(&self) -> PathBuf {
        self.state_dir.join("key.pem")
    }

    pub fn known_peers_path(&self) -> PathBuf {
        self.state_dir.join("devices.json")
    }

    pub fn device_dir(&self, device_id: &str) -> PathBuf {
        self.device_context_dir.join(device_id)
    }
}

/// Best-effort system hostname, falling back to a fixed name if it can't be
/// determined.
pub(crate) fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "kdeconnect-device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_are_rooted_at_state_dir() {
        let dir = TempDir::new().unwrap();
        let config = ManagerConfig::new(dir.path());
        assert_eq!(config.local_cert_path(), dir.path().join("certificate.pem"));
        assert_eq!(config.known_peers_path(), dir.path().join("devices.json"));
        assert_eq!(
            config.device_dir("abc"),
            dir.path().join("devices").join("abc")
        );
    }

    #[test]
    fn empty_display_name_falls_back_to_hostname() {
        let dir = TempDir::new().unwrap();
        let config = ManagerConfig::new(dir.path()).with_display_name("   ");
        assert!(!config.resolve_display_name().trim().is_empty());
        assert_ne!(config.resolve_display_name(), "   ");
    }

    #[test]
    fn configured_display_name_is_used() {
        let dir = TempDir::new().unwrap();
        let config = ManagerConfig::new(dir.path()).with_display_name("My Desktop");
        assert_eq!(config.resolve_display_name(), "My Desktop");
    }

    #[test]
    fn defaults_match_documented_values() {
        let dir = TempDir::new().unwrap();
        let config = ManagerConfig::new(dir.path());
        assert_eq!(config.cert_validity_years, 10);
        assert_eq!(config.max_unpaired_devices, 10);
    }
}
