//! The device manager: local certificate lifecycle, channel-service
//! hosting, device admission, and known-peers persistence.
//!
//! Device state lives behind an `Arc<RwLock<...>>` table, consistent with
//! this crate's other shared-state types; certificate bootstrap follows a
//! load-or-generate sequence.

use crate::channel::Channel;
use crate::config::ManagerConfig;
use crate::crypto::CertificateInfo;
use crate::device::Device;
use crate::error::{ProtocolError, Result};
use crate::identity::{generate_device_id, DeviceType, IdentityPacket};
use crate::packet::Packet;
use crate::plugin::PluginRegistry;
use crate::transport::TransportFactory;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Owns this peer's local identity, the set of registered transport
/// factories ("channel services"), and every [`Device`] discovered or
/// restored from disk.
pub struct DeviceManager {
    config: ManagerConfig,
    local_certificate: CertificateInfo,
    registry: Arc<PluginRegistry>,
    cancel: CancellationToken,
    display_name: RwLock<String>,
    devices: RwLock<HashMap<String, Arc<Device>>>,
    services: RwLock<Vec<Arc<dyn TransportFactory>>>,
    /// Serializes reads and writes of the known-peers file: concurrent
    /// writers would otherwise race on a read-modify-write cycle.
    known_peers_lock: Mutex<()>,
}

impl DeviceManager {
    /// Bring up the manager: ensure the local certificate exists, reload any
    /// previously known peers, and return a manager ready to accept
    /// transport factories and channels.
    pub async fn start(config: ManagerConfig, registry: Arc<PluginRegistry>) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&config.state_dir).await?;
        tokio::fs::create_dir_all(&config.device_context_dir).await?;

        let local_certificate = Self::load_or_generate_certificate(&config).await?;
        let display_name = config.resolve_display_name();
        info!(device_id = %local_certificate.device_id, %display_name, "device manager starting");

        let manager = Arc::new(Self {
            cancel: CancellationToken::new(),
            devices: RwLock::new(HashMap::new()),
            services: RwLock::new(Vec::new()),
            display_name: RwLock::new(display_name),
            known_peers_lock: Mutex::new(()),
            local_certificate,
            registry,
            config,
        });

        manager.load_known_peers().await;
        Ok(manager)
    }

    async fn load_or_generate_certificate(config: &ManagerConfig) -> Result<CertificateInfo> {
        let cert_path = config.local_cert_path();
        let key_path = config.local_key_path();
        let validity_years = config.cert_validity_years;

        tokio::task::spawn_blocking(move || {
            if cert_path.exists() && key_path.exists() {
                CertificateInfo::load_from_files(&cert_path, &key_path)
            } else {
                let device_id = generate_device_id();
                let cert = CertificateInfo::generate(device_id, validity_years)?;
                cert.save_to_files(&cert_path, &key_path)?;
                Ok(cert)
            }
        })
        .await
        .map_err(|e| ProtocolError::Configuration(e.to_string()))?
    }

    /// Rebuild previously known devices from the known-peers file. A device
    /// whose peer certificate is still on disk is restored `Paired`; one
    /// whose isn't (pairing was revoked out-of-band) is restored `Unpaired`
    /// but still present, so its last-seen display name remains available.
    async fn load_known_peers(self: &Arc<Self>) {
        let path = self.config.known_peers_path();
        let data = match tokio::fs::read(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                error!(error = %e, "failed to read known-peers file");
                return;
            }
        };
        let known: HashMap<String, Packet> = match serde_json::from_slice(&data) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "known-peers file is corrupt, ignoring");
                return;
            }
        };

        for (device_id, packet) in known {
            let identity = match IdentityPacket::from_packet(&packet) {
                Ok(i) => i,
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "dropping invalid known-peer entry");
                    continue;
                }
            };

            let device = Device::new(
                device_id.clone(),
                self.config.device_dir(&device_id),
                self.registry.clone(),
                self.cancel.child_token(),
            );
            if let Err(e) = device.handle_identity(identity).await {
                warn!(device_id = %device_id, error = %e, "failed to seed known-peer identity");
                continue;
            }
            if device.has_persisted_pairing() {
                device.restore_paired().await;
            }

            self.devices.write().await.insert(device_id.clone(), device.clone());
            self.spawn_state_watcher(device);
            info!(device_id = %device_id, "restored known device");
        }
    }

    /// Register a channel-service transport factory; `refresh()` broadcasts
    /// through every registered factory.
    pub async fn register_transport_factory(&self, factory: Arc<dyn TransportFactory>) {
        self.services.write().await.push(factory);
    }

    /// `identify(None)` on every registered transport factory.
    pub async fn refresh(&self) {
        let services = self.services.read().await;
        for service in services.iter() {
            if let Err(e) = service.identify(None).await {
                warn!(transport = service.transport_type(), error = %e, "identity broadcast failed");
            }
        }
    }

    /// Build the local identity packet from the currently loaded plugin set.
    pub async fn build_identity(&self) -> Packet {
        let device_type = self.config.device_type.unwrap_or(DeviceType::Desktop);
        IdentityPacket::new(
            self.local_certificate.device_id.clone(),
            self.display_name.read().await.clone(),
            device_type,
            self.registry.incoming_capabilities(),
            self.registry.outgoing_capabilities(),
        )
        .to_packet()
    }

    pub fn local_certificate(&self) -> &CertificateInfo {
        &self.local_certificate
    }

    pub async fn display_name(&self) -> String {
        self.display_name.read().await.clone()
    }

    /// Update the configured display name; empty strings fall back to the
    /// system hostname. Does not force-rebuild existing channels — only
    /// the next broadcast identity carries the change.
    pub async fn set_display_name(&self, name: impl Into<String>) {
        let name = name.into();
        let resolved = if name.trim().is_empty() {
            crate::config::hostname()
        } else {
            name
        };
        *self.display_name.write().await = resolved.clone();
        info!(display_name = %resolved, "display name updated");
    }

    pub async fn device(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    async fn unpaired_device_count(&self) -> usize {
        let devices = self.devices.read().await;
        let mut count = 0;
        for device in devices.values() {
            if !device.is_paired().await {
                count += 1;
            }
        }
        count
    }

    /// Admit a freshly negotiated channel. Resolves or creates the device
    /// for the channel's peer identity, subject to the
    /// unpaired-device cap; drops the channel outright on rejection.
    pub async fn on_channel(self: &Arc<Self>, channel: Arc<Channel>) -> Result<()> {
        let Some(identity) = channel.peer_identity().await else {
            warn!("dropping channel with no peer identity");
            channel.close().await.ok();
            return Err(ProtocolError::MissingField("peer identity".to_string()));
        };
        let device_id = identity.device_id.clone();

        let existing = self.devices.read().await.get(&device_id).cloned();
        let device = match existing {
            Some(device) => device,
            None => {
                if self.unpaired_device_count().await >= self.config.max_unpaired_devices {
                    warn!(device_id = %device_id, "rejecting channel: unpaired device cap reached");
                    channel.close().await.ok();
                    return Err(ProtocolError::PermissionDenied(
                        "unpaired device cap reached".to_string(),
                    ));
                }
                let device = Device::new(
                    device_id.clone(),
                    self.config.device_dir(&device_id),
                    self.registry.clone(),
                    self.cancel.child_token(),
                );
                self.devices.write().await.insert(device_id.clone(), device.clone());
                self.spawn_state_watcher(device.clone());
                info!(device_id = %device_id, "new device discovered");
                device
            }
        };

        device.add_channel(channel).await
    }

    /// Watch one device's state flags for the transitions that drive
    /// known-peers persistence.
    fn spawn_state_watcher(self: &Arc<Self>, device: Arc<Device>) {
        let manager = self.clone();
        let mut state_rx = device.subscribe_state();
        tokio::spawn(async move {
            loop {
                let flags = *state_rx.borrow_and_update();
                if flags.connected && flags.paired {
                    manager.persist_known_peer(&device).await;
                } else if !flags.connected && !flags.paired {
                    manager.forget_device(&device).await;
                    return;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    async fn persist_known_peer(&self, device: &Device) {
        let packet = device.current_identity_packet().await;
        let device_id = device.device_id().to_string();
        let result = self
            .update_known_peers(|map| {
                map.insert(device_id, packet);
            })
            .await;
        if let Err(e) = result {
            error!(device_id = %device.device_id(), error = %e, "failed to persist known peer");
        }
    }

    async fn forget_device(&self, device: &Device) {
        let device_id = device.device_id().to_string();
        let result = self
            .update_known_peers(|map| {
                map.remove(&device_id);
            })
            .await;
        if let Err(e) = result {
            error!(device_id = %device.device_id(), error = %e, "failed to remove known peer entry");
        }
        self.devices.write().await.remove(device.device_id());
        info!(device_id = %device.device_id(), "device removed");
    }

    async fn update_known_peers(&self, mutate: impl FnOnce(&mut HashMap<String, Packet>)) -> Result<()> {
        let _guard = self.known_peers_lock.lock().await;
        let path = self.config.known_peers_path();

        let mut map: HashMap<String, Packet> = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        mutate(&mut map);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(&map)?;
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    /// Cancel all outstanding work, drop every transport factory and
    /// device. Persisted state on disk is left as-is.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.services.write().await.clear();
        self.devices.write().await.clear();
        info!("device manager stopped");
    }
}
