//! Per-peer lifecycle: pairing FSM, channel selection, packet fan-out,
//! identity ingestion.
//!
//! All mutable state lives behind `tokio::sync::{Mutex, RwLock}` guards so
//! `Device`'s methods take `&self`: plugins hold no back-pointer to their
//! owning device and are instead handed a `&Device` on every call that
//! needs one.

use crate::channel::Channel;
use crate::crypto;
use crate::error::{ProtocolError, Result};
use crate::identity::{sanitize_device_name, DeviceType, IdentityPacket, PROTOCOL_VERSION};
use crate::packet::{current_timestamp_ms, Packet};
use crate::plugin::{is_capability_free, Plugin, PluginRegistry};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pairing wait-state timeout.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);
/// Clock-skew tolerance for a v8 pair request's `timestamp` field.
pub const V8_CLOCK_SKEW_TOLERANCE_SECS: i64 = 1800;
/// Protocol version at and above which pair requests carry a mandatory
/// `timestamp` field.
const V8_MIN_PROTOCOL_VERSION: u32 = 8;

const PAIR_PACKET_TYPE: &str = "kdeconnect.pair";
const PEER_CERT_FILENAME: &str = "certificate.pem";

/// The four-state pairing machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    /// We asked, waiting for the peer.
    Outgoing,
    /// They asked, waiting for local user consent.
    Incoming,
    Paired,
}

/// The user-visible state surface: transient errors never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStateFlags {
    pub connected: bool,
    pub paired: bool,
    pub pair_incoming: bool,
    pub pair_outgoing: bool,
}

impl DeviceStateFlags {
    fn from_parts(connected: bool, pairing: PairingState) -> Self {
        Self {
            connected,
            paired: pairing == PairingState::Paired,
            pair_incoming: pairing == PairingState::Incoming,
            pair_outgoing: pairing == PairingState::Outgoing,
        }
    }
}

/// Who owns an entry in the aggregated action map.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ActionOwner {
    /// `pair`/`unpair`, always present.
    Builtin,
    Plugin(String),
}

struct Identity {
    display_name: String,
    device_type: DeviceType,
    protocol_version: u32,
    incoming_capabilities: HashSet<String>,
    outgoing_capabilities: HashSet<String>,
}

struct Pairing {
    state: PairingState,
    /// Timestamp exchanged during the most recent v8 pairing handshake,
    /// needed both for the verification-key formula and to recognize a
    /// legitimate v8 auto-accept while already `Paired`.
    timestamp: Option<i64>,
    /// Bumped on every state transition; a timer task captures the
    /// generation it was armed with and no-ops if it no longer matches,
    /// so a late timeout can't undo a state reached in the meantime.
    generation: u64,
}

/// One instance per known or discovered peer.
pub struct Device {
    device_id: String,
    context_dir: PathBuf,
    registry: Arc<PluginRegistry>,
    cancel: CancellationToken,

    identity: RwLock<Identity>,
    pairing: Mutex<Pairing>,
    /// Priority-sorted (highest first); the head is the "current" channel.
    channels: RwLock<Vec<Arc<Channel>>>,
    plugins: Mutex<HashMap<String, Box<dyn Plugin>>>,
    /// Packet type -> plugin names registered for it, in registration
    /// order: packets are dispatched to each registered handler in that
    /// order.
    handlers: RwLock<HashMap<String, Vec<String>>>,
    actions: RwLock<HashMap<String, ActionOwner>>,

    state_tx: watch::Sender<DeviceStateFlags>,
    /// Weak self-reference so timeout tasks can outlive the call that armed
    /// them without keeping the device alive on their own.
    self_weak: std::sync::Weak<Device>,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl Device {
    /// Construct a device for `device_id`, not yet attached to any channel.
    pub fn new(
        device_id: impl Into<String>,
        context_dir: impl Into<PathBuf>,
        registry: Arc<PluginRegistry>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let device_id = device_id.into();
        let (state_tx, _rx) = watch::channel(DeviceStateFlags::default());

        let mut actions = HashMap::new();
        actions.insert("pair".to_string(), ActionOwner::Builtin);
        actions.insert("unpair".to_string(), ActionOwner::Builtin);

        Arc::new_cyclic(|weak| Self {
            context_dir: context_dir.into(),
            identity: RwLock::new(Identity {
                display_name: device_id.clone(),
                device_type: DeviceType::Desktop,
                protocol_version: PROTOCOL_VERSION,
                incoming_capabilities: HashSet::new(),
                outgoing_capabilities: HashSet::new(),
            }),
            pairing: Mutex::new(Pairing {
                state: PairingState::Unpaired,
                timestamp: None,
                generation: 0,
            }),
            channels: RwLock::new(Vec::new()),
            plugins: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            actions: RwLock::new(actions),
            state_tx,
            device_id,
            registry,
            cancel,
            self_weak: weak.clone(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    fn peer_cert_path(&self) -> PathBuf {
        self.context_dir.join(PEER_CERT_FILENAME)
    }

    pub async fn display_name(&self) -> String {
        self.identity.read().await.display_name.clone()
    }

    pub async fn icon_name(&self) -> &'static str {
        self.identity.read().await.device_type.icon_name()
    }

    pub async fn protocol_version(&self) -> u32 {
        self.identity.read().await.protocol_version
    }

    pub async fn is_paired(&self) -> bool {
        self.pairing.lock().await.state == PairingState::Paired
    }

    pub async fn pairing_state(&self) -> PairingState {
        self.pairing.lock().await.state
    }

    pub async fn state_flags(&self) -> DeviceStateFlags {
        let connected = !self.channels.read().await.is_empty();
        let pairing = self.pairing.lock().await.state;
        DeviceStateFlags::from_parts(connected, pairing)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DeviceStateFlags> {
        self.state_tx.subscribe()
    }

    async fn emit_state_change(&self) {
        let flags = self.state_flags().await;
        let _ = self.state_tx.send(flags);
    }

    pub async fn current_channel(&self) -> Option<Arc<Channel>> {
        self.channels.read().await.first().cloned()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn actions(&self) -> Vec<String> {
        let actions = self.actions.read().await;
        let mut names: Vec<String> = actions
            .iter()
            .map(|(action, owner)| match owner {
                ActionOwner::Builtin => action.clone(),
                ActionOwner::Plugin(plugin) => format!("{plugin}.{action}"),
            })
            .collect();
        names.sort();
        names
    }

    // ---- identity to/from the wire -------------------------------------

    /// Build the identity this device currently presents to plugins: used
    /// only for tests and diagnostics (the *local* identity lives on
    /// [`crate::manager::DeviceManager`], not on a peer's `Device`).
    pub async fn current_identity_packet(&self) -> Packet {
        let identity = self.identity.read().await;
        IdentityPacket::new(
            self.device_id.clone(),
            identity.display_name.clone(),
            identity.device_type,
            identity.incoming_capabilities.clone(),
            identity.outgoing_capabilities.clone(),
        )
        .to_packet()
    }

    /// Ingest a peer identity. Fatal (returns `Err`) if `deviceId`
    /// doesn't match this device's id: the caller must drop the offending
    /// channel. Idempotent when the identity is unchanged.
    pub async fn handle_identity(&self, identity: IdentityPacket) -> Result<()> {
        if identity.device_id != self.device_id {
            return Err(ProtocolError::InvalidState(format!(
                "identity deviceId {} does not match device {}",
                identity.device_id, self.device_id
            )));
        }

        {
            let mut state = self.identity.write().await;
            state.display_name = sanitize_device_name(&identity.device_name, &self.device_id);
            state.device_type = identity.device_type;
            state.protocol_version = identity.protocol_version;
            state.incoming_capabilities = identity.incoming_capabilities;
            state.outgoing_capabilities = identity.outgoing_capabilities;
        }

        self.refresh_plugins().await;
        Ok(())
    }

    /// Enable iff our peer's capabilities intersect ours in either
    /// direction, or the plugin declares neither (a non-packet plugin).
    /// Newly enabled plugins are constructed, initialized, and started;
    /// newly disabled ones are stopped and dropped.
    async fn refresh_plugins(&self) {
        let (peer_incoming, peer_outgoing): (HashSet<String>, HashSet<String>) = {
            let identity = self.identity.read().await;
            (
                identity.incoming_capabilities.clone(),
                identity.outgoing_capabilities.clone(),
            )
        };

        let mut should_enable = HashSet::new();
        for factory in self.registry.factories() {
            let incoming: HashSet<String> = factory.incoming_capabilities().into_iter().collect();
            let outgoing: HashSet<String> = factory.outgoing_capabilities().into_iter().collect();
            let matches = is_capability_free(factory.as_ref())
                || !incoming.is_disjoint(&peer_outgoing)
                || !outgoing.is_disjoint(&peer_incoming);
            if matches {
                should_enable.insert(factory.name().to_string());
            }
        }

        let currently_enabled: HashSet<String> = {
            let plugins = self.plugins.lock().await;
            plugins.keys().cloned().collect()
        };

        for name in currently_enabled.difference(&should_enable).cloned().collect::<Vec<_>>() {
            self.disable_plugin(&name).await;
        }
        for name in should_enable.difference(&currently_enabled).cloned().collect::<Vec<_>>() {
            self.enable_plugin(&name).await;
        }
    }

    async fn enable_plugin(&self, name: &str) {
        let Some(factory) = self.registry.get(name).cloned() else {
            return;
        };
        let mut plugin = factory.create();
        if let Err(e) = plugin.init(self).await {
            warn!(device_id = %self.device_id, plugin = name, error = %e, "plugin init failed");
            return;
        }
        if let Err(e) = plugin.start().await {
            warn!(device_id = %self.device_id, plugin = name, error = %e, "plugin start failed");
            return;
        }

        {
            let mut handlers = self.handlers.write().await;
            for cap in plugin.incoming_capabilities() {
                handlers.entry(cap).or_default().push(name.to_string());
            }
        }
        {
            let mut actions = self.actions.write().await;
            for action in plugin.actions() {
                actions.insert(action, ActionOwner::Plugin(name.to_string()));
            }
        }
        self.plugins.lock().await.insert(name.to_string(), plugin);
        info!(device_id = %self.device_id, plugin = name, "plugin enabled");
    }

    async fn disable_plugin(&self, name: &str) {
        let Some(mut plugin) = self.plugins.lock().await.remove(name) else {
            return;
        };
        if let Err(e) = plugin.stop().await {
            warn!(device_id = %self.device_id, plugin = name, error = %e, "plugin stop failed");
        }

        let mut handlers = self.handlers.write().await;
        for names in handlers.values_mut() {
            names.retain(|n| n != name);
        }
        handlers.retain(|_, names| !names.is_empty());
        drop(handlers);

        let mut actions = self.actions.write().await;
        actions.retain(|_, owner| !matches!(owner, ActionOwner::Plugin(p) if p == name));
        info!(device_id = %self.device_id, plugin = name, "plugin disabled");
    }

    // ---- channel attachment ---------------------------------------------

    /// Attach a freshly negotiated channel. Drops `channel` without
    /// attaching it if the peer identity is absent or mismatched.
    pub async fn add_channel(self: &Arc<Self>, channel: Arc<Channel>) -> Result<()> {
        let Some(identity) = channel.peer_identity().await else {
            channel.close().await.ok();
            return Err(ProtocolError::MissingField("peer identity".to_string()));
        };
        if let Err(e) = self.handle_identity(identity).await {
            channel.close().await.ok();
            return Err(e);
        }

        if self.is_paired().await {
            channel.mark_trusted();
        }

        {
            let mut channels = self.channels.write().await;
            channels.push(channel.clone());
            channels.sort_by(|a, b| b.capabilities().priority.cmp(&a.capabilities().priority));
        }

        self.refresh_plugins().await;
        self.emit_state_change().await;

        let device = self.clone();
        let task_channel = channel.clone();
        let task_id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            debug!(device_id = %device.device_id, task_id, "channel read loop started");
            loop {
                let packet = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = task_channel.read_packet() => result,
                };
                match packet {
                    Ok(p) => device.handle_packet(p).await,
                    Err(e) => {
                        debug!(device_id = %device.device_id, error = %e, "channel read loop ended");
                        break;
                    }
                }
            }
            device.on_channel_closed(&task_channel).await;
        });

        Ok(())
    }

    async fn on_channel_closed(&self, channel: &Arc<Channel>) {
        let was_current = {
            let channels = self.channels.read().await;
            channels.first().map(|c| c.id()) == Some(channel.id())
        };
        {
            let mut channels = self.channels.write().await;
            channels.retain(|c| c.id() != channel.id());
        }
        channel.close().await.ok();
        if was_current {
            self.refresh_plugins().await;
        }
        self.emit_state_change().await;
    }

    // ---- packet dispatch -------------------------------------------------

    /// Route one inbound packet.
    pub async fn handle_packet(&self, packet: Packet) {
        if packet.is_type(PAIR_PACKET_TYPE) {
            self.handle_pair_packet(packet).await;
            return;
        }

        if !self.is_paired().await {
            warn!(device_id = %self.device_id, packet_type = %packet.packet_type, "dropping packet from unpaired device");
            let reject = Packet::new(PAIR_PACKET_TYPE, json!({"pair": false}));
            let _ = self.send_packet_unchecked(reject).await;
            return;
        }

        let handler_names = {
            let handlers = self.handlers.read().await;
            handlers.get(&packet.packet_type).cloned()
        };
        let Some(handler_names) = handler_names else {
            debug!(device_id = %self.device_id, packet_type = %packet.packet_type, "unsupported packet type");
            return;
        };

        let mut plugins = self.plugins.lock().await;
        for name in &handler_names {
            if let Some(plugin) = plugins.get_mut(name) {
                if let Err(e) = plugin.handle_packet(&packet, self).await {
                    error!(device_id = %self.device_id, plugin = name, error = %e, "plugin packet handler failed");
                }
            }
        }
    }

    // ---- sending ----------------------------------------------------------

    /// Send `packet` on the current channel. Fails with
    /// [`ProtocolError::NotConnected`] if no channel is current, and with
    /// [`ProtocolError::PermissionDenied`] if unpaired, except for
    /// `kdeconnect.pair` packets the FSM itself sends.
    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        if !packet.is_type(PAIR_PACKET_TYPE) && !self.is_paired().await {
            return Err(ProtocolError::PermissionDenied(format!(
                "device {} is not paired",
                self.device_id
            )));
        }
        self.send_packet_unchecked(packet).await
    }

    /// `send_packet` without the pairing check, used by the FSM itself to
    /// send `kdeconnect.pair` packets while still `Unpaired`/`Incoming`.
    async fn send_packet_unchecked(&self, packet: Packet) -> Result<()> {
        let first = self.current_channel().await.ok_or(ProtocolError::NotConnected)?;
        match first.write_packet(packet.clone()).await {
            Ok(()) => Ok(()),
            Err(first_err) => {
                self.on_channel_closed(&first).await;
                match self.current_channel().await {
                    Some(next) => next.write_packet(packet).await,
                    None => Err(first_err),
                }
            }
        }
    }

    // ---- pairing FSM ------------------------------------------------------

    /// User-initiated "pair" action: `Unpaired -> Outgoing`,
    /// `Incoming -> Paired`.
    pub async fn request_pairing(&self) -> Result<()> {
        let state = self.pairing.lock().await.state;
        match state {
            PairingState::Unpaired => self.start_outgoing_pairing().await,
            PairingState::Incoming => self.accept_incoming_pairing().await,
            PairingState::Outgoing | PairingState::Paired => Ok(()),
        }
    }

    async fn start_outgoing_pairing(&self) -> Result<()> {
        let protocol_version = self.protocol_version().await;
        let mut body = json!({"pair": true});
        if protocol_version >= V8_MIN_PROTOCOL_VERSION {
            let ts = current_timestamp_ms() / 1000;
            body["timestamp"] = json!(ts);
            self.pairing.lock().await.timestamp = Some(ts);
        }

        let generation = {
            let mut pairing = self.pairing.lock().await;
            pairing.state = PairingState::Outgoing;
            pairing.generation += 1;
            pairing.generation
        };
        self.emit_state_change().await;
        self.arm_timeout(generation, PairingState::Unpaired);

        info!(device_id = %self.device_id, "sending pairing request");
        self.send_packet_unchecked(Packet::new(PAIR_PACKET_TYPE, body)).await
    }

    async fn accept_incoming_pairing(&self) -> Result<()> {
        self.persist_peer_certificate().await?;
        {
            let mut pairing = self.pairing.lock().await;
            pairing.state = PairingState::Paired;
            pairing.generation += 1;
        }
        self.set_paired(true).await;
        info!(device_id = %self.device_id, "pairing accepted");
        self.send_packet_unchecked(Packet::new(PAIR_PACKET_TYPE, json!({"pair": true}))).await
    }

    /// User-initiated "unpair", or the FSM's own response to a reject/
    /// unsolicited-v7-accept. Always resets to `Unpaired`.
    pub async fn unpair(&self) -> Result<()> {
        let was_paired = self.is_paired().await;
        {
            let mut pairing = self.pairing.lock().await;
            pairing.state = PairingState::Unpaired;
            pairing.timestamp = None;
            pairing.generation += 1;
        }
        if was_paired {
            self.set_paired(false).await;
            self.refresh_plugins().await;
        }
        self.emit_state_change().await;
        info!(device_id = %self.device_id, "unpaired");

        if was_paired {
            let _ = self.send_packet_unchecked(Packet::new(PAIR_PACKET_TYPE, json!({"pair": false}))).await;
        }
        Ok(())
    }

    async fn handle_pair_packet(&self, packet: Packet) {
        let pair = packet.get_bool("pair");
        let timestamp = packet.get_i64("timestamp");
        let state = self.pairing.lock().await.state;
        let protocol_version = self.protocol_version().await;

        match (state, pair) {
            (PairingState::Unpaired, true) => {
                if protocol_version >= V8_MIN_PROTOCOL_VERSION {
                    let Some(ts) = timestamp else {
                        warn!(device_id = %self.device_id, "v8 pair request missing mandatory timestamp");
                        return;
                    };
                    if !within_clock_skew(ts) {
                        warn!(device_id = %self.device_id, timestamp = ts, "pair request clock skew exceeds tolerance");
                        return;
                    }
                    self.pairing.lock().await.timestamp = Some(ts);
                }
                let generation = {
                    let mut pairing = self.pairing.lock().await;
                    pairing.state = PairingState::Incoming;
                    pairing.generation += 1;
                    pairing.generation
                };
                info!(device_id = %self.device_id, "incoming pairing request, awaiting user consent");
                self.emit_state_change().await;
                self.arm_timeout(generation, PairingState::Unpaired);
            }

            (PairingState::Outgoing, true) => {
                if let Err(e) = self.persist_peer_certificate().await {
                    error!(device_id = %self.device_id, error = %e, "failed to persist peer certificate");
                    return;
                }
                {
                    let mut pairing = self.pairing.lock().await;
                    pairing.state = PairingState::Paired;
                    pairing.generation += 1;
                }
                self.set_paired(true).await;
                info!(device_id = %self.device_id, "pairing completed (we requested)");
                self.emit_state_change().await;
            }

            (PairingState::Incoming, true) => {
                // Duplicate request while already awaiting user consent; ignore.
            }

            (PairingState::Outgoing, false) | (PairingState::Incoming, false) => {
                let mut pairing = self.pairing.lock().await;
                pairing.state = PairingState::Unpaired;
                pairing.generation += 1;
                drop(pairing);
                info!(device_id = %self.device_id, "pairing rejected by peer");
                self.emit_state_change().await;
            }

            (PairingState::Paired, true) => {
                let auto_accept = protocol_version >= V8_MIN_PROTOCOL_VERSION
                    && timestamp.is_some()
                    && timestamp.map(within_clock_skew).unwrap_or(false);
                if auto_accept {
                    if let Err(e) = self.persist_peer_certificate().await {
                        error!(device_id = %self.device_id, error = %e, "failed to refresh peer certificate");
                        return;
                    }
                    self.pairing.lock().await.timestamp = timestamp;
                    info!(device_id = %self.device_id, "v8 unsolicited pair auto-accepted, certificate refreshed");
                } else {
                    warn!(device_id = %self.device_id, "unsolicited pair while already paired (v7 or no timestamp); unpairing");
                    let _ = self.unpair().await;
                }
            }

            (PairingState::Paired, false) => {
                let _ = self.unpair().await;
            }

            (PairingState::Unpaired, false) => {
                // Nothing to reject; ignore.
            }
        }
    }

    /// Arm a 30s timeout that resets the FSM to `fallback` unless the
    /// pairing generation has already moved on. A no-op if this device has
    /// no remaining strong reference.
    fn arm_timeout(&self, generation: u64, fallback: PairingState) {
        let Some(device) = self.self_weak.upgrade() else {
            return;
        };
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(PAIRING_TIMEOUT) => {}
            }
            let mut pairing = device.pairing.lock().await;
            if pairing.generation != generation {
                return;
            }
            info!(device_id = %device.device_id, "pairing request timed out");
            pairing.state = fallback;
            pairing.generation += 1;
            drop(pairing);
            device.emit_state_change().await;
        });
    }

    /// Drop the peer's certificate file on disk and clear this device's
    /// persisted context.
    async fn set_paired(&self, paired: bool) {
        if !paired {
            let path = self.peer_cert_path();
            if path.exists() {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    error!(device_id = %self.device_id, error = %e, "failed to remove peer certificate");
                }
            }
            if self.context_dir.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&self.context_dir).await {
                    error!(device_id = %self.device_id, error = %e, "failed to clear device context directory");
                }
            }
        }
    }

    async fn persist_peer_certificate(&self) -> Result<()> {
        let channel = self.current_channel().await.ok_or(ProtocolError::NotConnected)?;
        let pem = crypto::der_to_pem(channel.peer_certificate_der())?;
        if let Some(parent) = self.peer_cert_path().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(self.peer_cert_path(), pem).await?;
        channel.mark_trusted();
        Ok(())
    }

    /// True if a persisted peer certificate exists for this device,
    /// i.e. the on-disk witness of "this device is paired".
    pub fn has_persisted_pairing(&self) -> bool {
        self.peer_cert_path().exists()
    }

    /// Mark this device `Paired` from previously persisted state, without
    /// running the handshake (used when the manager reloads known peers at
    /// startup).
    pub async fn restore_paired(&self) {
        let mut pairing = self.pairing.lock().await;
        pairing.state = PairingState::Paired;
        pairing.generation += 1;
    }
}

fn within_clock_skew(peer_timestamp_secs: i64) -> bool {
    let now_secs = current_timestamp_ms() / 1000;
    (now_secs - peer_timestamp_secs).abs() <= V8_CLOCK_SKEW_TOLERANCE_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CertificateInfo;
    use crate::plugin::test_support::EchoPluginFactory;
    use crate::transport::mock::MockTransport;
    use crate::transport::Priority;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn registry_with_echo() -> (Arc<PluginRegistry>, Arc<AtomicUsize>) {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(EchoPluginFactory { seen: seen.clone() }))
            .unwrap();
        (Arc::new(registry), seen)
    }

    async fn attach_pair(
        device_id: &str,
        registry: Arc<PluginRegistry>,
        context_dir: PathBuf,
        protocol_version: u32,
    ) -> (Arc<Device>, Arc<Channel>) {
        let local_cert = CertificateInfo::generate(device_id.to_string(), 10).unwrap();
        let peer_cert = CertificateInfo::generate("b".repeat(32), 10).unwrap();
        let (ta, _tb) = MockTransport::pair(local_cert, peer_cert, Priority(0));
        let channel = Arc::new(Channel::new(Arc::new(ta), false));

        let identity = IdentityPacket::new(
            device_id.to_string(),
            "Peer".to_string(),
            DeviceType::Phone,
            ["kdeconnect.mock.echo".to_string()].into_iter().collect(),
            HashSet::new(),
        );
        let mut identity = identity;
        identity.protocol_version = protocol_version;
        channel.set_peer_identity(identity).await;

        let device = Device::new(device_id, context_dir, registry, CancellationToken::new());
        device.clone().add_channel(channel.clone()).await.unwrap();
        (device, channel)
    }

    #[tokio::test]
    async fn capability_match_enables_plugin() {
        let dir = TempDir::new().unwrap();
        let (registry, _seen) = registry_with_echo();
        let (device, _channel) = attach_pair(&"a".repeat(32), registry, dir.path().to_path_buf(), 8).await;

        let handlers = device.handlers.read().await;
        assert!(handlers.contains_key("kdeconnect.mock.echo"));
    }

    #[tokio::test]
    async fn identity_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (registry, _seen) = registry_with_echo();
        let device = Device::new("a".repeat(32), dir.path(), registry, CancellationToken::new());

        let local_cert = CertificateInfo::generate("a".repeat(32), 10).unwrap();
        let peer_cert = CertificateInfo::generate("b".repeat(32), 10).unwrap();
        let (ta, _tb) = MockTransport::pair(local_cert, peer_cert, Priority(0));
        let channel = Arc::new(Channel::new(Arc::new(ta), false));
        let wrong_identity = IdentityPacket::new(
            "c".repeat(32),
            "Wrong".to_string(),
            DeviceType::Desktop,
            HashSet::new(),
            HashSet::new(),
        );
        channel.set_peer_identity(wrong_identity).await;

        let err = device.clone().add_channel(channel).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidState(_)));
    }

    #[tokio::test]
    async fn unpaired_device_rejects_non_pair_packets() {
        let dir = TempDir::new().unwrap();
        let (registry, seen) = registry_with_echo();
        let (device, _channel) = attach_pair(&"a".repeat(32), registry, dir.path().to_path_buf(), 8).await;

        device
            .handle_packet(Packet::new("kdeconnect.mock.echo", json!({})))
            .await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_packet_requires_pairing() {
        let dir = TempDir::new().unwrap();
        let (registry, _seen) = registry_with_echo();
        let (device, _channel) = attach_pair(&"a".repeat(32), registry, dir.path().to_path_buf(), 8).await;

        let err = device
            .send_packet(Packet::new("kdeconnect.mock.echo", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn send_packet_without_channel_is_not_connected() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(PluginRegistry::new());
        let device = Device::new("a".repeat(32), dir.path(), registry, CancellationToken::new());
        let err = device
            .send_packet(Packet::new(PAIR_PACKET_TYPE, json!({"pair": true})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotConnected));
    }

    #[tokio::test]
    async fn v7_unsolicited_accept_while_paired_unpairs() {
        let dir = TempDir::new().unwrap();
        let (registry, _seen) = registry_with_echo();
        let (device, _channel) = attach_pair(&"a".repeat(32), registry, dir.path().to_path_buf(), 7).await;

        device.pairing.lock().await.state = PairingState::Paired;
        device.handle_pair_packet(Packet::new(PAIR_PACKET_TYPE, json!({"pair": true}))).await;
        assert_eq!(device.pairing_state().await, PairingState::Unpaired);
    }
}
