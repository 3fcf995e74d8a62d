//! The plugin interface.
//!
//! Plugin *implementations* (telephony, file share, clipboard sync, ...) are
//! external collaborators and out of scope for this crate. What lives here
//! is the interface concrete enough to compile and test a [`Device`]
//! against: an async [`Plugin`] trait, a [`PluginFactory`] that constructs
//! per-device instances, and a [`PluginRegistry`] that tracks the loaded
//! factory set, scoped to one [`crate::manager::DeviceManager`].

use crate::device::Device;
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A capability-scoped packet handler attached to one [`Device`].
///
/// Plugins must handle packets idempotently and must not assume a response
/// will ever arrive: packets may be lost, and the wire protocol carries no
/// delivery guarantees above the transport's own.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Short lowercase identifier, e.g. `"battery"`, `"ping"`. Used as the
    /// prefix for this plugin's actions (`battery.request` etc.) and as the
    /// key in [`Device`]'s per-plugin enablement map.
    fn name(&self) -> &str;

    /// Packet types this plugin can receive and process.
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Packet types this plugin can send.
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Action names this plugin contributes, unprefixed (the device
    /// aggregates them as `{plugin_name}.{action}`).
    fn actions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called once after construction, before [`Plugin::start`], with the
    /// owning device so the plugin can read its current identity/capability
    /// state. Plugins that need to send packets do so later via the
    /// `device` reference passed to [`Plugin::handle_packet`], not by
    /// retaining this one (no plugin→device back-pointer is stored; the
    /// device exclusively owns the plugin).
    async fn init(&mut self, device: &Device) -> Result<()>;

    /// Begin processing packets and any background work.
    async fn start(&mut self) -> Result<()>;

    /// Cleanly shut down: stop background work, release resources.
    async fn stop(&mut self) -> Result<()>;

    /// Handle a packet whose type is one of [`Plugin::incoming_capabilities`].
    /// Malformed bodies should be logged, not propagated as an error — only
    /// critical failures (e.g. a dead device) should return `Err`.
    async fn handle_packet(&mut self, packet: &Packet, device: &Device) -> Result<()>;

    /// Whether the plugin has finished any startup work and is ready to
    /// handle packets. Defaults to always-ready.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Constructs fresh [`Plugin`] instances, one per device, and declares the
/// manifest fields the core consults when deciding whether to enable a
/// plugin for a given peer.
pub trait PluginFactory: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn incoming_capabilities(&self) -> Vec<String>;
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Opaque settings-schema id, consumed by a UI layer this crate doesn't
    /// implement (`DevicePluginSettings`).
    fn settings_schema(&self) -> Option<&str> {
        None
    }

    /// Opaque grouping tag (`DevicePluginCategory`).
    fn category(&self) -> Option<&str> {
        None
    }

    fn create(&self) -> Box<dyn Plugin>;
}

/// True if `factory` declares neither incoming nor outgoing capabilities —
/// a "non-packet plugin" that's always enabled once loaded.
pub fn is_capability_free(factory: &dyn PluginFactory) -> bool {
    factory.incoming_capabilities().is_empty() && factory.outgoing_capabilities().is_empty()
}

/// The set of loaded plugin factories for one [`crate::manager::DeviceManager`].
///
/// One instance per manager: the manager consults this registry to build
/// the local identity's capability union and hands a reference to every
/// [`Device`] it creates so `handle_identity` can run its enablement pass.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    factories: Vec<Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Rejects a duplicate plugin name.
    pub fn register(&mut self, factory: Arc<dyn PluginFactory>) -> Result<()> {
        if self.factories.iter().any(|f| f.name() == factory.name()) {
            return Err(ProtocolError::InvalidState(format!(
                "plugin factory '{}' is already registered",
                factory.name()
            )));
        }
        self.factories.push(factory);
        Ok(())
    }

    pub fn factories(&self) -> &[Arc<dyn PluginFactory>] {
        &self.factories
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn PluginFactory>> {
        self.factories.iter().find(|f| f.name() == name)
    }

    /// Union of every loaded factory's incoming capabilities, for the local
    /// identity packet.
    pub fn incoming_capabilities(&self) -> HashSet<String> {
        self.factories
            .iter()
            .flat_map(|f| f.incoming_capabilities())
            .collect()
    }

    /// Union of every loaded factory's outgoing capabilities.
    pub fn outgoing_capabilities(&self) -> HashSet<String> {
        self.factories
            .iter()
            .flat_map(|f| f.outgoing_capabilities())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Minimal echo plugin used by this crate's own tests: declares one
    /// capability in each direction and records how many packets it saw.
    #[derive(Debug)]
    pub struct EchoPlugin {
        pub seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for EchoPlugin {
        fn name(&self) -> &str {
            "mock"
        }

        fn incoming_capabilities(&self) -> Vec<String> {
            vec!["kdeconnect.mock.echo".to_string()]
        }

        fn outgoing_capabilities(&self) -> Vec<String> {
            vec!["kdeconnect.mock.echo".to_string()]
        }

        fn actions(&self) -> Vec<String> {
            vec!["echo".to_string()]
        }

        async fn init(&mut self, _device: &Device) -> Result<()> {
            Ok(())
        }

        async fn start(&mut self) -> Result<()> {
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            Ok(())
        }

        async fn handle_packet(&mut self, _packet: &Packet, _device: &Device) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug)]
    pub struct EchoPluginFactory {
        pub seen: Arc<AtomicUsize>,
    }

    impl PluginFactory for EchoPluginFactory {
        fn name(&self) -> &str {
            "mock"
        }

        fn incoming_capabilities(&self) -> Vec<String> {
            vec!["kdeconnect.mock.echo".to_string()]
        }

        fn outgoing_capabilities(&self) -> Vec<String> {
            vec!["kdeconnect.mock.echo".to_string()]
        }

        fn create(&self) -> Box<dyn Plugin> {
            Box::new(EchoPlugin {
                seen: self.seen.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::EchoPluginFactory;
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn factory() -> Arc<dyn PluginFactory> {
        Arc::new(EchoPluginFactory {
            seen: Arc::new(AtomicUsize::new(0)),
        })
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let mut registry = PluginRegistry::new();
        registry.register(factory()).unwrap();
        let err = registry.register(factory()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidState(_)));
    }

    #[test]
    fn capability_union_reflects_loaded_factories() {
        let mut registry = PluginRegistry::new();
        registry.register(factory()).unwrap();
        assert!(registry
            .incoming_capabilities()
            .contains("kdeconnect.mock.echo"));
        assert!(registry
            .outgoing_capabilities()
            .contains("kdeconnect.mock.echo"));
    }

    #[test]
    fn capability_free_detection() {
        #[derive(Debug)]
        struct NoCapFactory;
        impl PluginFactory for NoCapFactory {
            fn name(&self) -> &str {
                "noop"
            }
            fn incoming_capabilities(&self) -> Vec<String> {
                Vec::new()
            }
            fn outgoing_capabilities(&self) -> Vec<String> {
                Vec::new()
            }
            fn create(&self) -> Box<dyn Plugin> {
                unimplemented!()
            }
        }
        assert!(is_capability_free(&NoCapFactory));
        assert!(!is_capability_free(&*factory()));
    }
}
