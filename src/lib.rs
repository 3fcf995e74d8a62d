//! A transport-agnostic core for the KDE Connect peer protocol: packet
//! framing, pairing, device lifecycle, and payload transfer.
//!
//! Concrete transports (LAN discovery, Bluetooth, the UI/D-Bus surface, and
//! individual device plugins such as battery or clipboard sync) are left to
//! embedding applications; this crate provides the [`transport::Transport`]/
//! [`transport::TransportFactory`] and [`plugin::Plugin`]/
//! [`plugin::PluginFactory`] seams they plug into.
//!
//! Start here: build a [`config::ManagerConfig`], register any
//! [`plugin::PluginFactory`]s into a [`plugin::PluginRegistry`], and call
//! [`manager::DeviceManager::start`].

pub mod channel;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod identity;
pub mod manager;
pub mod packet;
pub mod plugin;
pub mod transfer;
pub mod transport;

pub use config::ManagerConfig;
pub use device::{Device, PairingState};
pub use error::{ProtocolError, Result};
pub use manager::DeviceManager;
pub use packet::Packet;
pub use plugin::{Plugin, PluginFactory, PluginRegistry};
pub use transport::{Transport, TransportFactory};
