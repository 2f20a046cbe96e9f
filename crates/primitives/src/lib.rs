//! Core types shared by the lattice controller: node identity, version
//! parsing, and the wire envelope spoken between apps, minions, and the
//! peer controller.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod codec;
pub mod compress;
pub mod mac;
pub mod version;
pub mod wire;

pub use mac::MacAddr;
pub use version::{FwVersion, SwVersion};
pub use wire::{AppId, Envelope, MessageType, MinionAppId};
