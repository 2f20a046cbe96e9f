//! The lattice controller's coordination plane.
//!
//! A single process hosts a set of cooperating apps -- status index, config
//! service, upgrade orchestrator, high-availability replicator, and a slim
//! topology endpoint -- that talk to each other, to minions, and to API
//! clients exclusively through typed messages routed by the [`broker`].
//!
//! Each app is a tokio task looping over its inbox plus periodic ticks;
//! shared views (topology, status index, config documents) live behind
//! read/write locks in [`shared::SharedState`] with a fixed lock order.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod broker;
pub mod config;
pub mod ha;
pub mod settings;
pub mod shared;
pub mod status;
pub mod topology_app;
pub mod transport;
pub mod upgrade;

pub use broker::{Broker, Inbound, MessageIo, Outbound};
pub use settings::ControllerOptions;
pub use shared::SharedState;
