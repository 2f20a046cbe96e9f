//! Slim topology endpoint.
//!
//! Topology design and mutation algorithms live outside the coordination
//! plane; this app only services the requests the status index emits while
//! reconciling reports (primary-MAC adoption, status flips, wired link
//! state, self-reported radio MACs), answers snapshot queries, and takes
//! part in HA data sync for the topology document.

use tokio::sync::watch;
use tracing::{info, warn};

use lattice_primitives::wire::{
    AddNodeWlanMacs, GetTopology, HaAppData, HaGetAppData, NodeParams, SetNodeMac, SetNodeParamsReq,
    SetNodeStatus, SetWiredLinkStatus,
};
use lattice_primitives::{AppId, MessageType, MinionAppId};
use lattice_topology::Topology;

use crate::broker::{Inbound, MessageIo};
use crate::shared::SharedState;

pub struct TopologyApp {
    io: MessageIo,
    shared: SharedState,
}

impl TopologyApp {
    pub fn new(io: MessageIo, shared: SharedState) -> Self {
        Self { io, shared }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                inbound = self.io.recv() => {
                    match inbound {
                        Some(msg) => self.handle(msg),
                        None => return,
                    }
                }
            }
        }
    }

    fn handle(&mut self, inbound: Inbound) {
        let sender = inbound.sender.clone();
        match inbound.envelope.mtype {
            MessageType::SetNodeMac => {
                let Ok(req) = inbound.envelope.read::<SetNodeMac>() else {
                    return self.invalid(&sender, "SetNodeMac");
                };
                let result = self
                    .shared
                    .topology
                    .write()
                    .set_node_mac(&req.node_name, req.node_mac, req.force);
                match result {
                    Ok(()) => self.record_sync(),
                    Err(err) => warn!(node = %req.node_name, %err, "set primary MAC rejected"),
                }
            }
            MessageType::SetNodeStatus => {
                let Ok(req) = inbound.envelope.read::<SetNodeStatus>() else {
                    return self.invalid(&sender, "SetNodeStatus");
                };
                if let Err(err) = self
                    .shared
                    .topology
                    .write()
                    .set_node_status(req.node_mac, req.status)
                {
                    warn!(mac = %req.node_mac, %err, "set node status rejected");
                }
            }
            MessageType::SetNodeParamsReq => {
                let Ok(req) = inbound.envelope.read::<SetNodeParamsReq>() else {
                    return self.invalid(&sender, "SetNodeParamsReq");
                };
                self.send_node_params(req);
            }
            MessageType::SetWiredLinkStatus => {
                let Ok(req) = inbound.envelope.read::<SetWiredLinkStatus>() else {
                    return self.invalid(&sender, "SetWiredLinkStatus");
                };
                if let Err(err) = self
                    .shared
                    .topology
                    .write()
                    .set_wired_link_status(req.node_mac, &req.link_status)
                {
                    warn!(mac = %req.node_mac, %err, "wired link update rejected");
                }
            }
            MessageType::AddNodeWlanMacs => {
                let Ok(req) = inbound.envelope.read::<AddNodeWlanMacs>() else {
                    return self.invalid(&sender, "AddNodeWlanMacs");
                };
                info!(node = %req.node_name, count = req.wlan_macs.len(), "adding self-reported radio MACs");
                let result = self
                    .shared
                    .topology
                    .write()
                    .add_node_wlan_macs(&req.node_name, &req.wlan_macs);
                match result {
                    Ok(()) => self.record_sync(),
                    Err(err) => warn!(node = %req.node_name, %err, "radio MAC update rejected"),
                }
            }
            MessageType::GetTopology => {
                if inbound.envelope.read::<GetTopology>().is_err() {
                    return self.invalid(&sender, "GetTopology");
                }
                let topology = self.shared.topology.read().to_topology();
                if let Err(err) = self.io.send_to_app(sender, MessageType::Topology, &topology) {
                    warn!(?err, "failed sending topology snapshot");
                }
            }
            MessageType::HaGetAppData => {
                if inbound.envelope.read::<HaGetAppData>().is_err() {
                    return self.invalid(&sender, "HaGetAppData");
                }
                self.record_sync();
            }
            MessageType::HaAppData => {
                let Ok(data) = inbound.envelope.read::<HaAppData>() else {
                    return self.invalid(&sender, "HaAppData");
                };
                self.adopt_sync(data);
            }
            other => {
                warn!(?other, %sender, "wrong type of message for topology app");
            }
        }
    }

    fn send_node_params(&self, req: SetNodeParamsReq) {
        let topology = self.shared.topology.read();
        let Some(node) = topology.get_node_by_mac(req.node_mac) else {
            warn!(mac = %req.node_mac, "node params requested for unknown node");
            return;
        };
        let params = NodeParams {
            node_name: node.name.clone(),
            node_type: node.node_type,
            pop_node: node.pop_node,
        };
        drop(topology);
        if let Err(err) = self.io.send_to_minion(
            req.node_mac,
            MinionAppId::Status,
            MessageType::NodeParams,
            &params,
        ) {
            warn!(mac = %req.node_mac, ?err, "failed sending node params");
        }
    }

    /// Queue the current topology document for replication to the peer.
    fn record_sync(&self) {
        let snapshot = self.shared.topology.read().to_topology();
        match serde_json::to_value(&snapshot) {
            Ok(value) => {
                self.shared.synced_app_data.write().record(HaAppData {
                    topology: Some(value),
                    ..Default::default()
                });
            }
            Err(err) => warn!(?err, "failed serializing topology for sync"),
        }
    }

    /// Adopt a topology document replicated from the active peer.
    fn adopt_sync(&self, data: HaAppData) {
        let Some(value) = data.topology else { return };
        match serde_json::from_value::<Topology>(value) {
            Ok(topology) => {
                if let Err(err) = self.shared.topology.write().replace(topology) {
                    warn!(%err, "replicated topology rejected");
                }
            }
            Err(err) => warn!(?err, "malformed replicated topology"),
        }
    }

    fn invalid(&self, sender: &AppId, kind: &str) {
        metrics::counter!("topology_invalid_messages").increment(1);
        warn!(%sender, kind, "invalid message payload");
        self.io.send_ack(sender.clone(), false, format!("Invalid {kind}"));
    }
}
