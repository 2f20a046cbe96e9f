//! The controller's authoritative topology view.
//!
//! Nodes and links live here; the status, config, and upgrade apps read it
//! on every tick and mutate it only through the narrow operations below.
//! Topology design/mutation algorithms (ignition, routing) are out of scope;
//! this store only guarantees the identity invariants the rest of the
//! controller depends on: node names are unique, the primary MAC is unique
//! across the topology, and a radio MAC belongs to at most one node.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use lattice_primitives::MacAddr;
use lattice_primitives::wire::{NodeStatus, NodeType};

pub type Result<T, E = TopologyError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("unknown node `{0}`")]
    UnknownNode(String),
    #[error("duplicate node name `{0}`")]
    DuplicateName(String),
    #[error("MAC {0} already belongs to node `{1}`")]
    MacInUse(MacAddr, String),
    #[error("node `{0}` already has primary MAC {1}")]
    MacAlreadySet(String, MacAddr),
    #[error("link `{0}` references unknown node")]
    DanglingLink(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    Wireless,
    Ethernet,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Primary hardware address; may be unset until the minion first
    /// connects with a known radio MAC.
    pub mac_addr: Option<MacAddr>,
    #[serde(default)]
    pub wlan_mac_addrs: Vec<MacAddr>,
    pub node_type: NodeType,
    /// Gateway (POP) node with BGP peering.
    #[serde(default)]
    pub pop_node: bool,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub a_node_name: String,
    pub z_node_name: String,
    pub link_type: LinkType,
    #[serde(default)]
    pub is_alive: bool,
}

impl Link {
    /// Conventional link name, stable regardless of endpoint order.
    pub fn make_name(a: &str, z: &str) -> String {
        if a <= z {
            format!("link-{a}-{z}")
        } else {
            format!("link-{z}-{a}")
        }
    }

    /// The endpoint opposite `node_name`, if this link touches it.
    pub fn other_end(&self, node_name: &str) -> Option<&str> {
        if self.a_node_name == node_name {
            Some(&self.z_node_name)
        } else if self.z_node_name == node_name {
            Some(&self.a_node_name)
        } else {
            None
        }
    }
}

/// Serializable topology document (also the HA sync payload).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
}

/// In-memory topology with lookup indices.
#[derive(Debug, Default)]
pub struct TopologyView {
    name: String,
    nodes: BTreeMap<String, Node>,
    links: BTreeMap<String, Link>,
    /// Primary and radio MACs -> node name.
    mac_index: HashMap<MacAddr, String>,
}

impl TopologyView {
    pub fn new(topology: Topology) -> Result<Self> {
        let mut view = Self {
            name: topology.name,
            ..Default::default()
        };
        for node in topology.nodes {
            view.add_node(node)?;
        }
        for link in topology.links {
            view.add_link(link)?;
        }
        Ok(view)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot the full document (for HA sync and API queries).
    pub fn to_topology(&self) -> Topology {
        Topology {
            name: self.name.clone(),
            nodes: self.nodes.values().cloned().collect(),
            links: self.links.values().cloned().collect(),
        }
    }

    /// Replace the whole view, e.g. when the PASSIVE peer adopts a snapshot.
    pub fn replace(&mut self, topology: Topology) -> Result<()> {
        *self = Self::new(topology)?;
        Ok(())
    }

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.name) {
            return Err(TopologyError::DuplicateName(node.name));
        }
        for mac in node.mac_addr.iter().chain(node.wlan_mac_addrs.iter()) {
            if let Some(owner) = self.mac_index.get(mac) {
                return Err(TopologyError::MacInUse(*mac, owner.clone()));
            }
        }
        for mac in node.mac_addr.iter().chain(node.wlan_mac_addrs.iter()) {
            self.mac_index.insert(*mac, node.name.clone());
        }
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    pub fn remove_node(&mut self, name: &str) -> Result<Node> {
        let node = self
            .nodes
            .remove(name)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_owned()))?;
        self.mac_index.retain(|_, owner| owner != name);
        self.links
            .retain(|_, link| link.a_node_name != name && link.z_node_name != name);
        Ok(node)
    }

    pub fn add_link(&mut self, link: Link) -> Result<()> {
        for end in [&link.a_node_name, &link.z_node_name] {
            if !self.nodes.contains_key(end) {
                return Err(TopologyError::DanglingLink(link.name));
            }
        }
        self.links.insert(link.name.clone(), link);
        Ok(())
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Resolve a node by primary *or* radio MAC.
    pub fn get_node_by_mac(&self, mac: MacAddr) -> Option<&Node> {
        self.mac_index.get(&mac).and_then(|name| self.nodes.get(name))
    }

    pub fn mac_by_name(&self, name: &str) -> Option<MacAddr> {
        self.nodes.get(name).and_then(|n| n.mac_addr)
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn all_links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn get_link(&self, name: &str) -> Option<&Link> {
        self.links.get(name)
    }

    pub fn links_by_node(&self, node_name: &str) -> Vec<&Link> {
        self.links
            .values()
            .filter(|l| l.a_node_name == node_name || l.z_node_name == node_name)
            .collect()
    }

    /// Names of nodes wirelessly adjacent to `node_name`.
    pub fn wireless_neighbors(&self, node_name: &str) -> Vec<String> {
        self.links
            .values()
            .filter(|l| l.link_type == LinkType::Wireless)
            .filter_map(|l| l.other_end(node_name))
            .map(str::to_owned)
            .collect()
    }

    pub fn set_node_status(&mut self, mac: MacAddr, status: NodeStatus) -> Result<()> {
        let name = self
            .mac_index
            .get(&mac)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownNode(mac.to_string()))?;
        if let Some(node) = self.nodes.get_mut(&name) {
            if node.status != status {
                tracing::info!(node = %name, ?status, "node status changed");
            }
            node.status = status;
        }
        Ok(())
    }

    /// Assign the primary MAC of a node whose `mac_addr` was empty (or force
    /// a reassignment). Keeps the MAC index consistent.
    pub fn set_node_mac(&mut self, name: &str, mac: MacAddr, force: bool) -> Result<()> {
        if let Some(owner) = self.mac_index.get(&mac) {
            if owner != name {
                return Err(TopologyError::MacInUse(mac, owner.clone()));
            }
        }
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_owned()))?;
        if let Some(existing) = node.mac_addr {
            if existing == mac {
                return Ok(());
            }
            if !force {
                return Err(TopologyError::MacAlreadySet(name.to_owned(), existing));
            }
            self.mac_index.remove(&existing);
        }
        node.mac_addr = Some(mac);
        self.mac_index.insert(mac, name.to_owned());
        tracing::info!(node = %name, %mac, "assigned primary MAC");
        Ok(())
    }

    /// Record self-reported radio MACs not present in the topology.
    pub fn add_node_wlan_macs(&mut self, name: &str, macs: &[MacAddr]) -> Result<()> {
        for mac in macs {
            if let Some(owner) = self.mac_index.get(mac) {
                if owner != name {
                    return Err(TopologyError::MacInUse(*mac, owner.clone()));
                }
            }
        }
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_owned()))?;
        for mac in macs {
            if !node.wlan_mac_addrs.contains(mac) {
                node.wlan_mac_addrs.push(*mac);
                self.mac_index.insert(*mac, name.to_owned());
            }
        }
        Ok(())
    }

    pub fn set_link_alive(&mut self, link_name: &str, alive: bool) -> Result<()> {
        let link = self
            .links
            .get_mut(link_name)
            .ok_or_else(|| TopologyError::DanglingLink(link_name.to_owned()))?;
        link.is_alive = alive;
        Ok(())
    }

    /// Apply wired link liveness computed from a node's status report: for
    /// each neighbor MAC, mark the ethernet link between the pair.
    pub fn set_wired_link_status(
        &mut self,
        node_mac: MacAddr,
        link_status: &BTreeMap<MacAddr, bool>,
    ) -> Result<()> {
        let node_name = self
            .mac_index
            .get(&node_mac)
            .cloned()
            .ok_or_else(|| TopologyError::UnknownNode(node_mac.to_string()))?;
        for (nbr_mac, alive) in link_status {
            let Some(nbr_name) = self.mac_index.get(nbr_mac).cloned() else {
                continue;
            };
            for link in self.links.values_mut() {
                if link.link_type == LinkType::Ethernet
                    && link.other_end(&node_name) == Some(nbr_name.as_str())
                {
                    link.is_alive = *alive;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0, 0, 0, 0, 0, last])
    }

    fn node(name: &str, last: u8) -> Node {
        Node {
            name: name.to_owned(),
            mac_addr: Some(mac(last)),
            wlan_mac_addrs: vec![mac(last + 100)],
            node_type: NodeType::Dn,
            pop_node: false,
            status: NodeStatus::Offline,
        }
    }

    fn linear_topology() -> TopologyView {
        let mut view = TopologyView::default();
        for (name, last) in [("a", 1), ("b", 2), ("c", 3)] {
            view.add_node(node(name, last)).unwrap();
        }
        for (a, z) in [("a", "b"), ("b", "c")] {
            view.add_link(Link {
                name: Link::make_name(a, z),
                a_node_name: a.to_owned(),
                z_node_name: z.to_owned(),
                link_type: LinkType::Wireless,
                is_alive: true,
            })
            .unwrap();
        }
        view
    }

    #[test]
    fn primary_mac_is_unique() {
        let mut view = TopologyView::default();
        view.add_node(node("a", 1)).unwrap();
        let dup = node("b", 1);
        assert!(matches!(
            view.add_node(dup),
            Err(TopologyError::MacInUse(_, _))
        ));
    }

    #[test]
    fn resolves_by_radio_mac() {
        let view = linear_topology();
        let found = view.get_node_by_mac(mac(101)).unwrap();
        assert_eq!(found.name, "a");
    }

    #[test]
    fn set_node_mac_requires_force_to_reassign() {
        let mut view = linear_topology();
        assert!(matches!(
            view.set_node_mac("a", mac(9), false),
            Err(TopologyError::MacAlreadySet(_, _))
        ));
        view.set_node_mac("a", mac(9), true).unwrap();
        assert_eq!(view.mac_by_name("a"), Some(mac(9)));
        assert!(view.get_node_by_mac(mac(1)).is_none());
    }

    #[test]
    fn wireless_neighbors_of_middle_node() {
        let view = linear_topology();
        let mut nbrs = view.wireless_neighbors("b");
        nbrs.sort();
        assert_eq!(nbrs, ["a", "c"]);
    }

    #[test]
    fn remove_node_drops_links_and_index() {
        let mut view = linear_topology();
        view.remove_node("b").unwrap();
        assert!(view.get_node_by_mac(mac(2)).is_none());
        assert!(view.links_by_node("a").is_empty());
    }

    #[test]
    fn wired_link_status_updates_ethernet_links_only() {
        let mut view = linear_topology();
        view.add_link(Link {
            name: "wired-a-c".into(),
            a_node_name: "a".into(),
            z_node_name: "c".into(),
            link_type: LinkType::Ethernet,
            is_alive: false,
        })
        .unwrap();
        let mut status = BTreeMap::new();
        status.insert(mac(3), true);
        view.set_wired_link_status(mac(1), &status).unwrap();
        assert!(view.get_link("wired-a-c").unwrap().is_alive);
        // the wireless a-b link is untouched
        assert!(view.get_link(&Link::make_name("a", "b")).unwrap().is_alive);
    }

    #[test]
    fn snapshot_round_trips() {
        let view = linear_topology();
        let doc = view.to_topology();
        let rebuilt = TopologyView::new(doc.clone()).unwrap();
        assert_eq!(rebuilt.to_topology(), doc);
    }
}
