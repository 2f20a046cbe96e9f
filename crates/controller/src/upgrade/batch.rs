//! The runtime slice of an upgrade request currently in flight.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lattice_primitives::wire::UpgradeGroupReq;

/// A bounded set of nodes executing one phase of an upgrade request.
#[derive(Clone, Debug)]
pub struct Batch {
    nodes: BTreeSet<String>,
    req: Arc<UpgradeGroupReq>,
    /// Wireless links dead at initiation, ignored in recovery checks.
    skip_links: BTreeSet<String>,
    /// BGP peer counts captured at initiation on gateway nodes.
    bgp_peers: BTreeMap<String, usize>,
    started: Option<Instant>,
}

impl Batch {
    pub fn new(nodes: BTreeSet<String>, req: Arc<UpgradeGroupReq>) -> Self {
        Self {
            nodes,
            req,
            skip_links: BTreeSet::new(),
            bgp_peers: BTreeMap::new(),
            started: None,
        }
    }

    pub fn empty(req: Arc<UpgradeGroupReq>) -> Self {
        Self::new(BTreeSet::new(), req)
    }

    pub fn req(&self) -> &Arc<UpgradeGroupReq> {
        &self.req
    }

    pub fn pending(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_names(&self) -> BTreeSet<String> {
        self.nodes.clone()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    pub fn remove_node(&mut self, node: &str) {
        self.nodes.remove(node);
    }

    pub fn add_nodes(&mut self, nodes: impl IntoIterator<Item = String>) {
        self.nodes.extend(nodes);
    }

    pub fn skip_links(&self) -> &BTreeSet<String> {
        &self.skip_links
    }

    pub fn bgp_peers(&self) -> &BTreeMap<String, usize> {
        &self.bgp_peers
    }

    /// Arm the batch clock, capturing the recovery baselines.
    pub fn initiate(&mut self, skip_links: BTreeSet<String>, bgp_peers: BTreeMap<String, usize>) {
        self.skip_links = skip_links;
        self.bgp_peers = bgp_peers;
        self.started = Some(Instant::now());
    }

    pub fn timed_out(&self) -> bool {
        match self.started {
            Some(started) => {
                let timeout = Duration::from_secs(self.req.timeout.max(0) as u64);
                started.elapsed() >= timeout
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(timeout: i64) -> Arc<UpgradeGroupReq> {
        Arc::new(UpgradeGroupReq {
            timeout,
            ..Default::default()
        })
    }

    #[test]
    fn batch_tracks_membership() {
        let mut batch = Batch::new(["a", "b"].map(str::to_owned).into(), req(600));
        assert!(batch.pending());
        batch.remove_node("a");
        assert_eq!(batch.len(), 1);
        batch.clear();
        assert!(!batch.pending());
    }

    #[test]
    fn unarmed_batch_never_times_out() {
        let batch = Batch::new(["a".to_owned()].into(), req(0));
        assert!(!batch.timed_out());
    }

    #[test]
    fn zero_timeout_expires_immediately_once_armed() {
        let mut batch = Batch::new(["a".to_owned()].into(), req(0));
        batch.initiate(BTreeSet::new(), BTreeMap::new());
        assert!(batch.timed_out());
    }
}
