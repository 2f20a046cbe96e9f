//! Status index: the authoritative per-node health view.
//!
//! Minions push status reports over the broker; this app canonicalizes and
//! indexes them, detects status transitions, and fans the consequences out
//! to the topology endpoint and the config service. It never deletes an
//! entry itself -- node lifecycle belongs to topology.

mod gps;

pub use gps::GpsOutlierFilter;

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use lattice_primitives::wire::{
    GetGpsTime, GetLinkStatus, GetStatusDump, GpsTime, NodeStatus, RebootNode, RebootRequest,
    RestartMinion, RestartMinionRequest, SetNodeMac, SetNodeParamsReq, SetNodeStatus,
    SetWiredLinkStatus, StatusDump, StatusReport, StatusReportAck,
};
use lattice_primitives::{AppId, MacAddr, MessageType, MinionAppId};

use crate::broker::{Inbound, MessageIo};
use crate::settings::StatusOptions;
use crate::shared::SharedState;

/// Maximum age of the previous report for its ack to anchor a GPS
/// round-trip measurement.
const STATUS_REPORT_ALLOWED_TIME: Duration = Duration::from_secs(30);

/// A status report plus the monotonic bookkeeping around it.
#[derive(Clone, Debug)]
pub struct StatusEntry {
    /// When the last report was received.
    pub steady_ts: Instant,
    /// When the last *full* (non-partial) report was received.
    pub last_full_report_ts: Instant,
    pub report: StatusReport,
}

impl StatusEntry {
    pub fn new(now: Instant, report: StatusReport) -> Self {
        Self {
            steady_ts: now,
            last_full_report_ts: now,
            report,
        }
    }
}

pub struct StatusApp {
    io: MessageIo,
    shared: SharedState,
    opts: StatusOptions,
    version: String,
    gps_filter: GpsOutlierFilter,
}

impl StatusApp {
    pub fn new(io: MessageIo, shared: SharedState, opts: StatusOptions) -> Self {
        let version = std::fs::read_to_string(&opts.version_file)
            .map(|v| v.trim().to_owned())
            .unwrap_or_default();
        if version.is_empty() {
            warn!("could not read controller version file");
        } else {
            info!(%version, "controller version");
        }
        let gps_filter = GpsOutlierFilter::new(opts.min_gps_queue_size, opts.max_gps_queue_size);
        Self {
            io,
            shared,
            opts,
            version,
            gps_filter,
        }
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
            MessageType::StatusReport => {
                let Some(minion) = inbound.minion else {
                    warn!(%sender, "status report without minion identity");
                    return;
                };
                match inbound.envelope.read::<StatusReport>() {
                    Ok(report) => self.process_status_report(minion, report),
                    Err(_) => self.invalid(&sender, "StatusReport"),
                }
            }
            MessageType::GetStatusDump => {
                if inbound.envelope.read::<GetStatusDump>().is_err() {
                    return self.invalid(&sender, "GetStatusDump");
                }
                self.process_get_status_dump(sender);
            }
            MessageType::RebootRequest => match inbound.envelope.read::<RebootRequest>() {
                Ok(req) => self.process_reboot_request(sender, req),
                Err(_) => self.invalid(&sender, "RebootRequest"),
            },
            MessageType::RestartMinionRequest => {
                match inbound.envelope.read::<RestartMinionRequest>() {
                    Ok(req) => self.process_restart_minion_request(sender, req),
                    Err(_) => self.invalid(&sender, "RestartMinionRequest"),
                }
            }
            MessageType::GetGpsTime => {
                if inbound.envelope.read::<GetGpsTime>().is_err() {
                    return self.invalid(&sender, "GetGpsTime");
                }
                self.process_get_gps_time(sender);
            }
            MessageType::IsAlive => {
                self.io.send_ack(sender, true, "Up");
            }
            other => {
                warn!(?other, %sender, "wrong type of message for status app");
            }
        }
    }

    fn process_status_report(&mut self, minion: MacAddr, mut report: StatusReport) {
        debug!(%minion, "status report received");

        // Resolve the sender against topology. A radio MAC belonging to a
        // node with an empty primary MAC triggers topology adoption of the
        // new id; the report itself is dropped until topology converges.
        let (node_name, node_status, node_type, wlan_macs, wireless_nbrs, wired_nbrs);
        {
            let topology = self.shared.topology.read();
            let resolved = topology.get_node_by_mac(minion);
            let node = match resolved {
                Some(node) if node.mac_addr == Some(minion) => node,
                Some(node) if node.mac_addr.is_none() => {
                    let name = node.name.clone();
                    return self.adopt_primary_mac(&name, minion);
                }
                _ => {
                    let mut adopt = None;
                    if self.opts.allow_minion_wlan_macs {
                        for radio_mac in report.radio_status.keys() {
                            if let Some(node) = topology.get_node_by_mac(*radio_mac) {
                                if node.mac_addr.is_none() {
                                    adopt = Some(node.name.clone());
                                    break;
                                }
                            }
                        }
                    }
                    if let Some(name) = adopt {
                        return self.adopt_primary_mac(&name, minion);
                    }
                    metrics::counter!("status_unknown_node_reports").increment(1);
                    warn!(
                        %minion,
                        category = "status",
                        event = "unknown_node",
                        "dropped status report from unknown node"
                    );
                    return;
                }
            };

            node_name = node.name.clone();
            node_status = node.status;
            node_type = node.node_type;
            wlan_macs = node.wlan_mac_addrs.clone();

            let mut wireless = Vec::new();
            let mut wired = Vec::new();
            for link in topology.links_by_node(&node_name) {
                let Some(other) = link.other_end(&node_name) else {
                    continue;
                };
                let Some(nbr_mac) = topology.mac_by_name(other) else {
                    continue;
                };
                match link.link_type {
                    lattice_topology::LinkType::Ethernet => wired.push(nbr_mac),
                    lattice_topology::LinkType::Wireless => wireless.push(nbr_mac),
                }
            }
            wireless_nbrs = wireless;
            wired_nbrs = wired;
        }

        // Index the report.
        let now = Instant::now();
        report.timestamp = unix_now_secs();
        let mut throttled = false;
        let mut request_full = false;
        let mut ip_changed = false;
        {
            // Clone the lock handle so the guard does not pin `self` while
            // the GPS path below needs it mutably.
            let reports_lock = std::sync::Arc::clone(&self.shared.status_reports);
            let mut reports = reports_lock.write();
            match reports.entry(minion) {
                std::collections::btree_map::Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    if now.duration_since(entry.steady_ts) < self.opts.report_throttle_interval {
                        throttled = true;
                    }

                    let prev_status = entry.report.status;
                    let prev_steady_ts = entry.steady_ts;
                    entry.steady_ts = now;

                    if report.version.is_empty() {
                        // Partial report: inherit static fields from the cache.
                        report.version = entry.report.version.clone();
                        report.uboot_version = entry.report.uboot_version.clone();
                        report.firmware_version = entry.report.firmware_version.clone();
                        report.hardware_model = entry.report.hardware_model.clone();
                        report.hardware_board_id = entry.report.hardware_board_id.clone();
                        report.network_interface_macs = entry.report.network_interface_macs.clone();

                        // Re-request a full report when the node looked
                        // offline, or as a periodic safeguard.
                        if node_status == NodeStatus::Offline
                            || now.duration_since(entry.last_full_report_ts)
                                >= self.opts.full_report_interval
                        {
                            request_full = true;
                        }
                    } else {
                        entry.last_full_report_ts = now;
                    }

                    if report.ipv6_address != entry.report.ipv6_address {
                        ip_changed = true;
                    }
                    entry.report = report.clone();

                    self.update_gps_time(&report, prev_status, prev_steady_ts, now);
                }
                std::collections::btree_map::Entry::Vacant(vacant) => {
                    if report.version.is_empty() {
                        // Partial report from a node we have nothing cached
                        // for.
                        request_full = true;
                    } else {
                        vacant.insert(StatusEntry::new(now, report.clone()));
                        ip_changed = true;
                    }
                }
            }
        }

        if ip_changed {
            debug!(node = %node_name, ip = %report.ipv6_address, "node IP address changed");
            let update = lattice_primitives::wire::UpdateTunnelConfig {
                node_name: node_name.clone(),
                ipv6_address: report.ipv6_address.clone(),
            };
            let _ = self
                .io
                .send_to_app(AppId::Config, MessageType::UpdateTunnelConfig, &update);
        }

        // Always acknowledge, even when throttled.
        let ack = StatusReportAck {
            request_full_status_report: request_full && !throttled,
        };
        let _ = self.io.send_to_minion(
            minion,
            MinionAppId::Status,
            MessageType::StatusReportAck,
            &ack,
        );

        // Too-frequent reports (e.g. buffered by the transport across a
        // reconnect) are not re-processed.
        if throttled {
            return;
        }

        if report.status == NodeStatus::Offline {
            // The minion just (re)started: push node params and flip it
            // online in topology.
            metrics::counter!("status_node_online_transitions").increment(1);
            let _ = self.io.send_to_app(
                AppId::Topology,
                MessageType::SetNodeParamsReq,
                &SetNodeParamsReq { node_mac: minion },
            );
            let _ = self.io.send_to_app(
                AppId::Topology,
                MessageType::SetNodeStatus,
                &SetNodeStatus {
                    node_mac: minion,
                    status: NodeStatus::Online,
                },
            );
        } else {
            metrics::counter!("status_reports_indexed", "minion" => minion.to_string())
                .increment(1);
        }

        // Refresh link state when either side believed the node offline.
        if report.status == NodeStatus::Offline || node_status == NodeStatus::Offline {
            for nbr_mac in &wireless_nbrs {
                let _ = self.io.send_to_minion(
                    minion,
                    MinionAppId::Ignition,
                    MessageType::GetLinkStatus,
                    &GetLinkStatus {
                        responder_mac: *nbr_mac,
                    },
                );
            }
        }

        if report.neighbor_connection_status.is_some() {
            let link_status = self.correlate_wired_links(&report, &wired_nbrs);
            let _ = self.io.send_to_app(
                AppId::Topology,
                MessageType::SetWiredLinkStatus,
                &SetWiredLinkStatus {
                    node_mac: minion,
                    link_status,
                },
            );
        }

        // A node reporting a type that contradicts topology needs a minion
        // restart to re-initialize firmware state.
        if let Some(reported_type) = report.node_type {
            if reported_type != node_type {
                info!(
                    node = %node_name,
                    ?reported_type,
                    topology_type = ?node_type,
                    "node type mismatch, restarting minion"
                );
                let _ = self.io.send_to_minion(
                    minion,
                    MinionAppId::Status,
                    MessageType::RestartMinion,
                    &RestartMinion {
                        seconds_to_restart: 1,
                    },
                );
            }
        }

        // Self-reported radios missing from topology.
        let new_wlan_macs: Vec<MacAddr> = report
            .radio_status
            .keys()
            .filter(|mac| !wlan_macs.contains(mac))
            .copied()
            .collect();
        if !new_wlan_macs.is_empty() {
            info!(node = %node_name, "adding self-reported WLAN MAC addresses");
            let _ = self.io.send_to_app(
                AppId::Topology,
                MessageType::AddNodeWlanMacs,
                &lattice_primitives::wire::AddNodeWlanMacs {
                    node_name,
                    wlan_macs: new_wlan_macs,
                },
            );
        }
    }

    fn adopt_primary_mac(&self, node_name: &str, minion: MacAddr) {
        debug!(
            node = %node_name,
            %minion,
            "minion id matches a radio MAC of a node without a primary MAC, updating topology"
        );
        let _ = self.io.send_to_app(
            AppId::Topology,
            MessageType::SetNodeMac,
            &SetNodeMac {
                node_name: node_name.to_owned(),
                node_mac: minion,
                force: true,
            },
        );
        // Drop this report; the next one after topology converges is indexed.
    }

    /// Wired link liveness: correlate the reporter's neighbor-connection
    /// table with each wired neighbor's interface MAC table.
    fn correlate_wired_links(
        &self,
        report: &StatusReport,
        wired_nbrs: &[MacAddr],
    ) -> BTreeMap<MacAddr, bool> {
        let mut link_status = BTreeMap::new();
        let Some(conn_status) = &report.neighbor_connection_status else {
            return link_status;
        };
        let reports = self.shared.status_reports.read();
        for nbr in wired_nbrs {
            let Some(entry) = reports.get(nbr) else {
                continue;
            };
            let Some(interfaces) = &entry.report.network_interface_macs else {
                continue;
            };
            // Down unless one of the neighbor's wired interfaces shows up in
            // the reporter's connection table.
            let mut alive = false;
            for if_mac in interfaces.values() {
                if let Some(up) = conn_status.get(if_mac) {
                    alive = *up;
                    break;
                }
            }
            link_status.insert(*nbr, alive);
        }
        link_status
    }

    fn update_gps_time(
        &mut self,
        report: &StatusReport,
        prev_status: NodeStatus,
        prev_steady_ts: Instant,
        now: Instant,
    ) {
        // Only nodes that were link-initiating (hence GPS-locked) when last
        // seen can drive the clock.
        if prev_status != NodeStatus::OnlineInitiator {
            return;
        }
        if report.last_ack_gps_timestamp == 0 {
            return;
        }
        if now.duration_since(prev_steady_ts) >= STATUS_REPORT_ALLOWED_TIME {
            return;
        }

        // Cristian's algorithm: subtract the network round trip measured
        // against our ack of the previous report.
        let round_trip_us = now.duration_since(prev_steady_ts).as_micros() as i64;
        let node_elapsed_us =
            report.sent_gps_timestamp as i64 - report.last_ack_gps_timestamp as i64;
        let delta = round_trip_us - node_elapsed_us;
        let gps_time_us = report.sent_gps_timestamp as i64 + delta / 2;

        let local_us = match self.shared.gps_clock.now_us() {
            0 => crate::shared::GpsClock::system_fallback_us(),
            set => set,
        };
        let system_delta = local_us - gps_time_us;

        if self.gps_filter.observe(system_delta) {
            debug!(gps_time_us, "received outlier GPS timestamp");
            return;
        }
        self.shared.gps_clock.set_epoch_us(gps_time_us);
    }

    fn process_get_status_dump(&self, sender: AppId) {
        let status_reports: BTreeMap<MacAddr, StatusReport> = self
            .shared
            .status_reports
            .read()
            .iter()
            .map(|(mac, entry)| (*mac, entry.report.clone()))
            .collect();
        let dump = StatusDump {
            timestamp: unix_now_secs(),
            status_reports,
            version: Some(self.version.clone()),
        };
        if let Err(err) = self.io.send_to_app(sender, MessageType::StatusDump, &dump) {
            warn!(?err, "failed sending status dump");
        }
    }

    /// Resolve the targets of a fleet-wide reboot/restart request. `None`
    /// with a reason when validation fails.
    fn resolve_restart_targets(
        &self,
        delay_secs: i32,
        nodes: &[String],
        error: &mut String,
    ) -> Option<Vec<(String, MacAddr)>> {
        if !(1..=60).contains(&delay_secs) {
            *error = "Delay should be between 1 and 60".to_owned();
            return None;
        }
        let topology = self.shared.topology.read();
        let mut targets = Vec::new();
        if nodes.is_empty() {
            for node in topology.all_nodes() {
                if let Some(mac) = node.mac_addr {
                    targets.push((node.name.clone(), mac));
                }
            }
        } else {
            for name in nodes {
                let Some(node) = topology.get_node(name) else {
                    *error = format!("Could not find node: {name}");
                    return None;
                };
                if let Some(mac) = node.mac_addr {
                    targets.push((node.name.clone(), mac));
                }
            }
        }
        Some(targets)
    }

    fn process_reboot_request(&self, sender: AppId, req: RebootRequest) {
        let mut resp = "Reboot requests sent to nodes".to_owned();
        let targets = self.resolve_restart_targets(req.seconds_to_reboot, &req.nodes, &mut resp);
        if let Some(targets) = &targets {
            for (name, mac) in targets {
                info!(node = %name, category = "status", event = "reboot_node_req", "sent reboot request");
                let _ = self.io.send_to_minion(
                    *mac,
                    MinionAppId::Status,
                    MessageType::RebootNode,
                    &RebootNode {
                        force: req.force,
                        seconds_to_reboot: req.seconds_to_reboot,
                    },
                );
            }
        }
        self.io.send_ack(sender, targets.is_some(), resp);
    }

    fn process_restart_minion_request(&self, sender: AppId, req: RestartMinionRequest) {
        let mut resp = "Restart requests sent to minions".to_owned();
        let targets = self.resolve_restart_targets(req.seconds_to_restart, &req.nodes, &mut resp);
        if let Some(targets) = &targets {
            for (name, mac) in targets {
                info!(node = %name, category = "status", event = "restart_minion_req", "sent minion restart request");
                let _ = self.io.send_to_minion(
                    *mac,
                    MinionAppId::Status,
                    MessageType::RestartMinion,
                    &RestartMinion {
                        seconds_to_restart: req.seconds_to_restart,
                    },
                );
            }
        }
        self.io.send_ack(sender, targets.is_some(), resp);
    }

    fn process_get_gps_time(&self, sender: AppId) {
        let gps_time = GpsTime {
            unix_time_ns: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0),
            gps_time_us: self.shared.gps_clock.now_us(),
        };
        if let Err(err) = self.io.send_to_app(sender, MessageType::GpsTime, &gps_time) {
            warn!(?err, "failed sending GPS time");
        }
    }

    fn invalid(&self, sender: &AppId, kind: &str) {
        metrics::counter!("status_invalid_messages").increment(1);
        warn!(%sender, kind, "invalid message payload");
        self.io.send_ack(sender.clone(), false, format!("Invalid {kind}"));
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Outbound, test_endpoint};
    use lattice_primitives::Envelope;
    use lattice_primitives::wire::NodeType;
    use lattice_topology::{Link, LinkType, Node};
    use tokio::sync::mpsc;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0, 1, 2, 3, 4, last])
    }

    fn make_node(name: &str, last: u8, status: NodeStatus) -> Node {
        Node {
            name: name.to_owned(),
            mac_addr: Some(mac(last)),
            wlan_mac_addrs: vec![],
            node_type: NodeType::Dn,
            pop_node: false,
            status,
        }
    }

    struct Fixture {
        app: StatusApp,
        outbox: mpsc::Receiver<Outbound>,
        shared: SharedState,
    }

    fn fixture(opts: StatusOptions) -> Fixture {
        let shared = SharedState::new_for_test();
        let (io, outbox) = test_endpoint(AppId::Status);
        let app = StatusApp::new(io, shared.clone(), opts);
        Fixture { app, outbox, shared }
    }

    fn opts_with_throttle(throttle: Duration) -> StatusOptions {
        StatusOptions {
            report_throttle_interval: throttle,
            version_file: "/nonexistent".into(),
            ..Default::default()
        }
    }

    fn full_report(version: &str) -> StatusReport {
        StatusReport {
            version: version.to_owned(),
            status: NodeStatus::Online,
            hardware_board_id: "MB1".into(),
            ipv6_address: "2001:db8::1".into(),
            ..Default::default()
        }
    }

    fn drain(outbox: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = outbox.try_recv() {
            out.push(msg);
        }
        out
    }

    fn sent_types(outbox: &mut mpsc::Receiver<Outbound>) -> Vec<MessageType> {
        drain(outbox)
            .into_iter()
            .map(|o| match o {
                Outbound::ToApp { envelope, .. } => envelope.mtype,
                Outbound::ToMinion { envelope, .. } => envelope.mtype,
            })
            .collect()
    }

    #[test]
    fn unknown_node_report_is_dropped() {
        let mut fx = fixture(opts_with_throttle(Duration::ZERO));
        fx.app.process_status_report(mac(9), full_report("RELEASE_M40"));
        assert!(fx.shared.status_reports.read().is_empty());
        assert!(drain(&mut fx.outbox).is_empty());
    }

    #[test]
    fn offline_transition_notifies_topology() {
        let mut fx = fixture(opts_with_throttle(Duration::ZERO));
        fx.shared
            .topology
            .write()
            .add_node(make_node("a", 1, NodeStatus::Offline))
            .unwrap();
        let mut report = full_report("RELEASE_M40");
        report.status = NodeStatus::Offline; // minion self-reports a restart
        fx.app.process_status_report(mac(1), report);

        let types = sent_types(&mut fx.outbox);
        assert!(types.contains(&MessageType::StatusReportAck));
        assert!(types.contains(&MessageType::SetNodeParamsReq));
        assert!(types.contains(&MessageType::SetNodeStatus));
        assert_eq!(fx.shared.status_reports.read().len(), 1);
    }

    #[test]
    fn throttled_report_is_acked_but_not_indexed() {
        let mut fx = fixture(opts_with_throttle(Duration::from_secs(3600)));
        fx.shared
            .topology
            .write()
            .add_node(make_node("a", 1, NodeStatus::Online))
            .unwrap();
        fx.app.process_status_report(mac(1), full_report("RELEASE_M40"));
        let _ = drain(&mut fx.outbox);

        let mut second = full_report("RELEASE_M41");
        second.ipv6_address = "2001:db8::2".into();
        fx.app.process_status_report(mac(1), second);

        let types = sent_types(&mut fx.outbox);
        // Ack (and the tunnel update from the IP change) but no topology
        // notifications: the report body was still recorded, processing
        // stopped at the throttle.
        assert!(types.contains(&MessageType::StatusReportAck));
        assert!(!types.contains(&MessageType::SetNodeStatus));
    }

    #[test]
    fn partial_report_inherits_static_fields() {
        let mut fx = fixture(opts_with_throttle(Duration::ZERO));
        fx.shared
            .topology
            .write()
            .add_node(make_node("a", 1, NodeStatus::Online))
            .unwrap();
        fx.app.process_status_report(mac(1), full_report("RELEASE_M40"));
        let _ = drain(&mut fx.outbox);

        let mut partial = StatusReport {
            status: NodeStatus::Online,
            ipv6_address: "2001:db8::1".into(),
            ..Default::default()
        };
        partial.version.clear();
        fx.app.process_status_report(mac(1), partial);

        let reports = fx.shared.status_reports.read();
        let entry = reports.get(&mac(1)).unwrap();
        assert_eq!(entry.report.version, "RELEASE_M40");
        assert_eq!(entry.report.hardware_board_id, "MB1");
    }

    #[test]
    fn partial_report_from_new_node_requests_full() {
        let mut fx = fixture(opts_with_throttle(Duration::ZERO));
        fx.shared
            .topology
            .write()
            .add_node(make_node("a", 1, NodeStatus::Online))
            .unwrap();
        let partial = StatusReport {
            status: NodeStatus::Online,
            ..Default::default()
        };
        fx.app.process_status_report(mac(1), partial);

        // not indexed, but the ack requests the full report
        assert!(fx.shared.status_reports.read().is_empty());
        let acks: Vec<StatusReportAck> = drain(&mut fx.outbox)
            .into_iter()
            .filter_map(|o| match o {
                Outbound::ToMinion { envelope, .. }
                    if envelope.mtype == MessageType::StatusReportAck =>
                {
                    envelope.read().ok()
                }
                _ => None,
            })
            .collect();
        assert_eq!(acks.len(), 1);
        assert!(acks[0].request_full_status_report);
    }

    #[test]
    fn radio_mac_of_unset_node_triggers_adoption() {
        let mut fx = fixture(opts_with_throttle(Duration::ZERO));
        fx.shared
            .topology
            .write()
            .add_node(Node {
                name: "a".into(),
                mac_addr: None,
                wlan_mac_addrs: vec![mac(50)],
                node_type: NodeType::Dn,
                pop_node: false,
                status: NodeStatus::Offline,
            })
            .unwrap();
        let mut report = full_report("RELEASE_M40");
        report.radio_status.insert(mac(50), Default::default());
        fx.app.process_status_report(mac(7), report);

        // report dropped, SetNodeMac emitted
        assert!(fx.shared.status_reports.read().is_empty());
        let msgs = drain(&mut fx.outbox);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            Outbound::ToApp { dest, envelope, .. } => {
                assert_eq!(*dest, AppId::Topology);
                let req: SetNodeMac = envelope.read().unwrap();
                assert_eq!(req.node_mac, mac(7));
                assert!(req.force);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn node_type_mismatch_restarts_minion() {
        let mut fx = fixture(opts_with_throttle(Duration::ZERO));
        fx.shared
            .topology
            .write()
            .add_node(make_node("a", 1, NodeStatus::Online))
            .unwrap();
        let mut report = full_report("RELEASE_M40");
        report.node_type = Some(NodeType::Cn);
        fx.app.process_status_report(mac(1), report);
        let restarts: Vec<_> = drain(&mut fx.outbox)
            .into_iter()
            .filter(|o| matches!(o, Outbound::ToMinion { envelope, .. } if envelope.mtype == MessageType::RestartMinion))
            .collect();
        assert_eq!(restarts.len(), 1);
    }

    #[test]
    fn wired_link_status_is_correlated() {
        let mut fx = fixture(opts_with_throttle(Duration::ZERO));
        {
            let mut topo = fx.shared.topology.write();
            topo.add_node(make_node("a", 1, NodeStatus::Online)).unwrap();
            topo.add_node(make_node("b", 2, NodeStatus::Online)).unwrap();
            topo.add_link(Link {
                name: "wired-a-b".into(),
                a_node_name: "a".into(),
                z_node_name: "b".into(),
                link_type: LinkType::Ethernet,
                is_alive: false,
            })
            .unwrap();
        }
        // b's report declares its wired interface MAC
        let mut b_report = full_report("RELEASE_M40");
        let mut ifmap = BTreeMap::new();
        ifmap.insert("nic0".to_owned(), mac(102));
        b_report.network_interface_macs = Some(ifmap);
        fx.app.process_status_report(mac(2), b_report);
        let _ = drain(&mut fx.outbox);

        // a sees b's interface as connected
        let mut a_report = full_report("RELEASE_M40");
        let mut conn = BTreeMap::new();
        conn.insert(mac(102), true);
        a_report.neighbor_connection_status = Some(conn);
        fx.app.process_status_report(mac(1), a_report);

        let wired: Vec<SetWiredLinkStatus> = drain(&mut fx.outbox)
            .into_iter()
            .filter_map(|o| match o {
                Outbound::ToApp { envelope, .. }
                    if envelope.mtype == MessageType::SetWiredLinkStatus =>
                {
                    envelope.read().ok()
                }
                _ => None,
            })
            .collect();
        assert_eq!(wired.len(), 1);
        assert_eq!(wired[0].link_status.get(&mac(2)), Some(&true));
    }

    #[test]
    fn reboot_request_validates_delay() {
        let mut fx = fixture(opts_with_throttle(Duration::ZERO));
        fx.app.process_reboot_request(
            AppId::Api("cli".into()),
            RebootRequest {
                force: false,
                seconds_to_reboot: 0,
                nodes: vec![],
            },
        );
        let msgs = drain(&mut fx.outbox);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            Outbound::ToApp { envelope, .. } => {
                let ack: lattice_primitives::wire::Ack = envelope.read().unwrap();
                assert!(!ack.success);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_dump_includes_version() {
        let mut fx = fixture(opts_with_throttle(Duration::ZERO));
        fx.app.version = "RELEASE_M46".into();
        fx.app.process_get_status_dump(AppId::Api("cli".into()));
        let msgs = drain(&mut fx.outbox);
        let dump: StatusDump = match &msgs[0] {
            Outbound::ToApp { envelope, .. } => envelope.read().unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(dump.version.as_deref(), Some("RELEASE_M46"));
    }

    #[test]
    fn handle_dispatches_is_alive() {
        let mut fx = fixture(opts_with_throttle(Duration::ZERO));
        let envelope =
            Envelope::new(MessageType::IsAlive, &lattice_primitives::wire::IsAlive {}).unwrap();
        fx.app.handle(Inbound {
            minion: None,
            sender: AppId::Api("probe".into()),
            envelope,
        });
        let msgs = drain(&mut fx.outbox);
        assert_eq!(msgs.len(), 1);
    }
}
