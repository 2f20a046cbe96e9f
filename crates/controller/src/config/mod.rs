//! Configuration service.
//!
//! Owns the layered config store, answers every config query/mutation on
//! the API channel, and converges the fleet: each tick it compares every
//! live node's reported config hash against the freshly computed effective
//! config and rolls deltas out in bounded batches.

pub mod controller_config;
pub mod helper;
pub mod metadata;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use lattice_primitives::wire::{
    BaseConfigs, ClearAutoNodeOverrides, ConfigAction, ConfigMetadataResp, ControllerConfigResp,
    GetAutoNodeOverridesReq, GetBaseConfigsReq, GetConfigMetadataReq, GetConfigReq, GetConfigResp,
    GetControllerConfigMetadataReq, GetControllerConfigReq, GetFirmwareBaseConfigsReq,
    GetHardwareBaseConfigsReq, GetNetworkOverridesReq, GetNodeOverridesReq, HaAppData,
    HaGetAppData, MinionConfigActions, NetworkOverrides, NodeOverrides, SetControllerConfigReq,
    SetMinionConfig, UpdateTunnelConfig,
};
use lattice_primitives::{AppId, MacAddr, MessageType, MinionAppId};

use crate::broker::{Inbound, MessageIo};
use crate::settings::ConfigOptions;
use crate::shared::SharedState;
use helper::{changed_paths, get_path};

/// Actions that cannot be applied dynamically; any changed key requiring
/// one forces a full config push instead of an actions message.
const DISRUPTIVE_ACTIONS: &[ConfigAction] =
    &[ConfigAction::RebootNode, ConfigAction::RestartMinion];

pub struct ConfigApp {
    io: MessageIo,
    shared: SharedState,
    opts: ConfigOptions,
    /// Node name -> expected hash for the rollout batch in flight.
    cur_batch: BTreeMap<String, String>,
    batch_started: Option<Instant>,
    /// Last effective config pushed per node, for delta/action computation.
    last_pushed: BTreeMap<String, Value>,
}

impl ConfigApp {
    pub fn new(io: MessageIo, shared: SharedState, opts: ConfigOptions) -> Self {
        Self {
            io,
            shared,
            opts,
            cur_batch: BTreeMap::new(),
            batch_started: None,
            last_pushed: BTreeMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut sync_tick = tokio::time::interval(self.opts.status_sync_interval);
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = sync_tick.tick() => {
                    self.sync_with_status_reports();
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
        let envelope = &inbound.envelope;
        match envelope.mtype {
            MessageType::GetConfigReq => match envelope.read::<GetConfigReq>() {
                Ok(req) => self.process_get_config(sender, req),
                Err(_) => self.invalid(&sender, "GetConfigReq"),
            },
            MessageType::GetNetworkOverridesReq => {
                if envelope.read::<GetNetworkOverridesReq>().is_err() {
                    return self.invalid(&sender, "GetNetworkOverridesReq");
                }
                let overrides = self.shared.config.read().network_overrides_json();
                self.reply(
                    sender,
                    MessageType::GetNetworkOverridesResp,
                    &NetworkOverrides { overrides },
                );
            }
            MessageType::SetNetworkOverridesReq => match envelope.read::<NetworkOverrides>() {
                Ok(req) => self.process_set_network_overrides(sender, req, true),
                Err(_) => self.invalid(&sender, "SetNetworkOverridesReq"),
            },
            MessageType::ModifyNetworkOverridesReq => match envelope.read::<NetworkOverrides>() {
                Ok(req) => self.process_set_network_overrides(sender, req, false),
                Err(_) => self.invalid(&sender, "ModifyNetworkOverridesReq"),
            },
            MessageType::GetNodeOverridesReq => match envelope.read::<GetNodeOverridesReq>() {
                Ok(req) => {
                    let overrides = self.shared.config.read().node_overrides_json(&req.nodes);
                    self.reply(
                        sender,
                        MessageType::GetNodeOverridesResp,
                        &NodeOverrides { overrides },
                    );
                }
                Err(_) => self.invalid(&sender, "GetNodeOverridesReq"),
            },
            MessageType::SetNodeOverridesReq => match envelope.read::<NodeOverrides>() {
                Ok(req) => self.process_set_node_overrides(sender, req, true),
                Err(_) => self.invalid(&sender, "SetNodeOverridesReq"),
            },
            MessageType::ModifyNodeOverridesReq => match envelope.read::<NodeOverrides>() {
                Ok(req) => self.process_set_node_overrides(sender, req, false),
                Err(_) => self.invalid(&sender, "ModifyNodeOverridesReq"),
            },
            MessageType::GetAutoNodeOverridesReq => {
                match envelope.read::<GetAutoNodeOverridesReq>() {
                    Ok(req) => {
                        let overrides =
                            self.shared.config.read().auto_node_overrides_json(&req.nodes);
                        self.reply(
                            sender,
                            MessageType::GetAutoNodeOverridesResp,
                            &NodeOverrides { overrides },
                        );
                    }
                    Err(_) => self.invalid(&sender, "GetAutoNodeOverridesReq"),
                }
            }
            MessageType::ClearAutoNodeOverrides => {
                match envelope.read::<ClearAutoNodeOverrides>() {
                    Ok(req) => {
                        let result = self
                            .shared
                            .config
                            .write()
                            .clear_auto_overrides(&req.nodes, &req.paths);
                        match result {
                            Ok(()) => {
                                self.record_config_sync();
                                self.io.send_ack(sender, true, "Cleared automatic overrides");
                            }
                            Err(err) => self.io.send_ack(sender, false, err.to_string()),
                        }
                    }
                    Err(_) => self.invalid(&sender, "ClearAutoNodeOverrides"),
                }
            }
            MessageType::GetBaseConfigsReq => match envelope.read::<GetBaseConfigsReq>() {
                Ok(req) => {
                    let config = self.shared.config.read().base_configs_json(&req.sw_versions);
                    self.reply(sender, MessageType::GetBaseConfigsResp, &BaseConfigs { config });
                }
                Err(_) => self.invalid(&sender, "GetBaseConfigsReq"),
            },
            MessageType::GetFirmwareBaseConfigsReq => {
                match envelope.read::<GetFirmwareBaseConfigsReq>() {
                    Ok(req) => {
                        let config = self
                            .shared
                            .config
                            .read()
                            .firmware_base_configs_json(&req.fw_versions);
                        self.reply(
                            sender,
                            MessageType::GetFirmwareBaseConfigsResp,
                            &BaseConfigs { config },
                        );
                    }
                    Err(_) => self.invalid(&sender, "GetFirmwareBaseConfigsReq"),
                }
            }
            MessageType::GetHardwareBaseConfigsReq => {
                match envelope.read::<GetHardwareBaseConfigsReq>() {
                    Ok(req) => {
                        let config = self
                            .shared
                            .config
                            .read()
                            .hardware_base_configs_json(&req.hw_board_ids);
                        self.reply(
                            sender,
                            MessageType::GetHardwareBaseConfigsResp,
                            &BaseConfigs { config },
                        );
                    }
                    Err(_) => self.invalid(&sender, "GetHardwareBaseConfigsReq"),
                }
            }
            MessageType::GetConfigMetadataReq => {
                if envelope.read::<GetConfigMetadataReq>().is_err() {
                    return self.invalid(&sender, "GetConfigMetadataReq");
                }
                let metadata = self.shared.config.read().metadata().to_json();
                self.reply(
                    sender,
                    MessageType::GetConfigMetadataResp,
                    &ConfigMetadataResp { metadata },
                );
            }
            MessageType::GetControllerConfigReq => {
                if envelope.read::<GetControllerConfigReq>().is_err() {
                    return self.invalid(&sender, "GetControllerConfigReq");
                }
                let config = self.shared.controller_config.read().config_json();
                self.reply(
                    sender,
                    MessageType::GetControllerConfigResp,
                    &ControllerConfigResp { config },
                );
            }
            MessageType::SetControllerConfigReq => {
                match envelope.read::<SetControllerConfigReq>() {
                    Ok(req) => self.process_set_controller_config(sender, req),
                    Err(_) => self.invalid(&sender, "SetControllerConfigReq"),
                }
            }
            MessageType::GetControllerConfigMetadataReq => {
                if envelope.read::<GetControllerConfigMetadataReq>().is_err() {
                    return self.invalid(&sender, "GetControllerConfigMetadataReq");
                }
                let metadata = self.shared.controller_config.read().metadata_json();
                self.reply(
                    sender,
                    MessageType::GetControllerConfigMetadataResp,
                    &ConfigMetadataResp { metadata },
                );
            }
            MessageType::UpdateTunnelConfig => match envelope.read::<UpdateTunnelConfig>() {
                Ok(req) => self.process_update_tunnel_config(req),
                Err(_) => self.invalid(&sender, "UpdateTunnelConfig"),
            },
            MessageType::HaGetAppData => {
                if envelope.read::<HaGetAppData>().is_err() {
                    return self.invalid(&sender, "HaGetAppData");
                }
                self.record_config_sync();
                self.record_controller_config_sync();
            }
            MessageType::HaAppData => match envelope.read::<HaAppData>() {
                Ok(data) => self.adopt_replicated(data),
                Err(_) => self.invalid(&sender, "HaAppData"),
            },
            other => {
                warn!(?other, %sender, "wrong type of message for config app");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries and writes
    // -----------------------------------------------------------------------

    fn process_get_config(&self, sender: AppId, req: GetConfigReq) {
        // Fall back to the node's last report for any unspecified versions.
        let report = {
            let topology = self.shared.topology.read();
            let mac = topology.mac_by_name(&req.node);
            drop(topology);
            mac.and_then(|mac| {
                self.shared
                    .status_reports
                    .read()
                    .get(&mac)
                    .map(|e| e.report.clone())
            })
        };
        let sw = req
            .sw_version
            .or_else(|| report.as_ref().map(|r| r.version.clone()))
            .unwrap_or_default();
        let fw = req
            .fw_version
            .or_else(|| report.as_ref().map(|r| r.firmware_version.clone()))
            .unwrap_or_default();
        let hw = req
            .hw_board_id
            .or_else(|| report.as_ref().map(|r| r.hardware_board_id.clone()))
            .unwrap_or_default();

        let state = self
            .shared
            .config
            .read()
            .build_node_config(&req.node, &sw, &fw, &hw);
        self.reply(
            sender,
            MessageType::GetConfigResp,
            &GetConfigResp {
                config: helper::canonical_json(&state.effective),
            },
        );
    }

    fn process_set_network_overrides(
        &mut self,
        sender: AppId,
        req: NetworkOverrides,
        overwrite: bool,
    ) {
        let result = self
            .shared
            .config
            .write()
            .set_network_overrides(&req.overrides, overwrite);
        match result {
            Ok(()) => {
                info!(category = "config", "network overrides updated");
                self.record_config_sync();
                self.io.send_ack(sender, true, "Updated network overrides");
            }
            Err(err) => {
                self.io.send_ack(sender, false, err.to_string());
            }
        }
    }

    fn process_set_node_overrides(&mut self, sender: AppId, req: NodeOverrides, overwrite: bool) {
        let result = self
            .shared
            .config
            .write()
            .set_node_overrides(&req.overrides, overwrite);
        match result {
            Ok(changed) => {
                info!(
                    category = "config",
                    nodes = changed.len(),
                    "node overrides updated"
                );
                // User-initiated writes run the synchronous hook chain for
                // every changed node.
                for node in &changed {
                    self.process_config_hooks(node);
                }
                self.record_config_sync();
                self.io.send_ack(sender, true, "Updated node overrides");
            }
            Err(err) => {
                self.io.send_ack(sender, false, err.to_string());
            }
        }
    }

    fn process_set_controller_config(&mut self, sender: AppId, req: SetControllerConfigReq) {
        let result = self
            .shared
            .controller_config
            .write()
            .set_config(&req.config);
        match result {
            Ok(actions) => {
                self.record_controller_config_sync();
                self.perform_controller_actions(&actions);
                self.io.send_ack(sender, true, "Updated controller config");
            }
            Err(err) => self.io.send_ack(sender, false, err.to_string()),
        }
    }

    /// Map controller-side action kinds to in-process effects. The heavier
    /// kinds are delivered as messages so the owning component restarts its
    /// own machinery.
    fn perform_controller_actions(&self, actions: &BTreeSet<ConfigAction>) {
        for action in actions {
            match action {
                ConfigAction::NoAction => {}
                ConfigAction::RebootController => {
                    warn!(category = "config", "controller restart requested by config change");
                }
                ConfigAction::RestartUpgradeSeeder | ConfigAction::ReloadGoldenImage => {
                    // The upgrade orchestrator re-reads controller config on
                    // its next tick; nothing to forward.
                    debug!(?action, "deferred to upgrade orchestrator tick");
                }
                other => {
                    debug!(?other, "controller config action without in-process effect");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    /// Hooks run on user-initiated node override changes. They only ever
    /// write the automatic overrides layer.
    fn process_config_hooks(&mut self, node_name: &str) {
        self.process_tunnel_config_hook(node_name, None);
    }

    /// Resolve `tunnelConfig.<name>.dstNodeName` to the destination node's
    /// current IPv6 address and record it as `tunnelConfig.<name>.dstIp` in
    /// the automatic layer. `ip_override` short-circuits the status lookup
    /// when the caller already knows the fresh address.
    fn process_tunnel_config_hook(&mut self, node_name: &str, ip_override: Option<(&str, &str)>) {
        let tunnels: Vec<(String, String)> = {
            let config = self.shared.config.read();
            let Some(overrides) = config.user_node_overrides_for(node_name) else {
                return;
            };
            let Some(tunnel_config) = get_path(overrides, &["tunnelConfig"]) else {
                return;
            };
            let Some(map) = tunnel_config.as_object() else {
                return;
            };
            map.iter()
                .filter_map(|(tunnel, cfg)| {
                    cfg.get("dstNodeName")
                        .and_then(Value::as_str)
                        .map(|dst| (tunnel.clone(), dst.to_owned()))
                })
                .collect()
        };

        for (tunnel, dst_node) in tunnels {
            let dst_ip = match ip_override {
                Some((node, ip)) if node == dst_node => Some(ip.to_owned()),
                _ => self.lookup_node_ip(&dst_node),
            };
            let Some(dst_ip) = dst_ip else {
                debug!(
                    node = %node_name,
                    tunnel = %tunnel,
                    dst = %dst_node,
                    "tunnel destination has no known address yet"
                );
                continue;
            };
            let result = self.shared.config.write().set_auto_override(
                node_name,
                &["tunnelConfig", &tunnel, "dstIp"],
                Value::String(dst_ip),
            );
            if let Err(err) = result {
                warn!(node = %node_name, tunnel = %tunnel, %err, "tunnel hook failed");
            }
        }
    }

    fn lookup_node_ip(&self, node_name: &str) -> Option<String> {
        let mac = self.shared.topology.read().mac_by_name(node_name)?;
        let reports = self.shared.status_reports.read();
        let ip = &reports.get(&mac)?.report.ipv6_address;
        (!ip.is_empty()).then(|| ip.clone())
    }

    /// A node's IP changed: refresh the auto-layer `dstIp` of every tunnel
    /// across the fleet that targets it.
    fn process_update_tunnel_config(&mut self, req: UpdateTunnelConfig) {
        let owners: Vec<String> = {
            let config = self.shared.config.read();
            let doc: Value =
                serde_json::from_str(&config.node_overrides_json(&[])).unwrap_or_default();
            doc.as_object()
                .map(|map| {
                    map.iter()
                        .filter(|(_, overrides)| {
                            get_path(overrides, &["tunnelConfig"])
                                .and_then(Value::as_object)
                                .map(|tunnels| {
                                    tunnels.values().any(|cfg| {
                                        cfg.get("dstNodeName").and_then(Value::as_str)
                                            == Some(req.node_name.as_str())
                                    })
                                })
                                .unwrap_or(false)
                        })
                        .map(|(owner, _)| owner.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        if owners.is_empty() {
            return;
        }
        debug!(node = %req.node_name, owners = owners.len(), "refreshing tunnel endpoints");
        for owner in owners {
            self.process_tunnel_config_hook(&owner, Some((&req.node_name, &req.ipv6_address)));
        }
        self.record_config_sync();
    }

    // -----------------------------------------------------------------------
    // Rollout
    // -----------------------------------------------------------------------

    /// One status-sync convergence tick.
    fn sync_with_status_reports(&mut self) {
        let reports: BTreeMap<MacAddr, lattice_primitives::wire::StatusReport> = self
            .shared
            .status_reports
            .read()
            .iter()
            .map(|(mac, entry)| (*mac, entry.report.clone()))
            .collect();

        // name -> (mac, report), live nodes only.
        let mut live: BTreeMap<String, (MacAddr, &lattice_primitives::wire::StatusReport)> =
            BTreeMap::new();
        {
            let topology = self.shared.topology.read();
            for (mac, report) in &reports {
                if report.status == lattice_primitives::wire::NodeStatus::Offline {
                    continue;
                }
                if let Some(node) = topology.get_node_by_mac(*mac) {
                    live.insert(node.name.clone(), (*mac, report));
                }
            }
        }

        self.monitor_batch(&live);
        if !self.cur_batch.is_empty() {
            return; // batch still in flight
        }

        let pending = self.nodes_pending_config(&live);
        if pending.is_empty() {
            return;
        }
        debug!(pending = pending.len(), "nodes pending config");

        // Partition: at most batch_limit nodes enter the new batch, the rest
        // wait for a later tick.
        for (name, state) in pending.into_iter().take(self.opts.batch_limit.max(1)) {
            let Some((mac, _)) = live.get(&name) else {
                continue;
            };
            self.push_config(&name, *mac, &state);
            self.cur_batch.insert(name, state.hash);
        }
        self.batch_started = Some(Instant::now());
        info!(batch = self.cur_batch.len(), "config rollout batch started");
    }

    /// Nodes whose effective config hash differs from what they report, and
    /// that are managed.
    fn nodes_pending_config(
        &self,
        live: &BTreeMap<String, (MacAddr, &lattice_primitives::wire::StatusReport)>,
    ) -> Vec<(String, helper::NodeConfigState)> {
        let config = self.shared.config.read();
        let mut pending = Vec::new();
        for (name, (_mac, report)) in live {
            let state = config.build_node_config(
                name,
                &report.version,
                &report.firmware_version,
                &report.hardware_board_id,
            );
            if !state.managed {
                continue;
            }
            if state.hash != report.config_hash {
                pending.push((name.clone(), state));
            }
        }
        pending
    }

    /// Nodes leave the batch when their reported hash matches; a deadline
    /// flushes the whole batch.
    fn monitor_batch(
        &mut self,
        live: &BTreeMap<String, (MacAddr, &lattice_primitives::wire::StatusReport)>,
    ) {
        if self.cur_batch.is_empty() {
            return;
        }
        self.cur_batch.retain(|name, expected_hash| {
            match live.get(name) {
                Some((_, report)) if report.config_hash == *expected_hash => {
                    info!(node = %name, "config change confirmed");
                    false
                }
                _ => true,
            }
        });
        if self.cur_batch.is_empty() {
            self.batch_started = None;
            return;
        }
        if let Some(started) = self.batch_started {
            if started.elapsed() >= self.opts.batch_timeout {
                warn!(
                    stragglers = self.cur_batch.len(),
                    "config rollout batch timed out"
                );
                // Unconfirmed nodes simply return to the pending set on the
                // next tick.
                self.cur_batch.clear();
                self.batch_started = None;
            }
        }
    }

    /// Send either the full config or a metadata-driven actions message,
    /// depending on whether every changed key can be reapplied dynamically.
    fn push_config(&mut self, name: &str, mac: MacAddr, state: &helper::NodeConfigState) {
        let config_json = helper::canonical_json(&state.effective);
        let dynamic_actions = self.last_pushed.get(name).and_then(|prev| {
            let changed = changed_paths(prev, &state.effective);
            let config = self.shared.config.read();
            let actions = config
                .metadata()
                .actions_for(changed.iter().map(String::as_str))?;
            if actions.iter().any(|a| DISRUPTIVE_ACTIONS.contains(a)) {
                None
            } else {
                Some(actions)
            }
        });

        let sent = match dynamic_actions {
            Some(actions) => self.io.send_to_minion(
                mac,
                MinionAppId::Config,
                MessageType::MinionConfigActions,
                &MinionConfigActions {
                    config: config_json,
                    actions,
                },
            ),
            None => self.io.send_to_minion(
                mac,
                MinionAppId::Config,
                MessageType::SetMinionConfig,
                &SetMinionConfig {
                    config: config_json,
                },
            ),
        };
        if let Err(err) = sent {
            warn!(node = %name, ?err, "config push failed to enqueue");
        }
        self.last_pushed.insert(name.to_owned(), state.effective.clone());
    }

    // -----------------------------------------------------------------------
    // HA sync
    // -----------------------------------------------------------------------

    fn record_config_sync(&self) {
        let (network, node, auto) = {
            let config = self.shared.config.read();
            (
                config.network_overrides_json(),
                config.node_overrides_json(&[]),
                config.auto_node_overrides_json(&[]),
            )
        };
        self.shared.synced_app_data.write().record(HaAppData {
            network_overrides: Some(network),
            node_overrides: Some(node),
            auto_node_overrides: Some(auto),
            ..Default::default()
        });
    }

    fn record_controller_config_sync(&self) {
        let config = self.shared.controller_config.read().config_json();
        self.shared.synced_app_data.write().record(HaAppData {
            controller_config: Some(config),
            ..Default::default()
        });
    }

    fn adopt_replicated(&mut self, data: HaAppData) {
        self.shared.config.write().adopt_replicated(
            data.network_overrides.as_deref(),
            data.node_overrides.as_deref(),
            data.auto_node_overrides.as_deref(),
        );
        if let Some(controller) = &data.controller_config {
            self.shared
                .controller_config
                .write()
                .adopt_replicated(controller);
        }
    }

    fn reply<T: serde::Serialize>(&self, dest: AppId, mtype: MessageType, body: &T) {
        if let Err(err) = self.io.send_to_app(dest, mtype, body) {
            warn!(?err, "failed sending config reply");
        }
    }

    fn invalid(&self, sender: &AppId, kind: &str) {
        metrics::counter!("config_invalid_messages").increment(1);
        warn!(%sender, kind, "invalid message payload");
        self.io.send_ack(sender.clone(), false, format!("Invalid {kind}"));
    }
}
