//! High-availability replication ("binary star").
//!
//! Two controllers, one configured PRIMARY and one BACKUP, exchange
//! heartbeats on a dedicated publish channel. Exactly one is ACTIVE in
//! steady state; the ACTIVE side piggybacks application data (topology,
//! config documents) on its heartbeats so the PASSIVE side can take over
//! with warm state. Replication is best-effort: a missed delta is repaired
//! by a full snapshot as soon as the sequence numbers disagree.

pub mod fsm;

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use lattice_primitives::compress;
use lattice_primitives::wire::{
    HaAppData, HaFsm, HaGetAppData, HaGetState, HaHeartbeat, HaState, HaSwitchController,
};
use lattice_primitives::{AppId, Envelope, MessageType, MinionAppId};

use crate::broker::{Inbound, MessageIo};
use crate::settings::HaOptions;
use crate::shared::SharedState;
use fsm::{FsmEvent, process_event};

/// Handle for publishing heartbeats to the peer. The transport side drains
/// the channel and fans frames out to connected subscribers.
#[derive(Clone)]
pub struct PeerPublisher {
    tx: mpsc::Sender<Envelope>,
}

impl PeerPublisher {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    /// Best-effort send; a full queue counts as a failed heartbeat.
    pub fn publish(&self, mut envelope: Envelope) -> bool {
        if compress::compress_if_large(&mut envelope, compress::DEFAULT_COMPRESSION_THRESHOLD)
            .is_err()
        {
            return false;
        }
        self.tx.try_send(envelope).is_ok()
    }
}

pub struct HaApp {
    io: MessageIo,
    shared: SharedState,
    opts: HaOptions,
    publisher: PeerPublisher,
    /// Heartbeats received from the peer's publish channel.
    peer_rx: mpsc::Receiver<Envelope>,

    fsm: HaFsm,
    version: String,
    seq_num: u64,
    send_full_data: bool,
    last_heartbeat_at: Option<Instant>,
    auto_recovery_heartbeats: u32,
}

impl HaApp {
    pub fn new(
        io: MessageIo,
        shared: SharedState,
        opts: HaOptions,
        publisher: PeerPublisher,
        peer_rx: mpsc::Receiver<Envelope>,
    ) -> Self {
        let version = std::fs::read_to_string(&opts.version_file)
            .map(|v| v.trim().to_owned())
            .unwrap_or_default();
        let state = if !opts.enabled {
            HaState::Start
        } else if opts.is_primary {
            info!(category = "ha", "running as PRIMARY controller");
            HaState::Primary
        } else {
            info!(category = "ha", "running as BACKUP controller");
            HaState::Backup
        };
        Self {
            io,
            shared,
            opts,
            publisher,
            peer_rx,
            fsm: HaFsm {
                state,
                peer_expiry_ms: 0,
            },
            version,
            seq_num: 0,
            send_full_data: false,
            last_heartbeat_at: None,
            auto_recovery_heartbeats: 0,
        }
    }

    pub fn state(&self) -> HaState {
        self.fsm.state
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if !self.opts.enabled {
            // Keep answering state queries so API clients get a consistent
            // (uninitialized) answer.
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

        let mut heartbeat_tick = tokio::time::interval(self.opts.heartbeat_interval);
        heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = heartbeat_tick.tick() => {
                    self.check_peer_expiry();
                    self.send_heartbeat();
                }
                envelope = self.peer_rx.recv() => {
                    match envelope {
                        Some(envelope) => self.process_peer_envelope(envelope),
                        None => return,
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
            MessageType::HaGetState => {
                if inbound.envelope.read::<HaGetState>().is_err() {
                    return self.invalid(&sender, "HaGetState");
                }
                if let Err(err) = self.io.send_to_app(sender, MessageType::HaFsm, &self.fsm) {
                    warn!(?err, "failed sending HA state");
                }
            }
            other => {
                warn!(?other, %sender, "wrong type of message for HA app");
            }
        }
    }

    fn process_peer_envelope(&mut self, mut envelope: Envelope) {
        if compress::decompress(&mut envelope).is_err() {
            // Equivalent to not receiving the heartbeat at all.
            warn!("dropping undecompressable peer message");
            return;
        }
        match envelope.mtype {
            MessageType::HaSync => match envelope.read::<HaHeartbeat>() {
                Ok(heartbeat) => self.process_heartbeat(heartbeat),
                Err(err) => warn!(?err, "malformed peer heartbeat"),
            },
            other => {
                error!(?other, "wrong type of message received from peer");
            }
        }
    }

    pub(crate) fn process_heartbeat(&mut self, heartbeat: HaHeartbeat) {
        debug!(
            peer_state = %heartbeat.state,
            seq_num = heartbeat.seq_num,
            "received heartbeat from peer"
        );

        if heartbeat.version != self.version {
            warn!(
                category = "ha",
                event = "peer_version_mismatch",
                local_version = %self.version,
                peer_version = %heartbeat.version,
                "controller version mismatch"
            );
        }

        let now_ms = unix_now_ms();
        let prev_state = self.fsm.state;
        let prev_heartbeat_at = self.last_heartbeat_at;
        let peer_timeout = self.peer_timeout();
        self.last_heartbeat_at = Some(Instant::now());

        let Some(event) = FsmEvent::from_peer_state(heartbeat.state) else {
            return;
        };
        let next = match process_event(self.fsm, event, now_ms) {
            Ok(next) => next,
            Err(err) => {
                // Fatal misconfiguration: revert to the configured role and
                // hope the operator resolves the split.
                error!(
                    category = "ha",
                    event = "fatal_state",
                    local_state = %prev_state,
                    peer_state = %heartbeat.state,
                    %err,
                    "HA invariant violated"
                );
                self.fsm.state = if self.opts.is_primary {
                    HaState::Primary
                } else {
                    HaState::Backup
                };
                error!(category = "ha", state = %self.fsm.state, "reverted to configured role");
                self.publish_fsm();
                return;
            }
        };

        self.fsm = next;
        self.fsm.peer_expiry_ms = now_ms + peer_timeout.as_millis() as i64;
        if self.fsm.state != prev_state {
            self.log_state_change(prev_state, self.fsm.state);
        }

        // PASSIVE: track the peer's sequence number and adopt its app data.
        if self.fsm.state == HaState::Passive && heartbeat.state == HaState::Active {
            if prev_state != HaState::Passive {
                // Freshly passive: the sequence mismatch on our next echo
                // triggers a full sync, nothing to adopt yet.
            } else {
                self.seq_num = heartbeat.seq_num;
                if heartbeat.version == self.version {
                    self.forward_app_data(heartbeat.data);
                } else {
                    debug!("version skew, not applying replicated app data");
                }
            }
        }

        // ACTIVE: detect sequence loss and handle automatic recovery.
        if self.fsm.state == HaState::Active {
            if prev_state != HaState::Active {
                self.on_become_active();
            } else {
                if heartbeat.seq_num != self.seq_num {
                    debug!(
                        saw = heartbeat.seq_num,
                        expected = self.seq_num,
                        "unexpected sequence number from peer, queueing full data sync"
                    );
                    self.send_full_data = true;
                }
                if !self.opts.is_primary && self.opts.auto_recovery_heartbeats > 0 {
                    let peer_died_in_between = prev_heartbeat_at
                        .map(|at| at.elapsed() > peer_timeout)
                        .unwrap_or(true);
                    if peer_died_in_between {
                        self.auto_recovery_heartbeats = 0;
                    }
                    self.auto_recovery_heartbeats += 1;
                    debug!(
                        count = self.auto_recovery_heartbeats,
                        threshold = self.opts.auto_recovery_heartbeats,
                        "recorded successive heartbeat from recovered primary"
                    );
                    if self.auto_recovery_heartbeats >= self.opts.auto_recovery_heartbeats {
                        self.yield_to_primary();
                    }
                }
            }
        }

        self.publish_fsm();
    }

    /// Peer-expiry failover, evaluated on the heartbeat tick (the local
    /// client-request event).
    fn check_peer_expiry(&mut self) {
        let prev_state = self.fsm.state;
        match process_event(self.fsm, FsmEvent::ClientRequest, unix_now_ms()) {
            Ok(next) => {
                self.fsm = next;
                if self.fsm.state != prev_state {
                    self.log_state_change(prev_state, self.fsm.state);
                    if self.fsm.state == HaState::Active {
                        self.on_become_active();
                    }
                    self.publish_fsm();
                }
            }
            Err(fsm::FsmError::NotInitialized) => {}
            Err(err) => error!(%err, "unexpected FSM error on tick"),
        }
    }

    pub(crate) fn send_heartbeat(&mut self) {
        let mut heartbeat = HaHeartbeat {
            state: self.fsm.state,
            version: self.version.clone(),
            seq_num: self.seq_num,
            data: HaAppData::default(),
        };

        if self.fsm.state == HaState::Active {
            let synced_lock = std::sync::Arc::clone(&self.shared.synced_app_data);
            let mut synced = synced_lock.write();
            if !self.send_full_data && synced.pending.is_empty() {
                // Nothing new: sequence number carries over unchanged.
            } else {
                self.seq_num += 1;
                heartbeat.seq_num = self.seq_num;
                heartbeat.data = if self.send_full_data {
                    synced.full.clone()
                } else {
                    std::mem::take(&mut synced.pending)
                };
            }
            synced.pending = HaAppData::default();
            drop(synced);
            self.send_full_data = false;
        }

        debug!(state = %heartbeat.state, seq_num = heartbeat.seq_num, "sending heartbeat to peer");
        match Envelope::new(MessageType::HaSync, &heartbeat) {
            Ok(envelope) => {
                if !self.publisher.publish(envelope) {
                    // Replication state was already advanced; the peer will
                    // flag the gap by echoing a stale sequence number and we
                    // answer with a full snapshot.
                    warn!("failed publishing heartbeat");
                }
            }
            Err(err) => warn!(?err, "failed encoding heartbeat"),
        }
    }

    /// Entering ACTIVE: reset replication and ask every data-owning app to
    /// repopulate the snapshot so the next heartbeat carries a baseline.
    fn on_become_active(&mut self) {
        self.clear();
        for app in [AppId::Topology, AppId::Config] {
            if let Err(err) = self.io.send_to_app(app, MessageType::HaGetAppData, &HaGetAppData {})
            {
                warn!(?err, "failed requesting app data");
            }
        }
    }

    /// The recovered primary has proven itself alive: the backup yields,
    /// announces immediately, and points every minion at the peer.
    fn yield_to_primary(&mut self) {
        info!(
            category = "ha",
            event = "state_change",
            "primary has recovered, changing to BACKUP"
        );
        self.clear();
        self.fsm.state = HaState::Backup;
        self.send_heartbeat();
        self.publish_fsm();

        // Minions only hold one controller connection; every reachable node
        // is connected to us, so tell them all to switch.
        let macs: Vec<_> = self
            .shared
            .topology
            .read()
            .all_nodes()
            .filter_map(|n| n.mac_addr)
            .collect();
        for mac in macs {
            let _ = self.io.send_to_minion(
                mac,
                MinionAppId::Broker,
                MessageType::HaSwitchController,
                &HaSwitchController {},
            );
        }
    }

    fn clear(&mut self) {
        self.seq_num = 0;
        self.send_full_data = false;
        self.last_heartbeat_at = None;
        self.auto_recovery_heartbeats = 0;
        self.shared.synced_app_data.write().clear();
    }

    /// Replicated app data fans out to its owning apps.
    fn forward_app_data(&self, data: HaAppData) {
        if data.is_empty() {
            return;
        }
        if data.topology.is_some() {
            let topo_part = HaAppData {
                topology: data.topology.clone(),
                ..Default::default()
            };
            let _ = self
                .io
                .send_to_app(AppId::Topology, MessageType::HaAppData, &topo_part);
        }
        if data.network_overrides.is_some()
            || data.node_overrides.is_some()
            || data.auto_node_overrides.is_some()
            || data.controller_config.is_some()
        {
            let config_part = HaAppData {
                topology: None,
                ..data
            };
            let _ = self
                .io
                .send_to_app(AppId::Config, MessageType::HaAppData, &config_part);
        }
    }

    fn peer_timeout(&self) -> Duration {
        self.opts.heartbeat_interval * self.opts.missed_heartbeats_threshold
    }

    /// Keep the broker's serving gate in sync with the FSM.
    fn publish_fsm(&self) {
        let _ = self
            .io
            .send_to_app(AppId::Broker, MessageType::HaFsm, &self.fsm);
    }

    fn log_state_change(&self, old: HaState, new: HaState) {
        info!(
            category = "ha",
            event = "state_change",
            old_state = %old,
            new_state = %new,
            "state changed"
        );
    }

    fn invalid(&self, sender: &AppId, kind: &str) {
        warn!(%sender, kind, "invalid message payload");
        self.io.send_ack(sender.clone(), false, format!("Invalid {kind}"));
    }
}

fn unix_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Outbound, test_endpoint};
    use tokio::sync::mpsc;

    struct Fixture {
        app: HaApp,
        outbox: mpsc::Receiver<Outbound>,
        published: mpsc::Receiver<Envelope>,
    }

    fn fixture(is_primary: bool, auto_recovery: u32) -> Fixture {
        let shared = SharedState::new_for_test();
        let (io, outbox) = test_endpoint(AppId::HighAvailability);
        let (pub_tx, published) = mpsc::channel(64);
        let (_peer_tx, peer_rx) = mpsc::channel(64);
        let opts = HaOptions {
            enabled: true,
            is_primary,
            heartbeat_interval: Duration::from_millis(100),
            missed_heartbeats_threshold: 3,
            auto_recovery_heartbeats: auto_recovery,
            version_file: "/nonexistent".into(),
            ..Default::default()
        };
        let app = HaApp::new(io, shared, opts, PeerPublisher::new(pub_tx), peer_rx);
        Fixture {
            app,
            outbox,
            published,
        }
    }

    fn heartbeat(state: HaState, seq_num: u64) -> HaHeartbeat {
        HaHeartbeat {
            state,
            version: String::new(),
            seq_num,
            data: HaAppData::default(),
        }
    }

    fn last_published(fx: &mut Fixture) -> Option<HaHeartbeat> {
        let mut last = None;
        while let Ok(mut env) = fx.published.try_recv() {
            compress::decompress(&mut env).unwrap();
            last = Some(env.read().unwrap());
        }
        last
    }

    fn drain_outbox(fx: &mut Fixture) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = fx.outbox.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn primary_activates_on_backup_peer() {
        let mut fx = fixture(true, 0);
        fx.app.process_heartbeat(heartbeat(HaState::Backup, 0));
        assert_eq!(fx.app.state(), HaState::Active);
        // becoming active requests app data from topology and config
        let requests: Vec<_> = drain_outbox(&mut fx)
            .into_iter()
            .filter(|o| matches!(o, Outbound::ToApp { envelope, .. } if envelope.mtype == MessageType::HaGetAppData))
            .collect();
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn backup_goes_passive_on_active_peer() {
        let mut fx = fixture(false, 0);
        fx.app.process_heartbeat(heartbeat(HaState::Active, 0));
        assert_eq!(fx.app.state(), HaState::Passive);
    }

    #[test]
    fn dual_active_reverts_to_configured_role() {
        let mut fx = fixture(false, 0);
        fx.app.process_heartbeat(heartbeat(HaState::Active, 0));
        assert_eq!(fx.app.state(), HaState::Passive);
        // force ourselves active, then observe an active peer
        fx.app.fsm.state = HaState::Active;
        fx.app.process_heartbeat(heartbeat(HaState::Active, 1));
        assert_eq!(fx.app.state(), HaState::Backup);
    }

    #[test]
    fn heartbeat_sequence_only_advances_with_data() {
        let mut fx = fixture(true, 0);
        fx.app.process_heartbeat(heartbeat(HaState::Backup, 0));
        let _ = drain_outbox(&mut fx);

        // nothing pending: seq stays 0
        fx.app.send_heartbeat();
        let hb = last_published(&mut fx).unwrap();
        assert_eq!(hb.seq_num, 0);
        assert!(hb.data.is_empty());

        // record a change: seq bumps and the delta rides along
        fx.app.shared.synced_app_data.write().record(HaAppData {
            network_overrides: Some("{}".into()),
            ..Default::default()
        });
        fx.app.send_heartbeat();
        let hb = last_published(&mut fx).unwrap();
        assert_eq!(hb.seq_num, 1);
        assert_eq!(hb.data.network_overrides.as_deref(), Some("{}"));

        // drained: next heartbeat is empty again at the same seq
        fx.app.send_heartbeat();
        let hb = last_published(&mut fx).unwrap();
        assert_eq!(hb.seq_num, 1);
        assert!(hb.data.is_empty());
    }

    #[test]
    fn sequence_mismatch_triggers_full_snapshot() {
        let mut fx = fixture(true, 0);
        fx.app.process_heartbeat(heartbeat(HaState::Backup, 0));
        fx.app.shared.synced_app_data.write().record(HaAppData {
            network_overrides: Some("{\"full\":true}".into()),
            ..Default::default()
        });
        fx.app.send_heartbeat(); // seq 1, pending drained
        let _ = last_published(&mut fx);

        // the peer echoes a stale sequence number
        fx.app.process_heartbeat(heartbeat(HaState::Passive, 0));
        assert!(fx.app.send_full_data);

        fx.app.send_heartbeat();
        let hb = last_published(&mut fx).unwrap();
        assert_eq!(hb.seq_num, 2);
        // the full snapshot still holds the earlier change
        assert_eq!(hb.data.network_overrides.as_deref(), Some("{\"full\":true}"));
    }

    #[test]
    fn passive_adopts_replicated_data() {
        let mut fx = fixture(false, 0);
        // settle as passive first
        fx.app.process_heartbeat(heartbeat(HaState::Active, 3));
        let _ = drain_outbox(&mut fx);

        let mut hb = heartbeat(HaState::Active, 4);
        hb.data.network_overrides = Some("{\"x\":1}".into());
        fx.app.process_heartbeat(hb);
        assert_eq!(fx.app.seq_num, 4);

        let forwarded: Vec<_> = drain_outbox(&mut fx)
            .into_iter()
            .filter(|o| matches!(o, Outbound::ToApp { dest, envelope, .. }
                if *dest == AppId::Config && envelope.mtype == MessageType::HaAppData))
            .collect();
        assert_eq!(forwarded.len(), 1);
    }

    #[test]
    fn version_skew_blocks_data_application() {
        let mut fx = fixture(false, 0);
        fx.app.version = "RELEASE_M46".into();
        let mut hb = heartbeat(HaState::Active, 1);
        hb.version = "RELEASE_M45".into();
        fx.app.process_heartbeat(hb.clone());
        assert_eq!(fx.app.state(), HaState::Passive);
        let _ = drain_outbox(&mut fx);

        hb.seq_num = 2;
        hb.data.network_overrides = Some("{}".into());
        fx.app.process_heartbeat(hb);
        // FSM converged but nothing was forwarded to the config app
        let forwarded: Vec<_> = drain_outbox(&mut fx)
            .into_iter()
            .filter(|o| matches!(o, Outbound::ToApp { envelope, .. } if envelope.mtype == MessageType::HaAppData))
            .collect();
        assert!(forwarded.is_empty());
    }

    #[test]
    fn auto_recovery_yields_after_threshold() {
        let mut fx = fixture(false, 3);
        // backup became active (e.g. after primary death)
        fx.app.fsm.state = HaState::Active;
        fx.app.fsm.peer_expiry_ms = 0;

        // primary comes back passive and heartbeats three times
        fx.app.process_heartbeat(heartbeat(HaState::Passive, 0));
        assert_eq!(fx.app.state(), HaState::Active);
        fx.app.process_heartbeat(heartbeat(HaState::Passive, 0));
        assert_eq!(fx.app.state(), HaState::Active);
        fx.app.process_heartbeat(heartbeat(HaState::Passive, 0));
        assert_eq!(fx.app.state(), HaState::Backup);

        // yield announced immediately
        let hb = last_published(&mut fx).unwrap();
        assert_eq!(hb.state, HaState::Backup);
    }

    #[test]
    fn passive_fails_over_after_peer_expiry() {
        let mut fx = fixture(false, 0);
        fx.app.process_heartbeat(heartbeat(HaState::Active, 7));
        assert_eq!(fx.app.state(), HaState::Passive);
        let _ = drain_outbox(&mut fx);

        // force the expiry into the past, as if three intervals elapsed
        fx.app.fsm.peer_expiry_ms = unix_now_ms() - 1;
        fx.app.check_peer_expiry();
        assert_eq!(fx.app.state(), HaState::Active);
        // replication restarts from zero with a fresh baseline request
        assert_eq!(fx.app.seq_num, 0);
        let requests: Vec<_> = drain_outbox(&mut fx)
            .into_iter()
            .filter(|o| matches!(o, Outbound::ToApp { envelope, .. } if envelope.mtype == MessageType::HaGetAppData))
            .collect();
        assert_eq!(requests.len(), 2);

        // with data repopulated, the next heartbeat carries sequence 1
        fx.app.shared.synced_app_data.write().record(HaAppData {
            node_overrides: Some("{}".into()),
            ..Default::default()
        });
        fx.app.send_heartbeat();
        let hb = last_published(&mut fx).unwrap();
        assert_eq!(hb.seq_num, 1);
        assert!(!hb.data.is_empty());
    }

    #[test]
    fn malformed_peer_payload_is_ignored() {
        let mut fx = fixture(true, 0);
        let envelope = Envelope {
            mtype: MessageType::HaSync,
            value: vec![0xde, 0xad],
            compressed: false,
            compression_format: None,
        };
        fx.app.process_peer_envelope(envelope);
        assert_eq!(fx.app.state(), HaState::Primary);
    }
}
