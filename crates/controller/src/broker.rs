//! App dispatch broker.
//!
//! Routes typed envelopes between local apps, remote minions, and API
//! clients. The broker enforces sender identity (the minion id comes from
//! the transport connection, never the payload), applies transparent
//! payload compression on both directions, and drops traffic from unknown
//! minions unless the WLAN-MAC fallback applies. It holds no other state
//! and never retries a failed send.

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use lattice_primitives::codec::CodecError;
use lattice_primitives::compress::{self, DEFAULT_COMPRESSION_THRESHOLD};
use lattice_primitives::wire::{Ack, HaFsm, HaState};
use lattice_primitives::{AppId, Envelope, MacAddr, MessageType, MinionAppId};

use crate::shared::SharedState;

/// Inbox capacity per app. Apps are expected to drain quickly; a full inbox
/// surfaces as a failed send at the producer.
pub const APP_INBOX_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("failed encoding message body")]
    Encode(#[from] CodecError),
    #[error("broker queue full or closed")]
    Transport,
}

/// A message delivered to an app's inbox.
#[derive(Clone, Debug)]
pub struct Inbound {
    /// Set when the message originated from a minion.
    pub minion: Option<MacAddr>,
    pub sender: AppId,
    pub envelope: Envelope,
}

/// A message handed to the broker for routing.
#[derive(Clone, Debug)]
pub enum Outbound {
    ToApp {
        dest: AppId,
        sender: AppId,
        envelope: Envelope,
    },
    ToMinion {
        mac: MacAddr,
        recv_app: MinionAppId,
        sender: AppId,
        envelope: Envelope,
    },
}

/// Every app holds one of these: its inbox plus a sender into the broker.
/// This replaces inheritance from a common app base with composition.
pub struct MessageIo {
    app: AppId,
    inbox: mpsc::Receiver<Inbound>,
    to_broker: mpsc::Sender<Outbound>,
}

impl MessageIo {
    pub fn app(&self) -> &AppId {
        &self.app
    }

    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbox.recv().await
    }

    /// Send a typed body to a local app. Returns immediately; no delivery
    /// guarantee beyond the broker queue.
    pub fn send_to_app<T: serde::Serialize>(
        &self,
        dest: AppId,
        mtype: MessageType,
        body: &T,
    ) -> Result<(), SendError> {
        let mut envelope = Envelope::new(mtype, body)?;
        if compress::compress_if_large(&mut envelope, DEFAULT_COMPRESSION_THRESHOLD).is_err() {
            return Err(SendError::Transport);
        }
        self.to_broker
            .try_send(Outbound::ToApp {
                dest,
                sender: self.app.clone(),
                envelope,
            })
            .map_err(|_| SendError::Transport)
    }

    /// Send a typed body to a logical sub-app within a minion.
    pub fn send_to_minion<T: serde::Serialize>(
        &self,
        mac: MacAddr,
        recv_app: MinionAppId,
        mtype: MessageType,
        body: &T,
    ) -> Result<(), SendError> {
        let mut envelope = Envelope::new(mtype, body)?;
        if compress::compress_if_large(&mut envelope, DEFAULT_COMPRESSION_THRESHOLD).is_err() {
            return Err(SendError::Transport);
        }
        self.to_broker
            .try_send(Outbound::ToMinion {
                mac,
                recv_app,
                sender: self.app.clone(),
                envelope,
            })
            .map_err(|_| SendError::Transport)
    }

    /// Reply with a generic success/failure record.
    pub fn send_ack(&self, dest: AppId, success: bool, message: impl Into<String>) {
        let ack = Ack {
            success,
            message: message.into(),
        };
        if let Err(err) = self.send_to_app(dest.clone(), MessageType::Ack, &ack) {
            warn!(%dest, ?err, "failed sending ack");
        }
    }
}

/// Frame arriving from the minion transport: connection identity plus the
/// destination app and claimed minion sub-app.
pub type MinionIngress = (MacAddr, AppId, MinionAppId, Envelope);
/// Frame arriving from the API transport: client id plus destination app.
pub type ApiIngress = (String, AppId, Envelope);

#[cfg(test)]
pub(crate) fn test_endpoint(app: AppId) -> (MessageIo, mpsc::Receiver<Outbound>) {
    let (to_broker, from_app) = mpsc::channel(APP_INBOX_CAPACITY);
    let (_tx, inbox) = mpsc::channel(APP_INBOX_CAPACITY);
    (
        MessageIo {
            app,
            inbox,
            to_broker,
        },
        from_app,
    )
}

/// Builder collecting app registrations before the broker task starts.
pub struct BrokerBuilder {
    to_broker: mpsc::Sender<Outbound>,
    from_apps: mpsc::Receiver<Outbound>,
    minion_ingress_tx: mpsc::Sender<MinionIngress>,
    minion_ingress_rx: mpsc::Receiver<MinionIngress>,
    api_ingress_tx: mpsc::Sender<ApiIngress>,
    api_ingress_rx: mpsc::Receiver<ApiIngress>,
    apps: HashMap<AppId, mpsc::Sender<Inbound>>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerBuilder {
    pub fn new() -> Self {
        let (to_broker, from_apps) = mpsc::channel(APP_INBOX_CAPACITY * 4);
        let (minion_ingress_tx, minion_ingress_rx) = mpsc::channel(APP_INBOX_CAPACITY);
        let (api_ingress_tx, api_ingress_rx) = mpsc::channel(APP_INBOX_CAPACITY);
        Self {
            to_broker,
            from_apps,
            minion_ingress_tx,
            minion_ingress_rx,
            api_ingress_tx,
            api_ingress_rx,
            apps: HashMap::new(),
        }
    }

    /// Register a local app endpoint; returns the endpoint the app keeps.
    pub fn register(&mut self, app: AppId) -> MessageIo {
        let (tx, inbox) = mpsc::channel(APP_INBOX_CAPACITY);
        self.apps.insert(app.clone(), tx);
        MessageIo {
            app,
            inbox,
            to_broker: self.to_broker.clone(),
        }
    }

    /// Sender the minion transport uses to inject inbound frames.
    pub fn minion_ingress(&self) -> mpsc::Sender<MinionIngress> {
        self.minion_ingress_tx.clone()
    }

    /// Sender the API transport uses to inject inbound frames.
    pub fn api_ingress(&self) -> mpsc::Sender<ApiIngress> {
        self.api_ingress_tx.clone()
    }

    pub fn build(
        self,
        shared: SharedState,
        minion_tx: mpsc::Sender<(MacAddr, MinionAppId, AppId, Envelope)>,
        api_tx: mpsc::Sender<(String, AppId, Envelope)>,
    ) -> Broker {
        Broker {
            from_apps: self.from_apps,
            minion_ingress: self.minion_ingress_rx,
            api_ingress: self.api_ingress_rx,
            apps: self.apps,
            shared,
            minion_tx,
            api_tx,
            ha_state: HaState::Start,
            ha_enabled: false,
        }
    }
}

/// The broker task. Owns the routing table; runs until shutdown.
pub struct Broker {
    from_apps: mpsc::Receiver<Outbound>,
    minion_ingress: mpsc::Receiver<MinionIngress>,
    api_ingress: mpsc::Receiver<ApiIngress>,
    apps: HashMap<AppId, mpsc::Sender<Inbound>>,
    shared: SharedState,
    /// Outbound minion frames, consumed by the minion transport.
    minion_tx: mpsc::Sender<(MacAddr, MinionAppId, AppId, Envelope)>,
    /// Outbound API replies, consumed by the API transport.
    api_tx: mpsc::Sender<(String, AppId, Envelope)>,
    ha_state: HaState,
    ha_enabled: bool,
}

impl Broker {
    pub fn set_ha_enabled(&mut self, enabled: bool) {
        self.ha_enabled = enabled;
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                outbound = self.from_apps.recv() => {
                    match outbound {
                        Some(msg) => self.route(msg).await,
                        None => return,
                    }
                }
                ingress = self.minion_ingress.recv() => {
                    if let Some((mac, dest, sender_app, envelope)) = ingress {
                        self.deliver_from_minion(mac, dest, sender_app, envelope).await;
                    }
                }
                ingress = self.api_ingress.recv() => {
                    if let Some((client_id, dest, envelope)) = ingress {
                        self.deliver_from_api(client_id, dest, envelope).await;
                    }
                }
            }
        }
    }

    async fn route(&mut self, outbound: Outbound) {
        match outbound {
            Outbound::ToApp {
                dest,
                sender,
                envelope,
            } => self.deliver_local(None, dest, sender, envelope).await,
            Outbound::ToMinion {
                mac,
                recv_app,
                sender,
                envelope,
            } => {
                if self.minion_tx.send((mac, recv_app, sender, envelope)).await.is_err() {
                    metrics::counter!("broker_minion_send_failures").increment(1);
                    debug!(%mac, "minion transport unavailable");
                }
            }
        }
    }

    /// Inbound from the minion transport. `mac` is the connection identity.
    pub async fn deliver_from_minion(
        &mut self,
        mac: MacAddr,
        dest: AppId,
        sender_app: MinionAppId,
        envelope: Envelope,
    ) {
        // HA FSM updates from the replicator gate minion traffic while this
        // controller is not the active one.
        if self.ha_enabled && self.ha_state == HaState::Passive {
            debug!(%mac, "dropping minion message while PASSIVE");
            return;
        }

        if !self.is_known_minion(mac) {
            metrics::counter!("broker_unknown_minion_drops").increment(1);
            warn!(
                %mac,
                category = "broker",
                event = "unknown_minion",
                "dropping message from unknown minion"
            );
            return;
        }

        // sender_app only disambiguates logging on this side; local dispatch
        // is by destination app id.
        let sender = AppId::Api(format!("minion:{sender_app:?}"));
        self.deliver_local(Some(mac), dest, sender, envelope).await;
    }

    /// Inbound from the API transport, addressed by ad-hoc client id.
    pub async fn deliver_from_api(&mut self, client_id: String, dest: AppId, envelope: Envelope) {
        self.deliver_local(None, dest, AppId::Api(client_id), envelope)
            .await;
    }

    /// Observe the replicator's FSM so PASSIVE controllers stop serving.
    pub fn observe_ha_fsm(&mut self, fsm: &HaFsm) {
        self.ha_state = fsm.state;
    }

    async fn deliver_local(
        &mut self,
        minion: Option<MacAddr>,
        dest: AppId,
        sender: AppId,
        mut envelope: Envelope,
    ) {
        // Broker itself only consumes HA FSM snapshots.
        if dest == AppId::Broker {
            if envelope.mtype == MessageType::HaFsm {
                match envelope.read::<HaFsm>() {
                    Ok(fsm) => self.observe_ha_fsm(&fsm),
                    Err(err) => warn!(?err, "malformed HA FSM update"),
                }
            }
            return;
        }

        if compress::decompress(&mut envelope).is_err() {
            metrics::counter!("broker_decompress_failures").increment(1);
            error!(?minion, %dest, "dropping undecompressable message");
            return;
        }

        if let AppId::Api(client_id) = &dest {
            if self
                .api_tx
                .send((client_id.clone(), sender, envelope))
                .await
                .is_err()
            {
                debug!(client = %client_id, "api transport unavailable");
            }
            return;
        }

        match self.apps.get(&dest) {
            Some(tx) => {
                if tx
                    .send(Inbound {
                        minion,
                        sender,
                        envelope,
                    })
                    .await
                    .is_err()
                {
                    warn!(%dest, "app inbox closed");
                }
            }
            None => {
                metrics::counter!("broker_unroutable_messages").increment(1);
                warn!(%dest, "no such app registered");
            }
        }
    }

    /// Known = primary MAC in topology, or a radio MAC of a node whose
    /// primary MAC is still empty (the WLAN-MAC fallback: the status app
    /// will ask topology to adopt the new primary MAC).
    fn is_known_minion(&self, mac: MacAddr) -> bool {
        let topology = self.shared.topology.read();
        match topology.get_node_by_mac(mac) {
            Some(node) => node.mac_addr == Some(mac) || node.mac_addr.is_none(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedState;
    use lattice_primitives::wire::{IsAlive, NodeStatus, NodeType};
    use lattice_topology::Node;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([2, 0, 0, 0, 0, last])
    }

    fn shared_with_node(primary: Option<MacAddr>, radios: Vec<MacAddr>) -> SharedState {
        let shared = SharedState::new_for_test();
        shared
            .topology
            .write()
            .add_node(Node {
                name: "n1".into(),
                mac_addr: primary,
                wlan_mac_addrs: radios,
                node_type: NodeType::Dn,
                pop_node: false,
                status: NodeStatus::Offline,
            })
            .unwrap();
        shared
    }

    fn test_broker(shared: SharedState) -> (MessageIo, Broker) {
        let mut builder = BrokerBuilder::new();
        let status_io = builder.register(AppId::Status);
        let (minion_tx, _minion_rx) = mpsc::channel(16);
        let (api_tx, _api_rx) = mpsc::channel(16);
        let broker = builder.build(shared, minion_tx, api_tx);
        // Channel receivers for the transports are dropped; these tests only
        // exercise local delivery.
        (status_io, broker)
    }

    #[tokio::test]
    async fn known_minion_message_reaches_app() {
        let shared = shared_with_node(Some(mac(1)), vec![]);
        let (mut status_io, mut broker) = test_broker(shared);
        let env = Envelope::new(MessageType::IsAlive, &IsAlive {}).unwrap();
        broker
            .deliver_from_minion(mac(1), AppId::Status, MinionAppId::Status, env)
            .await;
        let inbound = status_io.recv().await.unwrap();
        assert_eq!(inbound.minion, Some(mac(1)));
        assert_eq!(inbound.envelope.mtype, MessageType::IsAlive);
    }

    #[tokio::test]
    async fn unknown_minion_is_dropped() {
        let shared = shared_with_node(Some(mac(1)), vec![]);
        let (mut status_io, mut broker) = test_broker(shared);
        let env = Envelope::new(MessageType::IsAlive, &IsAlive {}).unwrap();
        broker
            .deliver_from_minion(mac(99), AppId::Status, MinionAppId::Status, env.clone())
            .await;
        // deliver a known one afterwards; it must be the first thing queued
        broker
            .deliver_from_minion(mac(1), AppId::Status, MinionAppId::Status, env)
            .await;
        let inbound = status_io.recv().await.unwrap();
        assert_eq!(inbound.minion, Some(mac(1)));
    }

    #[test]
    fn radio_mac_fallback_requires_empty_primary() {
        let with_primary = shared_with_node(Some(mac(1)), vec![mac(10)]);
        let (_io, broker) = test_broker(with_primary);
        // radio MAC of a node that already has a primary: not a valid sender
        assert!(!broker.is_known_minion(mac(10)));
        assert!(broker.is_known_minion(mac(1)));

        let no_primary = shared_with_node(None, vec![mac(10)]);
        let (_io2, broker2) = test_broker(no_primary);
        assert!(broker2.is_known_minion(mac(10)));
    }

    #[tokio::test]
    async fn passive_controller_drops_minion_traffic() {
        let shared = shared_with_node(Some(mac(1)), vec![]);
        let (mut status_io, mut broker) = test_broker(shared);
        broker.set_ha_enabled(true);
        broker.observe_ha_fsm(&HaFsm {
            state: HaState::Passive,
            peer_expiry_ms: 0,
        });
        let env = Envelope::new(MessageType::IsAlive, &IsAlive {}).unwrap();
        broker
            .deliver_from_minion(mac(1), AppId::Status, MinionAppId::Status, env.clone())
            .await;
        broker.observe_ha_fsm(&HaFsm {
            state: HaState::Active,
            peer_expiry_ms: 0,
        });
        broker
            .deliver_from_minion(mac(1), AppId::Status, MinionAppId::Status, env)
            .await;
        // only the post-ACTIVE message arrives
        let inbound = status_io.recv().await.unwrap();
        assert_eq!(inbound.envelope.mtype, MessageType::IsAlive);
        assert!(status_io.inbox.try_recv().is_err());
    }
}
