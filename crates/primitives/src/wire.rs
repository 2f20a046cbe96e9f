//! The typed message envelope and every body exchanged through the broker.
//!
//! Every message on every channel (minion, peer controller, local API) is an
//! [`Envelope`]: a message type tag plus an opaque binary body, optionally
//! compressed in transit. Bodies are plain serde structs encoded with the
//! compact binary codec in [`crate::codec`]; receivers decode with
//! [`Envelope::read`], which fails softly so one malformed payload never
//! takes an app down.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::codec::{self, CodecError};
use crate::mac::MacAddr;

/// Local app endpoints inside a controller process.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppId {
    Broker,
    Status,
    Config,
    Upgrade,
    Topology,
    HighAvailability,
    /// An ad-hoc API client; the broker echoes the id back on replies.
    Api(String),
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Broker => f.write_str("broker"),
            Self::Status => f.write_str("status"),
            Self::Config => f.write_str("config"),
            Self::Upgrade => f.write_str("upgrade"),
            Self::Topology => f.write_str("topology"),
            Self::HighAvailability => f.write_str("ha"),
            Self::Api(id) => write!(f, "api:{id}"),
        }
    }
}

/// Logical sub-apps inside a minion, used to address minion-bound traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MinionAppId {
    Broker,
    Status,
    Config,
    Upgrade,
    Ignition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionFormat {
    Gzip,
}

/// Wire message kinds. One variant per body type; dispatch is an exhaustive
/// match in each app.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Common
    Ack,
    // Status app
    StatusReport,
    StatusReportAck,
    GetStatusDump,
    StatusDump,
    RebootRequest,
    RebootNode,
    RestartMinionRequest,
    RestartMinion,
    GetGpsTime,
    GpsTime,
    GetLinkStatus,
    IsAlive,
    // Topology app
    SetNodeMac,
    SetNodeStatus,
    SetNodeParamsReq,
    NodeParams,
    SetWiredLinkStatus,
    AddNodeWlanMacs,
    GetTopology,
    Topology,
    // Config app
    GetConfigReq,
    GetConfigResp,
    GetNetworkOverridesReq,
    GetNetworkOverridesResp,
    SetNetworkOverridesReq,
    ModifyNetworkOverridesReq,
    GetNodeOverridesReq,
    GetNodeOverridesResp,
    SetNodeOverridesReq,
    ModifyNodeOverridesReq,
    GetAutoNodeOverridesReq,
    GetAutoNodeOverridesResp,
    ClearAutoNodeOverrides,
    GetBaseConfigsReq,
    GetBaseConfigsResp,
    GetFirmwareBaseConfigsReq,
    GetFirmwareBaseConfigsResp,
    GetHardwareBaseConfigsReq,
    GetHardwareBaseConfigsResp,
    GetConfigMetadataReq,
    GetConfigMetadataResp,
    GetControllerConfigReq,
    GetControllerConfigResp,
    SetControllerConfigReq,
    GetControllerConfigMetadataReq,
    GetControllerConfigMetadataResp,
    UpdateTunnelConfig,
    SetMinionConfig,
    MinionConfigActions,
    // Upgrade app
    UpgradeGroupReq,
    UpgradeReq,
    UpgradeStateReq,
    UpgradeStateDump,
    UpgradeAbortReq,
    UpgradeCommitPlanReq,
    UpgradeCommitPlan,
    UpgradeAddImageReq,
    UpgradeDelImageReq,
    UpgradeListImagesReq,
    UpgradeListImagesResp,
    // High availability
    HaSync,
    HaFsm,
    HaGetState,
    HaGetAppData,
    HaAppData,
    HaSwitchController,
}

/// The framed unit of transport on every channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub mtype: MessageType,
    pub value: Vec<u8>,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub compression_format: Option<CompressionFormat>,
}

impl Envelope {
    /// Encode `body` into a new envelope.
    pub fn new<T: Serialize>(mtype: MessageType, body: &T) -> Result<Self, CodecError> {
        Ok(Self {
            mtype,
            value: codec::encode(body)?,
            compressed: false,
            compression_format: None,
        })
    }

    /// Decode the body as `T`. The caller matched on `mtype` first; a decode
    /// failure means the sender is broken, not us.
    pub fn read<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        codec::decode(&self.value)
    }
}

/// Generic success/failure reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Status bodies
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    #[default]
    Offline,
    Online,
    /// Online with GPS lock, able to initiate wireless links.
    OnlineInitiator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Distribution node (part of the mesh fabric).
    Dn,
    /// Client node (leaf).
    Cn,
}

/// Minion-reported progress of the current upgrade step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeStatusKind {
    #[default]
    None,
    Downloading,
    DownloadFailed,
    Flashing,
    FlashFailed,
    /// Image written to the inactive partition; ready to commit.
    Flashed,
    CommitFailed,
}

impl UpgradeStatusKind {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::DownloadFailed | Self::FlashFailed | Self::CommitFailed
        )
    }
}

/// Metadata describing an upgrade image, as baked into the image itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub version: String,
    pub md5: String,
    #[serde(default)]
    pub hardware_board_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStatus {
    pub kind: UpgradeStatusKind,
    pub next_image: ImageMeta,
    pub reason: String,
    pub upgrade_req_id: String,
    pub when_to_commit: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioStatus {
    pub initialized: bool,
    pub gps_sync: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BgpPeerInfo {
    pub ipv6_address: String,
    pub online: bool,
}

/// Periodic health report pushed by every minion. Static fields (versions,
/// board id, interface MACs) may be omitted on subsequent reports; the
/// controller fills them from its cache.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Wall-clock receive time, stamped by the controller.
    pub timestamp: u64,
    pub status: NodeStatus,
    pub upgrade_status: UpgradeStatus,
    pub version: String,
    pub uboot_version: String,
    pub firmware_version: String,
    pub hardware_model: String,
    pub hardware_board_id: String,
    pub ipv6_address: String,
    /// Hash of the node's active configuration, used for rollout convergence.
    pub config_hash: String,
    pub node_type: Option<NodeType>,
    /// Interface name -> interface MAC, for wired link correlation.
    pub network_interface_macs: Option<BTreeMap<String, MacAddr>>,
    /// Per-radio state, keyed by radio MAC.
    #[serde(default)]
    pub radio_status: BTreeMap<MacAddr, RadioStatus>,
    /// Neighbor MAC -> link up, as seen on this node's wired ports.
    pub neighbor_connection_status: Option<BTreeMap<MacAddr, bool>>,
    /// BGP peers, present only on gateway (POP) nodes.
    pub bgp_status: Option<BTreeMap<String, BgpPeerInfo>>,
    /// GPS timestamp (microseconds) when this report was sent.
    pub sent_gps_timestamp: u64,
    /// GPS timestamp (microseconds) when the last report ack was received.
    pub last_ack_gps_timestamp: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReportAck {
    pub request_full_status_report: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStatusDump {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDump {
    pub timestamp: u64,
    pub status_reports: BTreeMap<MacAddr, StatusReport>,
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootRequest {
    pub force: bool,
    pub seconds_to_reboot: i32,
    /// Empty = the whole topology.
    pub nodes: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootNode {
    pub force: bool,
    pub seconds_to_reboot: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartMinionRequest {
    pub seconds_to_restart: i32,
    pub nodes: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartMinion {
    pub seconds_to_restart: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetGpsTime {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpsTime {
    pub unix_time_ns: i64,
    pub gps_time_us: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLinkStatus {
    pub responder_mac: MacAddr,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsAlive {}

// ---------------------------------------------------------------------------
// Topology bodies
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNodeMac {
    pub node_name: String,
    pub node_mac: MacAddr,
    pub force: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNodeStatus {
    pub node_mac: MacAddr,
    pub status: NodeStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNodeParamsReq {
    pub node_mac: MacAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetWiredLinkStatus {
    pub node_mac: MacAddr,
    pub link_status: BTreeMap<MacAddr, bool>,
}

/// Operating parameters pushed to a node when it comes online. Radio and
/// airtime details are owned by the dataplane; the coordination plane only
/// carries identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeParams {
    pub node_name: String,
    pub node_type: NodeType,
    pub pop_node: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddNodeWlanMacs {
    pub node_name: String,
    pub wlan_macs: Vec<MacAddr>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTopology {}

// ---------------------------------------------------------------------------
// Config bodies
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetConfigReq {
    pub node: String,
    pub sw_version: Option<String>,
    pub fw_version: Option<String>,
    pub hw_board_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetConfigResp {
    pub config: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNetworkOverridesReq {}

/// `overrides` fields here and below are JSON documents carried verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOverrides {
    pub overrides: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNodeOverridesReq {
    /// Empty = all nodes.
    pub nodes: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOverrides {
    /// JSON object keyed by node name.
    pub overrides: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAutoNodeOverridesReq {
    pub nodes: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearAutoNodeOverrides {
    pub nodes: Vec<String>,
    /// Dotted config paths to clear.
    pub paths: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBaseConfigsReq {
    /// Empty = all known bundles.
    pub sw_versions: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseConfigs {
    /// JSON object keyed by bundle version.
    pub config: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFirmwareBaseConfigsReq {
    pub fw_versions: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHardwareBaseConfigsReq {
    pub hw_board_ids: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetConfigMetadataReq {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMetadataResp {
    pub metadata: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetControllerConfigReq {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfigResp {
    pub config: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetControllerConfigReq {
    pub config: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetControllerConfigMetadataReq {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTunnelConfig {
    pub node_name: String,
    pub ipv6_address: String,
}

/// Full effective config pushed to a minion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMinionConfig {
    pub config: String,
}

/// The action a minion must take when a config key changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigAction {
    #[default]
    NoAction,
    RebootNode,
    RestartMinion,
    RestartStats,
    RestartRouting,
    RestartSquire,
    ReloadFirmware,
    SyncLinkMonitor,
    // Controller-side actions (self-config only).
    RebootController,
    RestartBroker,
    RestartUpgradeSeeder,
    ReloadGoldenImage,
}

/// Targeted reload request: the changed keys all allow dynamic reapply, so
/// the minion applies `config` and runs `actions` without a full restart.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinionConfigActions {
    pub config: String,
    pub actions: BTreeSet<ConfigAction>,
}

// ---------------------------------------------------------------------------
// Upgrade bodies
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeReqType {
    #[default]
    Prepare,
    Commit,
    /// Prepare then commit, sharing one request id.
    Full,
    Reset,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeGroupType {
    #[default]
    Nodes,
    Network,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeTorrentParams {
    pub download_timeout: i64,
    pub download_limit: Option<i64>,
    pub upload_limit: Option<i64>,
    pub max_connections: Option<i64>,
}

/// The minion-bound payload of an upgrade request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeReq {
    pub req_type: UpgradeReqType,
    pub upgrade_req_id: String,
    pub md5: String,
    /// Magnet URI or HTTP(S) URL of the image.
    pub image_url: String,
    pub hardware_board_ids: Vec<String>,
    pub schedule_to_commit: Option<i64>,
    pub torrent_params: Option<UpgradeTorrentParams>,
    /// Effective config for the new version, applied atomically with the
    /// reboot when present.
    pub next_node_config: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeGroupReq {
    pub group_type: UpgradeGroupType,
    /// Explicit scope (`group_type == Nodes`).
    pub nodes: Vec<String>,
    /// Exclusions (`group_type == Network`).
    pub exclude_nodes: Vec<String>,
    pub req: UpgradeReq,
    /// Per-batch deadline, seconds.
    pub timeout: i64,
    pub skip_failure: bool,
    pub skip_pop_failure: bool,
    /// Wireless links (by name) to ignore during commit recovery checks.
    pub skip_links: BTreeSet<String>,
    /// Parallelism: 0 = unbounded, < 0 = commit skips candidate selection.
    pub limit: i64,
    pub retry_limit: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStateReq {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeStateDump {
    pub cur_batch: Vec<String>,
    pub cur_req: Option<UpgradeGroupReq>,
    pub pending_batches: Vec<Vec<String>>,
    pub pending_reqs: Vec<UpgradeGroupReq>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeAbortReq {
    pub abort_all: bool,
    pub req_ids: Vec<String>,
    /// Also send RESET to the affected nodes.
    pub reset_status: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeCommitPlanReq {
    pub limit: i64,
    pub exclude_nodes: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeCommitPlan {
    pub commit_batches: Vec<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeAddImageReq {
    pub image_url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeDelImageReq {
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeListImagesReq {}

/// Catalog entry as exposed to API clients and minions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeImage {
    /// Image version string; unique in the catalog.
    pub name: String,
    pub magnet_uri: String,
    pub http_uri: Option<String>,
    pub md5: String,
    pub hardware_board_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeListImagesResp {
    pub images: Vec<UpgradeImage>,
}

// ---------------------------------------------------------------------------
// High-availability bodies
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaState {
    #[default]
    Start,
    Primary,
    Backup,
    Active,
    Passive,
}

impl std::fmt::Display for HaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "START",
            Self::Primary => "PRIMARY",
            Self::Backup => "BACKUP",
            Self::Active => "ACTIVE",
            Self::Passive => "PASSIVE",
        };
        f.write_str(s)
    }
}

/// FSM snapshot, also served to API clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaFsm {
    pub state: HaState,
    /// Unix millis after which the peer is considered dead.
    pub peer_expiry_ms: i64,
}

/// Application data replicated from ACTIVE to PASSIVE. Config documents are
/// JSON strings; the topology rides as a JSON value so this crate stays
/// independent of the topology model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HaAppData {
    pub topology: Option<serde_json::Value>,
    pub network_overrides: Option<String>,
    pub node_overrides: Option<String>,
    pub auto_node_overrides: Option<String>,
    pub controller_config: Option<String>,
}

impl HaAppData {
    pub fn is_empty(&self) -> bool {
        self.topology.is_none()
            && self.network_overrides.is_none()
            && self.node_overrides.is_none()
            && self.auto_node_overrides.is_none()
            && self.controller_config.is_none()
    }

    /// Overlay `other` on top of self, field-wise.
    pub fn merge(&mut self, other: Self) {
        if other.topology.is_some() {
            self.topology = other.topology;
        }
        if other.network_overrides.is_some() {
            self.network_overrides = other.network_overrides;
        }
        if other.node_overrides.is_some() {
            self.node_overrides = other.node_overrides;
        }
        if other.auto_node_overrides.is_some() {
            self.auto_node_overrides = other.auto_node_overrides;
        }
        if other.controller_config.is_some() {
            self.controller_config = other.controller_config;
        }
    }
}

/// Peer heartbeat (`BSTAR_SYNC`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HaHeartbeat {
    pub state: HaState,
    pub version: String,
    pub seq_num: u64,
    pub data: HaAppData,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaGetState {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaGetAppData {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaSwitchController {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let report = StatusReport {
            version: "RELEASE_M46".into(),
            status: NodeStatus::Online,
            ..Default::default()
        };
        let env = Envelope::new(MessageType::StatusReport, &report).unwrap();
        assert_eq!(env.mtype, MessageType::StatusReport);
        let back: StatusReport = env.read().unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn envelope_read_wrong_type_fails() {
        let env = Envelope::new(MessageType::IsAlive, &IsAlive {}).unwrap();
        assert!(env.read::<StatusDump>().is_err());
    }

    #[test]
    fn ha_app_data_merge() {
        let mut pending = HaAppData {
            network_overrides: Some("{\"a\":1}".into()),
            ..Default::default()
        };
        pending.merge(HaAppData {
            node_overrides: Some("{}".into()),
            network_overrides: Some("{\"a\":2}".into()),
            ..Default::default()
        });
        assert_eq!(pending.network_overrides.as_deref(), Some("{\"a\":2}"));
        assert_eq!(pending.node_overrides.as_deref(), Some("{}"));
        assert!(!pending.is_empty());
    }
}
