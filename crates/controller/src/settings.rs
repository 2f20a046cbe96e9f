//! Typed runtime options for every component.
//!
//! The binary parses CLI/env switches into this struct once at startup and
//! hands each component its slice by value; nothing reads process globals.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ListenOptions {
    /// Port for the minion channel (ROUTER-style).
    pub minion_port: u16,
    /// Port for the local API channel.
    pub api_port: u16,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            minion_port: 7007,
            api_port: 17077,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StatusOptions {
    /// Reports from the same minion arriving faster than this are
    /// acknowledged but not re-indexed.
    pub report_throttle_interval: Duration,
    /// How often to re-request a full (non-partial) status report.
    pub full_report_interval: Duration,
    /// Bounds of the GPS timestamp delta queue for outlier detection.
    pub min_gps_queue_size: usize,
    pub max_gps_queue_size: usize,
    /// Allow minion connections whose id matches a radio MAC of a node with
    /// an empty primary MAC.
    pub allow_minion_wlan_macs: bool,
    /// File holding this controller's version string.
    pub version_file: PathBuf,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            report_throttle_interval: Duration::from_secs(25),
            full_report_interval: Duration::from_secs(3600),
            min_gps_queue_size: 6,
            max_gps_queue_size: 20,
            allow_minion_wlan_macs: true,
            version_file: PathBuf::from("/etc/lattice/version"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConfigOptions {
    /// Directory of base config bundles, one `<version>.json` per bundle.
    pub base_config_dir: PathBuf,
    pub firmware_base_config_dir: PathBuf,
    pub hardware_base_config_dir: PathBuf,
    /// JSON mapping hardware board id -> hardware config type name.
    pub hardware_types_file: PathBuf,
    pub network_overrides_file: PathBuf,
    pub node_overrides_file: PathBuf,
    pub auto_node_overrides_file: PathBuf,
    pub metadata_file: PathBuf,
    pub controller_config_file: PathBuf,
    pub controller_config_metadata_file: PathBuf,
    /// Where user-write snapshots go.
    pub backup_dir: PathBuf,
    pub backup_retention: usize,
    /// Config rollout tick.
    pub status_sync_interval: Duration,
    /// Max nodes receiving a config delta concurrently.
    pub batch_limit: usize,
    /// Deadline for one rollout batch.
    pub batch_timeout: Duration,
    /// Treat metadata gaps as errors.
    pub strict_metadata: bool,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            base_config_dir: PathBuf::from("/etc/lattice/base_configs"),
            firmware_base_config_dir: PathBuf::from("/etc/lattice/fw_base_configs"),
            hardware_base_config_dir: PathBuf::from("/etc/lattice/hw_base_configs"),
            hardware_types_file: PathBuf::from("/etc/lattice/hw_types.json"),
            network_overrides_file: PathBuf::from("/data/cfg/network_overrides.json"),
            node_overrides_file: PathBuf::from("/data/cfg/node_overrides.json"),
            auto_node_overrides_file: PathBuf::from("/data/cfg/auto_node_overrides.json"),
            metadata_file: PathBuf::from("/etc/lattice/config_metadata.json"),
            controller_config_file: PathBuf::from("/data/cfg/controller_config.json"),
            controller_config_metadata_file: PathBuf::from(
                "/etc/lattice/controller_config_metadata.json",
            ),
            backup_dir: PathBuf::from("/data/cfg/backup"),
            backup_retention: 10,
            status_sync_interval: Duration::from_secs(30),
            batch_limit: 15,
            batch_timeout: Duration::from_secs(300),
            strict_metadata: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UpgradeOptions {
    /// Enable image seeding over the peer swarm.
    pub enable_seeder: bool,
    pub image_dir: PathBuf,
    /// Minimum free disk space required before downloading a new image.
    pub image_min_free_bytes: u64,
    /// HTTP path prefix for mirror URLs, empty to disable.
    pub image_http_path: String,
    /// External tracker URL announced to nodes; derived from the global IPv6
    /// address when empty.
    pub tracker_url: String,
    /// Tracker URL the controller itself announces to (e.g. a local alias).
    pub local_tracker_url: String,
    pub seeder_port: u16,
    /// External IP announced to swarm peers.
    pub announce_ip: String,
    pub high_performance_seed: bool,
    /// Active seed cap, negative = unlimited.
    pub num_active_seeds: i32,
    /// ToS byte for peer packets, negative = default.
    pub peer_tos: i32,
    /// Upgrade progress tick.
    pub status_sync_interval: Duration,
    /// Golden image reconciliation tick, zero to disable.
    pub golden_image_check_interval: Duration,
    /// Promote the golden version after successful commits.
    pub set_golden_image_after_commits: bool,
    /// Attach next-version config to commits for managed nodes.
    pub simultaneous_image_and_config: bool,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            enable_seeder: true,
            image_dir: PathBuf::from("/data/images"),
            image_min_free_bytes: 1 << 30,
            image_http_path: String::new(),
            tracker_url: String::new(),
            local_tracker_url: String::new(),
            seeder_port: 6881,
            announce_ip: String::new(),
            high_performance_seed: true,
            num_active_seeds: -1,
            peer_tos: 0x60,
            status_sync_interval: Duration::from_secs(30),
            golden_image_check_interval: Duration::from_secs(60),
            set_golden_image_after_commits: true,
            simultaneous_image_and_config: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HaOptions {
    pub enabled: bool,
    /// The static role of this controller in the pair.
    pub is_primary: bool,
    /// Address this controller publishes heartbeats on.
    pub pub_port: u16,
    /// The peer's publish address, `host:port`.
    pub peer_pub_addr: String,
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before the peer is declared dead.
    pub missed_heartbeats_threshold: u32,
    /// Successive heartbeats from a recovered passive primary before the
    /// backup yields; zero disables automatic recovery.
    pub auto_recovery_heartbeats: u32,
    pub version_file: PathBuf,
}

impl Default for HaOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            is_primary: true,
            pub_port: 55555,
            peer_pub_addr: String::new(),
            heartbeat_interval: Duration::from_millis(10_000),
            missed_heartbeats_threshold: 3,
            auto_recovery_heartbeats: 30,
            version_file: PathBuf::from("/etc/lattice/version"),
        }
    }
}

/// Everything the binary wires together.
#[derive(Clone, Debug, Default)]
pub struct ControllerOptions {
    pub listen: ListenOptions,
    pub status: StatusOptions,
    pub config: ConfigOptions,
    pub upgrade: UpgradeOptions,
    pub ha: HaOptions,
}
