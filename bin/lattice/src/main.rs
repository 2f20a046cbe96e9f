//! Lattice controller binary.
//!
//! Parses runtime switches into typed options, wires the broker, the
//! transports, and every coordination app together, and runs until
//! interrupted. Exit code 0 is a clean shutdown; any startup error is
//! unrecoverable and non-zero.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::{Result, WrapErr};
use tokio::sync::{mpsc, watch};

use lattice_controller::broker::BrokerBuilder;
use lattice_controller::config::ConfigApp;
use lattice_controller::config::controller_config::ControllerConfigStore;
use lattice_controller::config::helper::ConfigHelper;
use lattice_controller::ha::{HaApp, PeerPublisher};
use lattice_controller::settings::{
    ConfigOptions, ControllerOptions, HaOptions, ListenOptions, StatusOptions, UpgradeOptions,
};
use lattice_controller::status::StatusApp;
use lattice_controller::topology_app::TopologyApp;
use lattice_controller::transport::{
    ApiTransport, MinionTransport, run_peer_publisher, run_peer_subscriber,
};
use lattice_controller::upgrade::UpgradeApp;
use lattice_controller::{SharedState, broker::APP_INBOX_CAPACITY};
use lattice_primitives::AppId;
use lattice_topology::{Topology, TopologyView};

#[derive(Parser, Debug)]
#[command(name = "lattice")]
#[command(about = "Lattice controller - coordination plane for a mmWave mesh backhaul network")]
struct Args {
    /// Port for the minion channel.
    #[arg(long, env = "LATTICE_MINION_PORT", default_value_t = 7007)]
    minion_port: u16,

    /// Port for the local API channel.
    #[arg(long, env = "LATTICE_API_PORT", default_value_t = 17077)]
    api_port: u16,

    /// Topology document to serve at startup.
    #[arg(long, env = "LATTICE_TOPOLOGY_FILE")]
    topology_file: Option<PathBuf>,

    /// Controller version file.
    #[arg(long, default_value = "/etc/lattice/version")]
    version_file: PathBuf,

    /// Throttle interval for per-minion status reports, seconds.
    #[arg(long, default_value_t = 25)]
    status_report_throttle_interval_s: u64,

    /// Interval between forced full status reports, seconds.
    #[arg(long, default_value_t = 3600)]
    full_status_report_interval_s: u64,

    /// Directory of base config bundles.
    #[arg(long, default_value = "/etc/lattice/base_configs")]
    base_config_dir: PathBuf,

    /// Directory of firmware base config bundles.
    #[arg(long, default_value = "/etc/lattice/fw_base_configs")]
    fw_base_config_dir: PathBuf,

    /// Directory of hardware base config bundles.
    #[arg(long, default_value = "/etc/lattice/hw_base_configs")]
    hw_base_config_dir: PathBuf,

    /// Board id to hardware type mapping file.
    #[arg(long, default_value = "/etc/lattice/hw_types.json")]
    hw_types_file: PathBuf,

    /// Node config metadata file.
    #[arg(long, default_value = "/etc/lattice/config_metadata.json")]
    config_metadata_file: PathBuf,

    /// Network overrides document.
    #[arg(long, default_value = "/data/cfg/network_overrides.json")]
    network_overrides_file: PathBuf,

    /// User node overrides document.
    #[arg(long, default_value = "/data/cfg/node_overrides.json")]
    node_overrides_file: PathBuf,

    /// Automatic node overrides document.
    #[arg(long, default_value = "/data/cfg/auto_node_overrides.json")]
    auto_node_overrides_file: PathBuf,

    /// Controller self-config document.
    #[arg(long, default_value = "/data/cfg/controller_config.json")]
    controller_config_file: PathBuf,

    /// Controller self-config metadata file.
    #[arg(long, default_value = "/etc/lattice/controller_config_metadata.json")]
    controller_config_metadata_file: PathBuf,

    /// Config backup directory.
    #[arg(long, default_value = "/data/cfg/backup")]
    config_backup_dir: PathBuf,

    /// Config backups retained per document.
    #[arg(long, default_value_t = 10)]
    config_backup_retention: usize,

    /// Config rollout tick interval, seconds.
    #[arg(long, default_value_t = 30)]
    config_sync_interval_s: u64,

    /// Max nodes per config rollout batch.
    #[arg(long, default_value_t = 15)]
    config_batch_limit: usize,

    /// Treat config metadata gaps as errors.
    #[arg(long, default_value_t = false)]
    strict_config_metadata: bool,

    /// Enable image seeding over the peer swarm.
    #[arg(long, default_value_t = true)]
    enable_seeder: bool,

    /// Directory for upgrade images.
    #[arg(long, default_value = "/data/images")]
    upgrade_image_dir: PathBuf,

    /// Minimum free disk space for image downloads, bytes.
    #[arg(long, default_value_t = 1 << 30)]
    upgrade_image_min_free_bytes: u64,

    /// HTTP path for image mirror URLs (empty to disable).
    #[arg(long, default_value = "")]
    upgrade_image_http_path: String,

    /// External tracker URL override.
    #[arg(long, default_value = "")]
    bt_tracker_override: String,

    /// Local tracker URL the controller announces to.
    #[arg(long, default_value = "")]
    local_bt_tracker_override: String,

    /// Seeder listen port.
    #[arg(long, default_value_t = 6881)]
    bt_seeder_port: u16,

    /// External IP announced to swarm peers.
    #[arg(long, default_value = "")]
    bt_announce_ip: String,

    /// High-performance seed preset.
    #[arg(long, default_value_t = true)]
    bt_high_performance_seed: bool,

    /// Active seed cap (-1 = unlimited).
    #[arg(long, default_value_t = -1)]
    bt_num_active_seeds: i32,

    /// ToS byte for seeder packets (-1 = default).
    #[arg(long, default_value_t = 0x60)]
    bt_peer_tos: i32,

    /// Upgrade progress tick interval, seconds.
    #[arg(long, default_value_t = 30)]
    upgrade_sync_interval_s: u64,

    /// Golden image check interval, seconds (0 = disabled).
    #[arg(long, default_value_t = 60)]
    golden_image_check_interval_s: u64,

    /// Promote the golden version after successful commits.
    #[arg(long, default_value_t = true)]
    set_golden_image_after_commits: bool,

    /// Enable high availability.
    #[arg(long, env = "LATTICE_HA_ENABLED", default_value_t = false)]
    ha_enabled: bool,

    /// This controller's static HA role.
    #[arg(long, env = "LATTICE_HA_PRIMARY", default_value_t = true)]
    ha_primary: bool,

    /// Port this controller publishes heartbeats on.
    #[arg(long, default_value_t = 55555)]
    ha_pub_port: u16,

    /// The peer controller's publish address, host:port.
    #[arg(long, env = "LATTICE_HA_PEER", default_value = "")]
    ha_peer_addr: String,

    /// Heartbeat period, milliseconds.
    #[arg(long, default_value_t = 10_000)]
    ha_heartbeat_period_ms: u64,

    /// Missed heartbeats before the peer is declared dead.
    #[arg(long, default_value_t = 3)]
    ha_failover_missed_heartbeats: u32,

    /// Successive heartbeats from a recovered passive primary before the
    /// backup yields (0 to disable). Ignored on the primary.
    #[arg(long, default_value_t = 30)]
    ha_primary_recovery_heartbeats: u32,
}

impl Args {
    fn into_options(self) -> (ControllerOptions, Option<PathBuf>) {
        let topology_file = self.topology_file.clone();
        let opts = ControllerOptions {
            listen: ListenOptions {
                minion_port: self.minion_port,
                api_port: self.api_port,
            },
            status: StatusOptions {
                report_throttle_interval: Duration::from_secs(
                    self.status_report_throttle_interval_s,
                ),
                full_report_interval: Duration::from_secs(self.full_status_report_interval_s),
                version_file: self.version_file.clone(),
                ..Default::default()
            },
            config: ConfigOptions {
                base_config_dir: self.base_config_dir,
                firmware_base_config_dir: self.fw_base_config_dir,
                hardware_base_config_dir: self.hw_base_config_dir,
                hardware_types_file: self.hw_types_file,
                network_overrides_file: self.network_overrides_file,
                node_overrides_file: self.node_overrides_file,
                auto_node_overrides_file: self.auto_node_overrides_file,
                metadata_file: self.config_metadata_file,
                controller_config_file: self.controller_config_file,
                controller_config_metadata_file: self.controller_config_metadata_file,
                backup_dir: self.config_backup_dir,
                backup_retention: self.config_backup_retention,
                status_sync_interval: Duration::from_secs(self.config_sync_interval_s),
                batch_limit: self.config_batch_limit,
                strict_metadata: self.strict_config_metadata,
                ..Default::default()
            },
            upgrade: UpgradeOptions {
                enable_seeder: self.enable_seeder,
                image_dir: self.upgrade_image_dir,
                image_min_free_bytes: self.upgrade_image_min_free_bytes,
                image_http_path: self.upgrade_image_http_path,
                tracker_url: self.bt_tracker_override,
                local_tracker_url: self.local_bt_tracker_override,
                seeder_port: self.bt_seeder_port,
                announce_ip: self.bt_announce_ip,
                high_performance_seed: self.bt_high_performance_seed,
                num_active_seeds: self.bt_num_active_seeds,
                peer_tos: self.bt_peer_tos,
                status_sync_interval: Duration::from_secs(self.upgrade_sync_interval_s),
                golden_image_check_interval: Duration::from_secs(
                    self.golden_image_check_interval_s,
                ),
                set_golden_image_after_commits: self.set_golden_image_after_commits,
                ..Default::default()
            },
            ha: HaOptions {
                enabled: self.ha_enabled,
                is_primary: self.ha_primary,
                pub_port: self.ha_pub_port,
                peer_pub_addr: self.ha_peer_addr,
                heartbeat_interval: Duration::from_millis(self.ha_heartbeat_period_ms),
                missed_heartbeats_threshold: self.ha_failover_missed_heartbeats,
                auto_recovery_heartbeats: self.ha_primary_recovery_heartbeats,
                version_file: self.version_file,
            },
        };
        (opts, topology_file)
    }
}

fn load_topology(path: Option<&PathBuf>) -> Result<TopologyView> {
    let Some(path) = path else {
        return Ok(TopologyView::default());
    };
    let contents = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading topology file {}", path.display()))?;
    let topology: Topology =
        serde_json::from_str(&contents).wrap_err("parsing topology document")?;
    TopologyView::new(topology).wrap_err("building topology view")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lattice=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let (opts, topology_file) = args.into_options();

    let topology = load_topology(topology_file.as_ref())?;
    let config_helper = ConfigHelper::load(&opts.config).wrap_err("loading config layers")?;
    let controller_config = ControllerConfigStore::load(&opts.config);
    let shared = SharedState::new(topology, config_helper, controller_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Broker and app endpoints.
    let mut builder = BrokerBuilder::new();
    let status_io = builder.register(AppId::Status);
    let config_io = builder.register(AppId::Config);
    let upgrade_io = builder.register(AppId::Upgrade);
    let topology_io = builder.register(AppId::Topology);
    let ha_io = builder.register(AppId::HighAvailability);

    // Transports.
    let (minion_tx, minion_egress) = mpsc::channel(APP_INBOX_CAPACITY);
    let (api_tx, api_egress) = mpsc::channel(APP_INBOX_CAPACITY);
    let minion_listener =
        tokio::net::TcpListener::bind(("::", opts.listen.minion_port))
            .await
            .wrap_err("binding minion channel")?;
    let api_listener = tokio::net::TcpListener::bind(("127.0.0.1", opts.listen.api_port))
        .await
        .wrap_err("binding api channel")?;
    let minion_transport =
        MinionTransport::new(minion_listener, builder.minion_ingress(), minion_egress);
    let api_transport = ApiTransport::new(api_listener, builder.api_ingress(), api_egress);

    // HA peer channel.
    let (peer_pub_tx, peer_pub_rx) = mpsc::channel(64);
    let (peer_sub_tx, peer_sub_rx) = mpsc::channel(64);
    if opts.ha.enabled {
        let pub_listener = tokio::net::TcpListener::bind(("::", opts.ha.pub_port))
            .await
            .wrap_err("binding HA publish channel")?;
        tokio::spawn(run_peer_publisher(
            pub_listener,
            peer_pub_rx,
            shutdown_rx.clone(),
        ));
        if opts.ha.peer_pub_addr.is_empty() {
            eyre::bail!("--ha-peer-addr is required when HA is enabled");
        }
        tokio::spawn(run_peer_subscriber(
            opts.ha.peer_pub_addr.clone(),
            peer_sub_tx,
            shutdown_rx.clone(),
        ));
    }

    let mut broker = builder.build(shared.clone(), minion_tx, api_tx);
    broker.set_ha_enabled(opts.ha.enabled);

    // Apps.
    let status_app = StatusApp::new(status_io, shared.clone(), opts.status.clone());
    let config_app = ConfigApp::new(config_io, shared.clone(), opts.config.clone());
    let upgrade_app = UpgradeApp::new(upgrade_io, shared.clone(), opts.upgrade.clone());
    let topology_app = TopologyApp::new(topology_io, shared.clone());
    let ha_app = HaApp::new(
        ha_io,
        shared,
        opts.ha.clone(),
        PeerPublisher::new(peer_pub_tx),
        peer_sub_rx,
    );

    tracing::info!(
        minion_port = opts.listen.minion_port,
        api_port = opts.listen.api_port,
        ha = opts.ha.enabled,
        "lattice controller starting"
    );

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(minion_transport.run(shutdown_rx.clone()));
    tasks.spawn(api_transport.run(shutdown_rx.clone()));
    tasks.spawn(broker.run(shutdown_rx.clone()));
    tasks.spawn(status_app.run(shutdown_rx.clone()));
    tasks.spawn(config_app.run(shutdown_rx.clone()));
    tasks.spawn(upgrade_app.run(shutdown_rx.clone()));
    tasks.spawn(topology_app.run(shutdown_rx.clone()));
    tasks.spawn(ha_app.run(shutdown_rx));

    tokio::signal::ctrl_c().await.wrap_err("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    while tasks.join_next().await.is_some() {}
    Ok(())
}
