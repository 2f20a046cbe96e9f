//! End-to-end dispatch: a minion status report travels through the broker
//! to the status app, which acks the minion and drives the topology
//! endpoint through the broker.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use lattice_controller::broker::BrokerBuilder;
use lattice_controller::config::controller_config::ControllerConfigStore;
use lattice_controller::config::helper::ConfigHelper;
use lattice_controller::settings::StatusOptions;
use lattice_controller::status::StatusApp;
use lattice_controller::topology_app::TopologyApp;
use lattice_controller::SharedState;
use lattice_primitives::wire::{NodeStatus, NodeType, StatusReport, StatusReportAck};
use lattice_primitives::{AppId, Envelope, MacAddr, MessageType, MinionAppId};
use lattice_topology::{Node, TopologyView};

fn test_shared() -> SharedState {
    let mut topology = TopologyView::default();
    topology
        .add_node(Node {
            name: "node-a".to_owned(),
            mac_addr: Some(MacAddr::new([0, 0, 0, 0, 0, 1])),
            wlan_mac_addrs: vec![],
            node_type: NodeType::Dn,
            pop_node: false,
            status: NodeStatus::Offline,
        })
        .unwrap();
    SharedState::new(
        topology,
        ConfigHelper::empty(),
        ControllerConfigStore::in_memory(),
    )
}

#[tokio::test]
async fn status_report_round_trip() {
    let shared = test_shared();
    let mac = MacAddr::new([0, 0, 0, 0, 0, 1]);

    let mut builder = BrokerBuilder::new();
    let status_io = builder.register(AppId::Status);
    let topology_io = builder.register(AppId::Topology);
    let minion_ingress = builder.minion_ingress();

    let (minion_tx, mut minion_rx) = mpsc::channel(64);
    let (api_tx, _api_rx) = mpsc::channel(64);
    let broker = builder.build(shared.clone(), minion_tx, api_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let status_opts = StatusOptions {
        report_throttle_interval: Duration::ZERO,
        version_file: "/nonexistent".into(),
        ..Default::default()
    };
    tokio::spawn(broker.run(shutdown_rx.clone()));
    tokio::spawn(StatusApp::new(status_io, shared.clone(), status_opts).run(shutdown_rx.clone()));
    tokio::spawn(TopologyApp::new(topology_io, shared.clone()).run(shutdown_rx));

    // A just-restarted minion reports itself previously offline.
    let report = StatusReport {
        status: NodeStatus::Offline,
        version: "Lattice Release RELEASE_M46 (build)".to_owned(),
        ipv6_address: "2001:db8::1".to_owned(),
        ..Default::default()
    };
    let envelope = Envelope::new(MessageType::StatusReport, &report).unwrap();
    minion_ingress
        .send((mac, AppId::Status, MinionAppId::Status, envelope))
        .await
        .unwrap();

    // The minion gets its ack back through the broker's minion egress.
    let ack = timeout(Duration::from_secs(5), async {
        loop {
            let (to_mac, _, _, envelope) = minion_rx.recv().await.expect("egress open");
            if envelope.mtype == MessageType::StatusReportAck {
                break (to_mac, envelope.read::<StatusReportAck>().unwrap());
            }
        }
    })
    .await
    .expect("ack within deadline");
    assert_eq!(ack.0, mac);

    // The report is indexed, and the topology endpoint flipped the node
    // online on the status app's request.
    timeout(Duration::from_secs(5), async {
        loop {
            {
                let indexed = shared.status_reports.read().contains_key(&mac);
                let online = shared
                    .topology
                    .read()
                    .get_node("node-a")
                    .map(|n| n.status == NodeStatus::Online)
                    .unwrap_or(false);
                if indexed && online {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("state converged");

    let _ = shutdown_tx.send(true);
}
