//! Upgrade orchestration.
//!
//! Owns the image catalog and its seeding session, and drives batched
//! PREPARE/COMMIT state machines over the fleet with retries. Progress is
//! observed purely through the status index: minions report their upgrade
//! substatus, and each tick advances whatever batch is in flight. COMMIT
//! batches are planned against the live topology so the mesh never loses
//! more than one hop-disjoint neighborhood at a time.

pub mod batch;
pub mod catalog;
pub mod plan;
pub mod torrent;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use lattice_primitives::wire::{
    ImageMeta, StatusReport, UpgradeAbortReq, UpgradeAddImageReq, UpgradeCommitPlan,
    UpgradeCommitPlanReq, UpgradeDelImageReq, UpgradeGroupReq, UpgradeGroupType,
    UpgradeListImagesReq, UpgradeListImagesResp, UpgradeReq, UpgradeReqType, UpgradeStateDump,
    UpgradeStateReq, UpgradeStatusKind, UpgradeTorrentParams,
};
use lattice_primitives::{AppId, MacAddr, MessageType, MinionAppId};

use crate::broker::{Inbound, MessageIo};
use crate::config::controller_config::{GoldenImagePolicy, time_restriction_allows};
use crate::settings::UpgradeOptions;
use crate::shared::SharedState;
use batch::Batch;
use catalog::ImageCatalog;
use torrent::{SeederSession, SessionSettings};

/// Default tracker port when the URL is derived from the controller's
/// global address.
const TRACKER_PORT: u16 = 6969;

/// Completed image download, posted back from the fetch task.
struct DownloadDone {
    requester: AppId,
    temp_path: PathBuf,
    result: Result<(), String>,
}

pub struct UpgradeApp {
    io: MessageIo,
    shared: SharedState,
    opts: UpgradeOptions,
    catalog: ImageCatalog,
    seeder: Option<SeederSession>,
    tracker_url: String,
    http_base: Option<String>,

    /// Status snapshot taken at each tick.
    minion_status: BTreeMap<MacAddr, StatusReport>,
    cur_batch: Option<Batch>,
    pending_batches: VecDeque<Batch>,
    pending_reqs: VecDeque<UpgradeGroupReq>,
    cur_req: Option<Arc<UpgradeGroupReq>>,
    /// Node name -> MAC for every node in the current request.
    cur_req_nodes: BTreeMap<String, MacAddr>,
    /// Node name -> success, accumulated over the current request.
    upgrade_results: BTreeMap<String, bool>,
    /// Node name -> image it is rebooting onto (captured at commit).
    node_to_next_image: BTreeMap<String, ImageMeta>,
    retries: BTreeMap<String, u32>,
    /// Request id of the in-flight golden-image reconciliation, if any.
    golden_req_id: String,

    downloads_tx: mpsc::Sender<DownloadDone>,
    downloads_rx: mpsc::Receiver<DownloadDone>,
}

impl UpgradeApp {
    pub fn new(io: MessageIo, shared: SharedState, opts: UpgradeOptions) -> Self {
        let public_ipv6 = opts.announce_ip.clone();
        let tracker_url = if !opts.tracker_url.is_empty() {
            opts.tracker_url.clone()
        } else if !public_ipv6.is_empty() {
            format!("http://[{public_ipv6}]:{TRACKER_PORT}/announce")
        } else {
            error!(
                "no global address or tracker override configured, \
                 falling back to a localhost tracker URL"
            );
            format!("http://localhost:{TRACKER_PORT}/announce")
        };
        info!(tracker = %tracker_url, "using swarm tracker");

        let seeder = opts.enable_seeder.then(|| {
            SeederSession::new(SessionSettings::build(
                opts.seeder_port,
                &public_ipv6,
                &opts.announce_ip,
                opts.num_active_seeds,
                opts.peer_tos,
                opts.high_performance_seed,
            ))
        });

        let http_base = (!opts.image_http_path.is_empty() && !public_ipv6.is_empty()).then(|| {
            let path = opts.image_http_path.trim_end_matches('/');
            format!("http://[{public_ipv6}]{path}")
        });

        let (downloads_tx, downloads_rx) = mpsc::channel(8);
        Self {
            io,
            shared,
            opts,
            catalog: ImageCatalog::default(),
            seeder,
            tracker_url,
            http_base,
            minion_status: BTreeMap::new(),
            cur_batch: None,
            pending_batches: VecDeque::new(),
            pending_reqs: VecDeque::new(),
            cur_req: None,
            cur_req_nodes: BTreeMap::new(),
            upgrade_results: BTreeMap::new(),
            node_to_next_image: BTreeMap::new(),
            retries: BTreeMap::new(),
            golden_req_id: String::new(),
            downloads_tx,
            downloads_rx,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.scan_image_directory();

        let mut sync_tick = tokio::time::interval(self.opts.status_sync_interval);
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let golden_interval = if self.opts.golden_image_check_interval.is_zero() {
            // effectively disabled; fire rarely and gate in the handler
            Duration::from_secs(3600)
        } else {
            self.opts.golden_image_check_interval
        };
        let mut golden_tick = tokio::time::interval(golden_interval);
        golden_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = sync_tick.tick() => self.sync_with_status_reports(),
                _ = golden_tick.tick() => {
                    if !self.opts.golden_image_check_interval.is_zero() {
                        self.golden_image_upgrade();
                    }
                }
                done = self.downloads_rx.recv() => {
                    if let Some(done) = done {
                        self.finish_image_download(done);
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
        let envelope = &inbound.envelope;
        match envelope.mtype {
            MessageType::UpgradeGroupReq => match envelope.read::<UpgradeGroupReq>() {
                Ok(req) => self.process_upgrade_group_req(sender, req),
                Err(_) => self.invalid(&sender, "UpgradeGroupReq"),
            },
            MessageType::UpgradeStateReq => {
                if envelope.read::<UpgradeStateReq>().is_err() {
                    return self.invalid(&sender, "UpgradeStateReq");
                }
                self.process_state_req(sender);
            }
            MessageType::UpgradeAbortReq => match envelope.read::<UpgradeAbortReq>() {
                Ok(req) => self.process_abort_req(sender, req),
                Err(_) => self.invalid(&sender, "UpgradeAbortReq"),
            },
            MessageType::UpgradeCommitPlanReq => match envelope.read::<UpgradeCommitPlanReq>() {
                Ok(req) => {
                    let topology = self.shared.topology.read();
                    let plan = UpgradeCommitPlan {
                        commit_batches: plan::commit_plan(&topology, req.limit, &req.exclude_nodes),
                    };
                    drop(topology);
                    self.reply(sender, MessageType::UpgradeCommitPlan, &plan);
                }
                Err(_) => self.invalid(&sender, "UpgradeCommitPlanReq"),
            },
            MessageType::UpgradeAddImageReq => match envelope.read::<UpgradeAddImageReq>() {
                Ok(req) => self.process_add_image_req(sender, req),
                Err(_) => self.invalid(&sender, "UpgradeAddImageReq"),
            },
            MessageType::UpgradeDelImageReq => match envelope.read::<UpgradeDelImageReq>() {
                Ok(req) => {
                    match self.catalog.delete(&req.name, self.seeder.as_mut()) {
                        Ok(()) => self.io.send_ack(sender, true, "Image deleted"),
                        Err(err) => self.io.send_ack(sender, false, err.to_string()),
                    }
                }
                Err(_) => self.invalid(&sender, "UpgradeDelImageReq"),
            },
            MessageType::UpgradeListImagesReq => {
                if envelope.read::<UpgradeListImagesReq>().is_err() {
                    return self.invalid(&sender, "UpgradeListImagesReq");
                }
                let resp = UpgradeListImagesResp {
                    images: self.catalog.list(),
                };
                self.reply(sender, MessageType::UpgradeListImagesResp, &resp);
            }
            other => {
                warn!(?other, %sender, "wrong type of message for upgrade app");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Image catalog
    // -----------------------------------------------------------------------

    fn scan_image_directory(&mut self) {
        let dir = self.opts.image_dir.clone();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                error!(?dir, ?err, "could not create image directory");
            }
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(catalog::IMAGE_FILE_EXTENSION) {
                continue;
            }
            let result = self.catalog.process_image_file(
                &path,
                self.seeder.as_mut(),
                &self.tracker_url,
                &self.opts.local_tracker_url,
                self.http_base.as_deref(),
            );
            if let Err(err) = result {
                error!(?path, %err, "skipping image");
            }
        }
    }

    fn process_add_image_req(&mut self, sender: AppId, req: UpgradeAddImageReq) {
        if self.seeder.is_none() && self.http_base.is_none() {
            self.io.send_ack(sender, false, "Feature disabled");
            return;
        }
        if let Some(free) = catalog::free_disk_bytes(&self.opts.image_dir) {
            if free < self.opts.image_min_free_bytes {
                error!(
                    free,
                    required = self.opts.image_min_free_bytes,
                    "image download rejected, out of disk space"
                );
                self.io.send_ack(sender.clone(), false, "Out of disk space");
                return;
            }
        }

        let temp_path = std::env::temp_dir().join(format!(
            "lattice-image-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let url = req.image_url.clone();
        let tx = self.downloads_tx.clone();
        let requester = sender.clone();
        let dest = temp_path.clone();
        // Large fetch: never on the app task.
        tokio::spawn(async move {
            let result = download_to_file(&url, &dest).await;
            let _ = tx
                .send(DownloadDone {
                    requester,
                    temp_path: dest,
                    result,
                })
                .await;
        });
        self.io.send_ack(sender, true, "Download starting...");
    }

    fn finish_image_download(&mut self, done: DownloadDone) {
        if let Err(err) = &done.result {
            error!(%err, "image download failed");
            let _ = std::fs::remove_file(&done.temp_path);
            self.io
                .send_ack(done.requester, false, "Failed to download image");
            return;
        }

        let md5 = match catalog::compute_image_md5(&done.temp_path) {
            Ok(md5) => md5,
            Err(err) => {
                let _ = std::fs::remove_file(&done.temp_path);
                self.io.send_ack(done.requester, false, err.to_string());
                return;
            }
        };
        // The file name embeds the payload MD5, so duplicate uploads are
        // caught before ingest.
        let file_name = format!("{md5}.{}", catalog::IMAGE_FILE_EXTENSION);
        let final_path = self.opts.image_dir.join(&file_name);
        if final_path.exists() {
            let _ = std::fs::remove_file(&done.temp_path);
            self.io.send_ack(
                done.requester,
                false,
                format!("Another file already exists with the same MD5 hash: {md5}"),
            );
            return;
        }
        // Copy rather than rename: the image directory may be on another
        // filesystem than the temp path.
        if let Err(err) = std::fs::copy(&done.temp_path, &final_path) {
            error!(?err, "failed moving downloaded image into place");
            let _ = std::fs::remove_file(&done.temp_path);
            self.io
                .send_ack(done.requester, false, "Failed to access image directory");
            return;
        }
        let _ = std::fs::remove_file(&done.temp_path);
        // The metadata sidecar was fetched alongside the payload.
        let sidecar_src = PathBuf::from(format!("{}.meta", done.temp_path.display()));
        if sidecar_src.exists() {
            let _ = std::fs::copy(
                &sidecar_src,
                self.opts.image_dir.join(format!("{file_name}.meta")),
            );
            let _ = std::fs::remove_file(&sidecar_src);
        }

        match self.catalog.process_image_file(
            &final_path,
            self.seeder.as_mut(),
            &self.tracker_url,
            &self.opts.local_tracker_url,
            self.http_base.as_deref(),
        ) {
            Ok(name) => {
                info!(image = %name, category = "upgrade", "added and seeding image");
                self.io
                    .send_ack(done.requester, true, "Finished downloading image");
            }
            Err(err) => {
                let _ = std::fs::remove_file(&final_path);
                error!(%err, "failed ingesting downloaded image");
                self.io.send_ack(done.requester, false, "Failed to seed image");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Request intake
    // -----------------------------------------------------------------------

    fn process_upgrade_group_req(&mut self, sender: AppId, req: UpgradeGroupReq) {
        info!(
            req_id = %req.req.upgrade_req_id,
            req_type = ?req.req.req_type,
            scope = ?req.group_type,
            category = "upgrade",
            "received upgrade request"
        );

        // Scope validation against topology.
        {
            let topology = self.shared.topology.read();
            let names = match req.group_type {
                UpgradeGroupType::Nodes => {
                    if req.nodes.is_empty() {
                        self.io.send_ack(sender, false, "Nodes field was empty");
                        return;
                    }
                    &req.nodes
                }
                UpgradeGroupType::Network => &req.exclude_nodes,
            };
            for name in names {
                if topology.get_node(name).is_none() {
                    self.io
                        .send_ack(sender, false, format!("Invalid node: {name}"));
                    return;
                }
            }
        }

        if req.req.req_type != UpgradeReqType::Reset {
            if req.timeout <= 0 {
                self.io
                    .send_ack(sender, false, format!("Invalid timeout: {}", req.timeout));
                return;
            }
            if req.retry_limit < 0 {
                self.io.send_ack(
                    sender,
                    false,
                    format!("Invalid retryLimit: {}", req.retry_limit),
                );
                return;
            }
        }

        let req_id = req.req.upgrade_req_id.clone();
        match req.req.req_type {
            UpgradeReqType::Prepare | UpgradeReqType::Commit => {
                info!(req_id = %req_id, "adding request to queue");
                self.pending_reqs.push_back(req);
                self.io.send_ack(sender, true, req_id);
            }
            UpgradeReqType::Full => {
                info!(req_id = %req_id, "expanding full upgrade into prepare + commit");
                self.schedule_full_upgrade(req);
                self.io.send_ack(sender, true, req_id);
            }
            UpgradeReqType::Reset => {
                self.process_reset_req(&req);
                self.io.send_ack(sender, true, req_id);
            }
        }
    }

    /// FULL expands into PREPARE followed by COMMIT sharing the request id.
    fn schedule_full_upgrade(&mut self, req: UpgradeGroupReq) {
        let mut prepare = req.clone();
        prepare.req.req_type = UpgradeReqType::Prepare;
        self.pending_reqs.push_back(prepare);

        let mut commit = req;
        commit.req.req_type = UpgradeReqType::Commit;
        self.pending_reqs.push_back(commit);
    }

    /// RESET is dispatched immediately; it never queues.
    fn process_reset_req(&self, req: &UpgradeGroupReq) {
        let topology = self.shared.topology.read();
        let targets: Vec<(String, MacAddr)> = match req.group_type {
            UpgradeGroupType::Nodes => req
                .nodes
                .iter()
                .filter_map(|n| topology.mac_by_name(n).map(|m| (n.clone(), m)))
                .collect(),
            UpgradeGroupType::Network => topology
                .all_nodes()
                .filter(|n| !req.exclude_nodes.contains(&n.name))
                .filter_map(|n| n.mac_addr.map(|m| (n.name.clone(), m)))
                .collect(),
        };
        drop(topology);
        info!(count = targets.len(), "resetting upgrade status on nodes");
        for (_, mac) in targets {
            let _ = self.io.send_to_minion(
                mac,
                MinionAppId::Upgrade,
                MessageType::UpgradeReq,
                &req.req,
            );
        }
    }

    // -----------------------------------------------------------------------
    // The periodic state machine tick
    // -----------------------------------------------------------------------

    pub(crate) fn sync_with_status_reports(&mut self) {
        self.minion_status = self
            .shared
            .status_reports
            .read()
            .iter()
            .map(|(mac, entry)| (*mac, entry.report.clone()))
            .collect();

        if self.cur_batch.as_ref().map(|b| b.pending()) != Some(true) {
            self.populate_next_batch();
            if self.cur_batch.as_ref().map(|b| b.pending()) != Some(true) {
                return;
            }
        }

        let Some(req_type) = self.cur_batch.as_ref().map(|b| b.req().req.req_type) else {
            return;
        };
        match req_type {
            UpgradeReqType::Prepare => self.check_prepare_batch(),
            UpgradeReqType::Commit => self.check_commit_batch(),
            _ => {}
        }

        let timed_out = self
            .cur_batch
            .as_ref()
            .filter(|b| b.timed_out())
            .map(|b| (Arc::clone(b.req()), b.node_names()));
        if let Some((req, stragglers)) = timed_out {
            info!("operation on current batch timed out");
            for node in stragglers {
                self.schedule_retry(&node, &req);
            }
            if let Some(batch) = &mut self.cur_batch {
                batch.clear();
            }
        }
    }

    fn populate_next_batch(&mut self) {
        if self.pending_batches.is_empty() {
            self.populate_next_req();
            if self.pending_batches.is_empty() {
                return;
            }
        }

        let Some(mut batch) = self.pending_batches.pop_front() else {
            return;
        };
        let req = Arc::clone(batch.req());
        debug!(nodes = batch.len(), "processing next pending batch");

        match req.req.req_type {
            UpgradeReqType::Prepare => {
                self.filter_prepare_batch(&mut batch);
                if !batch.pending() {
                    debug!("batch is empty after filtering, no nodes to prepare");
                    return;
                }
                let limit = req.limit;
                if limit <= 0 || batch.len() as i64 <= limit {
                    self.initiate_prepare(batch);
                } else {
                    let mut names = batch.node_names();
                    let mut to_prepare = BTreeSet::new();
                    while (to_prepare.len() as i64) < limit {
                        let Some(first) = names.iter().next().cloned() else {
                            break;
                        };
                        names.remove(&first);
                        to_prepare.insert(first);
                    }
                    self.push_to_pending_batches(names, &req);
                    self.initiate_prepare(Batch::new(to_prepare, req));
                }
            }
            UpgradeReqType::Commit => {
                self.filter_commit_batch(&mut batch);
                if !batch.pending() {
                    debug!("batch is empty after filtering, no nodes to commit");
                    return;
                }
                let mut names = batch.node_names();
                let to_commit = if req.limit < 0 {
                    std::mem::take(&mut names)
                } else {
                    let picked = {
                        let topology = self.shared.topology.read();
                        plan::commit_candidates(&topology, &names, req.limit.max(0) as usize)
                    };
                    if picked.is_empty() {
                        // Nodes reachable from the controller but with no
                        // programmed path in topology: nothing the planner
                        // can order, so everything goes at once.
                        // TODO clarify whether this branch should abort the
                        // request instead of committing all pending at once
                        let all = std::mem::take(&mut names);
                        error!(
                            nodes = ?all,
                            "committing alive nodes unreachable via topology"
                        );
                        all
                    } else {
                        for name in &picked {
                            names.remove(name);
                        }
                        picked
                    }
                };
                self.push_to_pending_batches(names, &req);
                if !to_commit.is_empty() {
                    self.initiate_commit(Batch::new(to_commit, req));
                }
            }
            _ => {}
        }
    }

    /// Leftover nodes rejoin the front of the pending queue.
    fn push_to_pending_batches(&mut self, names: BTreeSet<String>, req: &Arc<UpgradeGroupReq>) {
        if names.is_empty() {
            return;
        }
        match self.pending_batches.front_mut() {
            Some(front) => front.add_nodes(names),
            None => self
                .pending_batches
                .push_front(Batch::new(names, Arc::clone(req))),
        }
    }

    fn filter_prepare_batch(&mut self, batch: &mut Batch) {
        let req = Arc::clone(batch.req());
        let topology = Arc::clone(&self.shared.topology);
        let topology = topology.read();
        for name in batch.node_names() {
            let Some(node) = topology.get_node(&name) else {
                debug!(node = %name, "missing from topology, skipping");
                batch.remove_node(&name);
                continue;
            };
            let Some(mac) = node.mac_addr else {
                debug!(node = %name, "empty node MAC in topology, skipping");
                batch.remove_node(&name);
                continue;
            };
            if node.status == lattice_primitives::wire::NodeStatus::Offline {
                debug!(node = %name, "node is offline");
                batch.remove_node(&name);
                self.schedule_retry_deferred(&name, &req);
                continue;
            }
            let status = self.minion_status.get(&mac);
            // Already at the target, or already holding the prepared image.
            if let Some(report) = status {
                if !req.req.md5.is_empty()
                    && report.upgrade_status.kind == UpgradeStatusKind::Flashed
                    && report.upgrade_status.next_image.md5 == req.req.md5
                {
                    debug!(node = %name, "already prepared, skipping");
                    batch.remove_node(&name);
                    self.upgrade_results.insert(name.clone(), true);
                    continue;
                }
                if let Some(entry) = self.catalog.find_by_md5(&req.req.md5) {
                    if report.version.contains(&entry.image.name) {
                        debug!(node = %name, "already at target version, skipping");
                        batch.remove_node(&name);
                        continue;
                    }
                }
            }
        }
    }

    fn filter_commit_batch(&mut self, batch: &mut Batch) {
        let req = Arc::clone(batch.req());
        let topology = Arc::clone(&self.shared.topology);
        let topology = topology.read();
        for name in batch.node_names() {
            let Some(node) = topology.get_node(&name) else {
                debug!(node = %name, "missing from topology, skipping");
                batch.remove_node(&name);
                continue;
            };
            let Some(mac) = node.mac_addr else {
                debug!(node = %name, "empty node MAC in topology, skipping");
                batch.remove_node(&name);
                continue;
            };
            if node.status == lattice_primitives::wire::NodeStatus::Offline {
                debug!(node = %name, "node is offline");
                batch.remove_node(&name);
                self.schedule_retry_deferred(&name, &req);
                continue;
            }
            // Commit needs a flashed image waiting on the node.
            let ready = self
                .minion_status
                .get(&mac)
                .map(|r| r.upgrade_status.kind == UpgradeStatusKind::Flashed)
                .unwrap_or(false);
            if !ready {
                debug!(node = %name, "not ready to commit, skipping");
                batch.remove_node(&name);
            }
        }
    }

    fn initiate_prepare(&mut self, mut batch: Batch) {
        let req = Arc::clone(batch.req());
        info!(
            req_id = %req.req.upgrade_req_id,
            nodes = ?batch.node_names(),
            "initiating prepare request"
        );
        let topology = Arc::clone(&self.shared.topology);
        let topology = topology.read();
        for name in batch.node_names() {
            let Some(mac) = topology.mac_by_name(&name) else {
                error!(node = %name, "missing from topology, skipping");
                batch.remove_node(&name);
                continue;
            };
            let _ = self.io.send_to_minion(
                mac,
                MinionAppId::Upgrade,
                MessageType::UpgradeReq,
                &req.req,
            );
            // Clear any stale failure so progress checks start clean.
            if let Some(report) = self.minion_status.get_mut(&mac) {
                report.upgrade_status.kind = UpgradeStatusKind::None;
            }
        }
        drop(topology);
        if batch.pending() {
            batch.initiate(BTreeSet::new(), BTreeMap::new());
            self.cur_batch = Some(batch);
        }
    }

    fn initiate_commit(&mut self, mut batch: Batch) {
        let req = Arc::clone(batch.req());
        info!(
            req_id = %req.req.upgrade_req_id,
            nodes = ?batch.node_names(),
            "initiating commit request"
        );

        // Resolve MACs first (topology lock released before config).
        let nodes_to_commit: Vec<(String, MacAddr)> = {
            let topology = self.shared.topology.read();
            batch
                .node_names()
                .into_iter()
                .filter_map(|name| topology.mac_by_name(&name).map(|mac| (name, mac)))
                .collect()
        };
        for name in batch.node_names() {
            if !nodes_to_commit.iter().any(|(n, _)| n == &name) {
                debug!(node = %name, "missing from topology, skipping");
                batch.remove_node(&name);
            }
        }

        for (name, mac) in &nodes_to_commit {
            let next_image = self
                .minion_status
                .get(mac)
                .map(|r| r.upgrade_status.next_image.clone())
                .unwrap_or_default();
            self.node_to_next_image.insert(name.clone(), next_image.clone());

            let mut minion_req: UpgradeReq = (*req).req.clone();
            if self.opts.simultaneous_image_and_config {
                // Reboot onto new image + new config atomically.
                if let Some(report) = self.minion_status.get(mac) {
                    let config = self.shared.config.read();
                    let state = config.build_node_config(
                        name,
                        &next_image.version,
                        &report.firmware_version,
                        &report.hardware_board_id,
                    );
                    if state.managed {
                        minion_req.next_node_config =
                            Some(crate::config::helper::canonical_json(&state.effective));
                    }
                }
            }
            let _ = self.io.send_to_minion(
                *mac,
                MinionAppId::Upgrade,
                MessageType::UpgradeReq,
                &minion_req,
            );
        }

        // A delayed commit is dispatched and forgotten.
        let delay = req.req.schedule_to_commit.unwrap_or(0);
        if delay > 0 {
            info!(delay, "commit scheduled on nodes, not monitoring");
            return;
        }

        if batch.pending() {
            let topology = self.shared.topology.read();
            let mut skip_links: BTreeSet<String> = topology
                .all_links()
                .filter(|l| l.link_type == lattice_topology::LinkType::Wireless && !l.is_alive)
                .map(|l| l.name.clone())
                .collect();
            drop(topology);
            skip_links.extend(req.skip_links.iter().cloned());

            let mut bgp_peers = BTreeMap::new();
            if !req.skip_pop_failure {
                for (name, mac) in &nodes_to_commit {
                    if let Some(count) = self
                        .minion_status
                        .get(mac)
                        .and_then(|r| r.bgp_status.as_ref())
                        .map(|peers| peers.len())
                    {
                        if count > 0 {
                            bgp_peers.insert(name.clone(), count);
                        }
                    }
                }
            }
            info!(skip_links = ?skip_links, "batch will ignore links");
            batch.initiate(skip_links, bgp_peers);
            self.cur_batch = Some(batch);
        }
    }

    fn check_prepare_batch(&mut self) {
        let (req, names) = {
            let Some(batch) = &self.cur_batch else { return };
            (Arc::clone(batch.req()), batch.node_names())
        };
        let req_id = req.req.upgrade_req_id.clone();
        debug!(nodes = names.len(), req_id = %req_id, "monitoring prepare status");

        let topology_macs: BTreeMap<String, MacAddr> = {
            let topology = self.shared.topology.read();
            names
                .iter()
                .filter_map(|n| topology.mac_by_name(n).map(|m| (n.clone(), m)))
                .collect()
        };

        for name in names {
            let Some(mac) = topology_macs.get(&name) else {
                error!(node = %name, "unrecognized node name");
                if let Some(batch) = &mut self.cur_batch {
                    batch.remove_node(&name);
                }
                continue;
            };
            let Some(report) = self.minion_status.get(mac).cloned() else {
                continue;
            };
            let ustatus = &report.upgrade_status;

            let prepared = ustatus.kind == UpgradeStatusKind::Flashed
                && ustatus.next_image.md5 == req.req.md5;
            let failed = ustatus.kind.is_failure() && ustatus.upgrade_req_id == req_id;

            if prepared {
                info!(node = %name, req_id = %req_id, category = "upgrade", "prepare success");
                if let Some(batch) = &mut self.cur_batch {
                    batch.remove_node(&name);
                }
                self.upgrade_results.insert(name.clone(), true);
            } else if failed {
                warn!(
                    node = %name,
                    req_id = %req_id,
                    reason = %ustatus.reason,
                    category = "upgrade",
                    "prepare failed"
                );
                if let Some(batch) = &mut self.cur_batch {
                    batch.remove_node(&name);
                }
                self.upgrade_results.insert(name.clone(), false);
                self.schedule_retry(&name, &req);
            }
        }

        // Seeding visibility while a torrent-driven prepare is running.
        if let Some(entry) = self.catalog.find_by_magnet(&req.req.image_url) {
            if let Some(handle) = &entry.torrent {
                let status = handle.status();
                metrics::gauge!("upgrade_bt_seeds").set(status.seeds as f64);
                metrics::gauge!("upgrade_bt_peers").set(status.peers as f64);
                metrics::gauge!("upgrade_bt_announces").set(status.announces as f64);
            }
        }
    }

    fn check_commit_batch(&mut self) {
        let (req, bgp_baseline, skip_links, names) = {
            let Some(batch) = &self.cur_batch else { return };
            (
                Arc::clone(batch.req()),
                batch.bgp_peers().clone(),
                batch.skip_links().clone(),
                batch.node_names(),
            )
        };
        let req_id = req.req.upgrade_req_id.clone();
        debug!(nodes = names.len(), req_id = %req_id, "monitoring commit status");

        for name in names {
            let (mac, links_alive) = {
                let topology = self.shared.topology.read();
                let Some(mac) = topology.mac_by_name(&name) else {
                    error!(node = %name, "unrecognized node name");
                    if let Some(batch) = &mut self.cur_batch {
                        batch.remove_node(&name);
                    }
                    continue;
                };
                let alive = topology
                    .links_by_node(&name)
                    .into_iter()
                    .filter(|l| l.link_type == lattice_topology::LinkType::Wireless)
                    .filter(|l| !skip_links.contains(&l.name))
                    .all(|l| l.is_alive);
                (mac, alive)
            };
            let Some(report) = self.minion_status.get(&mac).cloned() else {
                continue;
            };
            let ustatus = &report.upgrade_status;
            let next_image = self.node_to_next_image.get(&name).cloned().unwrap_or_default();

            let committed =
                !next_image.version.is_empty() && report.version.contains(&next_image.version);
            if committed {
                if !links_alive {
                    debug!(node = %name, "waiting for wireless links to come up");
                    continue;
                }
                // Gateways must also regain their BGP peers.
                let peer_count = report.bgp_status.as_ref().map(|m| m.len()).unwrap_or(0);
                if let Some(baseline) = bgp_baseline.get(&name) {
                    if peer_count < *baseline {
                        debug!(
                            node = %name,
                            expected = baseline,
                            have = peer_count,
                            "waiting for BGP peers to come up"
                        );
                        continue;
                    }
                }
                info!(node = %name, req_id = %req_id, category = "upgrade", "commit success");
                if let Some(batch) = &mut self.cur_batch {
                    batch.remove_node(&name);
                }
                self.upgrade_results.insert(name.clone(), true);
            } else if ustatus.kind == UpgradeStatusKind::CommitFailed
                && ustatus.upgrade_req_id == req_id
            {
                warn!(
                    node = %name,
                    req_id = %req_id,
                    reason = %ustatus.reason,
                    category = "upgrade",
                    "commit failure"
                );
                if let Some(batch) = &mut self.cur_batch {
                    batch.remove_node(&name);
                }
                self.upgrade_results.insert(name.clone(), false);
                self.schedule_retry(&name, &req);
            } else {
                debug!(
                    node = %name,
                    last_seen = report.timestamp,
                    "reboot in progress"
                );
            }
        }
    }

    /// Retry bookkeeping shared by both state machines.
    fn schedule_retry(&mut self, node: &str, req: &Arc<UpgradeGroupReq>) {
        if !req.skip_pop_failure {
            let is_pop = self
                .cur_batch
                .as_ref()
                .map(|b| b.bgp_peers().contains_key(node))
                .unwrap_or(false);
            if is_pop {
                // A failed gateway halts the whole request.
                self.clear_cur_req(
                    false,
                    &format!("POP node {node} failed to upgrade properly"),
                );
                return;
            }
        }

        let retries = self.retries.entry(node.to_owned()).or_insert(0);
        if *retries < req.retry_limit.max(0) as u32 {
            *retries += 1;
            info!(node = %node, retry = *retries, "scheduled for retry");
            self.push_to_pending_batches([node.to_owned()].into(), req);
        } else if !req.skip_failure {
            self.clear_cur_req(
                false,
                &format!("{node} reached max retries and skipFailure is false"),
            );
        } else {
            info!(node = %node, "reached max number of retries, dropping");
        }
    }

    /// Like `schedule_retry` but without POP/cancel side effects, for use
    /// inside batch filtering.
    fn schedule_retry_deferred(&mut self, node: &str, req: &Arc<UpgradeGroupReq>) {
        let retries = self.retries.entry(node.to_owned()).or_insert(0);
        if *retries < req.retry_limit.max(0) as u32 {
            *retries += 1;
            self.push_to_pending_batches([node.to_owned()].into(), req);
        }
    }

    fn populate_next_req(&mut self) {
        // Close out the finished request before starting the next.
        if !self.upgrade_results.is_empty() {
            let failed = self.upgrade_results.values().filter(|ok| !**ok).count();
            if let Some(req) = &self.cur_req {
                if failed > 0 {
                    warn!(
                        req_id = %req.req.upgrade_req_id,
                        num_success = self.upgrade_results.len() - failed,
                        num_failed = failed,
                        category = "upgrade",
                        "upgrade process failed"
                    );
                } else {
                    info!(
                        req_id = %req.req.upgrade_req_id,
                        category = "upgrade",
                        "upgrade process succeeded"
                    );
                }
                let finished = Arc::clone(req);
                self.update_golden_image_after_upgrade(&finished);
            }
        }
        self.cur_req = None;
        self.upgrade_results.clear();
        self.node_to_next_image.clear();
        self.cur_req_nodes.clear();
        self.retries.clear();

        let Some(next) = self.pending_reqs.pop_front() else {
            return;
        };
        info!(
            req_id = %next.req.upgrade_req_id,
            req_type = ?next.req.req_type,
            "processing queued request"
        );

        let req = Arc::new(next);
        self.cur_req = Some(Arc::clone(&req));

        // Identify the request's node set.
        let mut names = BTreeSet::new();
        {
            let topology = self.shared.topology.read();
            match req.group_type {
                UpgradeGroupType::Nodes => {
                    for name in &req.nodes {
                        let Some(node) = topology.get_node(name) else {
                            error!(node = %name, "skipping unknown node in upgrade request");
                            continue;
                        };
                        if let Some(mac) = node.mac_addr {
                            names.insert(name.clone());
                            self.cur_req_nodes.insert(name.clone(), mac);
                        }
                    }
                }
                UpgradeGroupType::Network => {
                    for node in topology.all_nodes() {
                        if req.exclude_nodes.contains(&node.name) {
                            continue;
                        }
                        if let Some(mac) = node.mac_addr {
                            names.insert(node.name.clone());
                            self.cur_req_nodes.insert(node.name.clone(), mac);
                        }
                    }
                }
            }
        }
        if names.is_empty() {
            error!(req_id = %req.req.upgrade_req_id, "no nodes to upgrade in request");
            return;
        }
        self.push_to_pending_batches(names, &req);
    }

    // -----------------------------------------------------------------------
    // Abort and inspection
    // -----------------------------------------------------------------------

    fn process_abort_req(&mut self, sender: AppId, req: UpgradeAbortReq) {
        const REASON: &str = "User request";
        if req.abort_all {
            info!("aborting all upgrade requests");
            self.clear_cur_req(req.reset_status, REASON);
            self.pending_reqs.clear();
            self.io.send_ack(sender, true, "Aborted all requests");
            return;
        }

        info!(req_ids = ?req.req_ids, "aborting upgrade requests");
        for req_id in &req.req_ids {
            let is_current = self
                .cur_batch
                .as_ref()
                .filter(|b| b.pending())
                .map(|b| &b.req().req.upgrade_req_id == req_id)
                .or_else(|| {
                    self.pending_batches
                        .front()
                        .map(|b| &b.req().req.upgrade_req_id == req_id)
                })
                .unwrap_or(false);
            if is_current {
                self.clear_cur_req(req.reset_status, REASON);
            } else {
                self.clear_pending_reqs_by_id(req_id, REASON);
            }
        }
        self.io.send_ack(sender, true, "Aborted all valid requests");
    }

    fn clear_cur_req(&mut self, reset_status: bool, reason: &str) {
        let req_id = self
            .cur_batch
            .as_ref()
            .filter(|b| b.pending())
            .map(|b| b.req().req.upgrade_req_id.clone())
            .or_else(|| {
                self.pending_batches
                    .front()
                    .map(|b| b.req().req.upgrade_req_id.clone())
            });
        let Some(req_id) = req_id else {
            info!("no current request to clear");
            return;
        };

        info!(req_id = %req_id, reason, "aborting current request");
        if let Some(batch) = &mut self.cur_batch {
            batch.clear();
        }
        self.pending_batches.clear();
        self.clear_pending_reqs_by_id(&req_id, reason);

        if reset_status {
            let reset = UpgradeReq {
                req_type: UpgradeReqType::Reset,
                upgrade_req_id: req_id,
                ..Default::default()
            };
            for (name, mac) in &self.cur_req_nodes {
                debug!(node = %name, "sending reset to node");
                let _ = self.io.send_to_minion(
                    *mac,
                    MinionAppId::Upgrade,
                    MessageType::UpgradeReq,
                    &reset,
                );
            }
        }
    }

    fn clear_pending_reqs_by_id(&mut self, req_id: &str, reason: &str) {
        info!(req_id = %req_id, reason, "clearing pending requests");
        self.pending_reqs
            .retain(|r| r.req.upgrade_req_id != req_id);
    }

    fn process_state_req(&self, sender: AppId) {
        let mut dump = UpgradeStateDump::default();
        if let Some(batch) = self.cur_batch.as_ref().filter(|b| b.pending()) {
            dump.cur_batch = batch.node_names().into_iter().collect();
            dump.cur_req = Some((**batch.req()).clone());
        } else if let Some(front) = self.pending_batches.front() {
            dump.cur_req = Some((**front.req()).clone());
        }
        for batch in &self.pending_batches {
            dump.pending_batches
                .push(batch.node_names().into_iter().collect());
        }
        dump.pending_reqs = self.pending_reqs.iter().cloned().collect();
        self.reply(sender, MessageType::UpgradeStateDump, &dump);
    }

    // -----------------------------------------------------------------------
    // Golden image reconciliation
    // -----------------------------------------------------------------------

    fn golden_image_upgrade(&mut self) {
        // Never interleave with user-driven upgrades.
        if self.cur_req.is_some() || !self.pending_reqs.is_empty() {
            return;
        }
        let policy = self.shared.controller_config.read().golden_image();
        if !policy.enabled || policy.versions.is_empty() {
            return;
        }
        let now = jiff::Zoned::now().time();
        if !time_restriction_allows(&policy.time_restriction, now) {
            return;
        }

        // Candidate nodes per target version, honoring the blacklist.
        let mut per_version: BTreeMap<String, Vec<String>> = BTreeMap::new();
        {
            let topology = self.shared.topology.read();
            for (board_id, version) in &policy.versions {
                if !self.catalog.contains(version) {
                    warn!(version = %version, "golden image version does not exist");
                    continue;
                }
                let nodes = self.find_nodes_to_upgrade(&topology, board_id, version, &policy);
                if !nodes.is_empty() {
                    per_version.entry(version.clone()).or_default().extend(nodes);
                }
            }
        }
        let total: usize = per_version.values().map(Vec::len).sum();
        if total == 0 {
            return;
        }
        debug!(candidates = total, "golden image candidates found");

        self.golden_req_id = new_request_id();
        let torrent_params = UpgradeTorrentParams {
            download_timeout: policy.timeout_sec,
            download_limit: Some(-1),
            upload_limit: Some(-1),
            max_connections: Some(-1),
        };

        let mut all_nodes: Vec<String> = Vec::new();
        let mut requests = Vec::new();
        for (version, nodes) in &per_version {
            let Some(entry) = self.catalog.get(version) else {
                continue;
            };
            let image = entry.image.clone();
            let mut picked = Vec::new();
            let mut limit_reached = false;
            for node in nodes {
                if policy.batch_limit > 0 && picked.len() >= policy.batch_limit {
                    limit_reached = true;
                    break;
                }
                picked.push(node.clone());
                all_nodes.push(node.clone());
            }
            if !picked.is_empty() {
                requests.push(UpgradeGroupReq {
                    group_type: UpgradeGroupType::Nodes,
                    nodes: picked,
                    exclude_nodes: vec![],
                    req: UpgradeReq {
                        req_type: UpgradeReqType::Prepare,
                        upgrade_req_id: self.golden_req_id.clone(),
                        md5: image.md5.clone(),
                        image_url: image.magnet_uri.clone(),
                        hardware_board_ids: image.hardware_board_ids.clone(),
                        torrent_params: Some(torrent_params),
                        ..Default::default()
                    },
                    timeout: policy.timeout_sec,
                    skip_failure: true,
                    skip_pop_failure: false,
                    skip_links: BTreeSet::new(),
                    limit: 0,
                    retry_limit: 0,
                });
            }
            if limit_reached {
                break;
            }
        }

        // One COMMIT for the union of everything prepared this cycle.
        requests.push(UpgradeGroupReq {
            group_type: UpgradeGroupType::Nodes,
            nodes: all_nodes.clone(),
            exclude_nodes: vec![],
            req: UpgradeReq {
                req_type: UpgradeReqType::Commit,
                upgrade_req_id: self.golden_req_id.clone(),
                schedule_to_commit: Some(0),
                ..Default::default()
            },
            timeout: policy.timeout_sec,
            skip_failure: false,
            skip_pop_failure: false,
            skip_links: BTreeSet::new(),
            limit: 0,
            retry_limit: 0,
        });

        info!(
            nodes = ?all_nodes,
            req_id = %self.golden_req_id,
            category = "upgrade",
            "upgrading nodes to golden image"
        );
        self.pending_reqs.extend(requests);
    }

    /// Nodes of `board_id` running something older than `version`.
    fn find_nodes_to_upgrade(
        &self,
        topology: &lattice_topology::TopologyView,
        board_id: &str,
        version: &str,
        policy: &GoldenImagePolicy,
    ) -> Vec<String> {
        let mut nodes = Vec::new();
        for node in topology.all_nodes() {
            let Some(mac) = node.mac_addr else { continue };
            if node.status == lattice_primitives::wire::NodeStatus::Offline {
                continue;
            }
            let Some(report) = self.minion_status.get(&mac) else {
                continue;
            };
            if report.hardware_board_id != board_id {
                continue;
            }
            if report.version.contains(version) {
                continue; // already there
            }
            if policy.node_blacklist.get(&node.name).map(String::as_str) == Some(version) {
                continue;
            }
            nodes.push(node.name.clone());
        }
        nodes
    }

    /// Golden bookkeeping after a request finishes: blacklist maintenance
    /// for golden runs, and version promotion after successful commits.
    fn update_golden_image_after_upgrade(&mut self, req: &Arc<UpgradeGroupReq>) {
        let mut policy = self.shared.controller_config.read().golden_image();

        if req.req.upgrade_req_id == self.golden_req_id && !self.golden_req_id.is_empty() {
            match req.req.req_type {
                UpgradeReqType::Prepare => {
                    let Some(entry) = self.catalog.find_by_md5(&req.req.md5) else {
                        return;
                    };
                    let version = entry.image.name.clone();
                    for (node, ok) in &self.upgrade_results {
                        if !ok {
                            policy.node_blacklist.insert(node.clone(), version.clone());
                        }
                    }
                }
                UpgradeReqType::Commit => {
                    for (node, ok) in &self.upgrade_results {
                        if *ok {
                            policy.node_blacklist.remove(node);
                        } else if let Some(next) = self.node_to_next_image.get(node) {
                            if !next.version.is_empty() {
                                policy
                                    .node_blacklist
                                    .insert(node.clone(), next.version.clone());
                            }
                        }
                    }
                }
                _ => return,
            }
            self.store_golden_image(&policy);
            return;
        }

        // Promotion: successful ordinary commits advance the golden version
        // for every board id the committed image supports, one promotion
        // per board id.
        if !self.opts.set_golden_image_after_commits
            || req.req.req_type != UpgradeReqType::Commit
        {
            return;
        }

        let mut promoted: BTreeMap<String, String> = BTreeMap::new();
        for (node, ok) in &self.upgrade_results {
            if !ok {
                continue;
            }
            let Some(next) = self.node_to_next_image.get(node) else {
                continue;
            };
            if next.version.is_empty() {
                continue;
            }
            let Some(entry) = self.catalog.get(&next.version) else {
                continue;
            };
            for board_id in &entry.image.hardware_board_ids {
                promoted.insert(board_id.clone(), next.version.clone());
            }
        }

        let mut dirty = false;
        for (board_id, new_version) in promoted {
            if policy.versions.get(&board_id) == Some(&new_version) {
                continue;
            }
            info!(board = %board_id, version = %new_version, "promoting golden image version");
            policy.versions.insert(board_id, new_version.clone());
            policy.node_blacklist.retain(|_, v| *v != new_version);
            dirty = true;
        }
        if dirty {
            self.store_golden_image(&policy);
        }
    }

    fn store_golden_image(&self, policy: &GoldenImagePolicy) {
        if let Err(err) = self
            .shared
            .controller_config
            .write()
            .set_golden_image(policy)
        {
            warn!(%err, "failed storing golden image policy");
        }
    }

    fn reply<T: serde::Serialize>(&self, dest: AppId, mtype: MessageType, body: &T) {
        if let Err(err) = self.io.send_to_app(dest, mtype, body) {
            warn!(?err, "failed sending upgrade reply");
        }
    }

    fn invalid(&self, sender: &AppId, kind: &str) {
        metrics::counter!("upgrade_invalid_messages").increment(1);
        warn!(%sender, kind, "invalid message payload");
        self.io.send_ack(sender.clone(), false, format!("Invalid {kind}"));
    }
}

async fn download_to_file(url: &str, dest: &std::path::Path) -> Result<(), String> {
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    info!(%url, "start downloading image");
    let response = reqwest::get(url).await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP status {}", response.status()));
    }
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| e.to_string())?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        file.write_all(&chunk).await.map_err(|e| e.to_string())?;
    }
    file.flush().await.map_err(|e| e.to_string())?;

    // The metadata sidecar is published next to the image.
    let meta_url = format!("{url}.meta");
    let meta_dest = format!("{}.meta", dest.display());
    match reqwest::get(&meta_url).await {
        Ok(resp) if resp.status().is_success() => {
            let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
            tokio::fs::write(&meta_dest, &bytes)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(resp) => {
            return Err(format!("metadata fetch failed with HTTP {}", resp.status()));
        }
        Err(err) => return Err(format!("metadata fetch failed: {err}")),
    }

    info!(%url, ?dest, "successfully downloaded image");
    Ok(())
}

fn new_request_id() -> String {
    // Request ids only need uniqueness within one controller's lifetime.
    format!(
        "req-{:x}-{:x}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or(0),
        rand::random::<u32>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Outbound, test_endpoint};
    use crate::status::StatusEntry;
    use lattice_primitives::wire::{NodeStatus, NodeType, UpgradeStatus};
    use lattice_topology::{Link, LinkType, Node};
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0, 0, 4, 2, 0, last])
    }

    struct Fixture {
        app: UpgradeApp,
        outbox: mpsc::Receiver<Outbound>,
        shared: SharedState,
    }

    fn fixture() -> Fixture {
        let shared = SharedState::new_for_test();
        let (io, outbox) = test_endpoint(AppId::Upgrade);
        let opts = UpgradeOptions {
            enable_seeder: false,
            announce_ip: String::new(),
            ..Default::default()
        };
        let app = UpgradeApp::new(io, shared.clone(), opts);
        Fixture { app, outbox, shared }
    }

    fn add_online_node(fx: &Fixture, name: &str, last: u8, version: &str) {
        fx.shared
            .topology
            .write()
            .add_node(Node {
                name: name.to_owned(),
                mac_addr: Some(mac(last)),
                wlan_mac_addrs: vec![],
                node_type: NodeType::Dn,
                pop_node: false,
                status: NodeStatus::Online,
            })
            .unwrap();
        let report = StatusReport {
            status: NodeStatus::Online,
            version: version.to_owned(),
            ..Default::default()
        };
        fx.shared
            .status_reports
            .write()
            .insert(mac(last), StatusEntry::new(Instant::now(), report));
    }

    fn add_wireless_link(fx: &Fixture, a: &str, z: &str) {
        fx.shared
            .topology
            .write()
            .add_link(Link {
                name: Link::make_name(a, z),
                a_node_name: a.to_owned(),
                z_node_name: z.to_owned(),
                link_type: LinkType::Wireless,
                is_alive: true,
            })
            .unwrap();
    }

    fn set_report<F: FnOnce(&mut StatusReport)>(fx: &Fixture, last: u8, f: F) {
        let mut reports = fx.shared.status_reports.write();
        f(&mut reports.get_mut(&mac(last)).unwrap().report);
    }

    fn prepare_req(id: &str, nodes: &[&str], limit: i64, retry_limit: i32) -> UpgradeGroupReq {
        UpgradeGroupReq {
            group_type: UpgradeGroupType::Nodes,
            nodes: nodes.iter().map(|n| (*n).to_owned()).collect(),
            exclude_nodes: vec![],
            req: UpgradeReq {
                req_type: UpgradeReqType::Prepare,
                upgrade_req_id: id.to_owned(),
                md5: "f00d".to_owned(),
                image_url: "magnet:?xt=urn:btih:0".to_owned(),
                ..Default::default()
            },
            timeout: 600,
            skip_failure: true,
            skip_pop_failure: true,
            skip_links: BTreeSet::new(),
            limit,
            retry_limit,
        }
    }

    fn sent_upgrade_reqs(outbox: &mut mpsc::Receiver<Outbound>) -> Vec<(MacAddr, UpgradeReq)> {
        let mut out = Vec::new();
        while let Ok(msg) = outbox.try_recv() {
            if let Outbound::ToMinion { mac, envelope, .. } = msg {
                if envelope.mtype == MessageType::UpgradeReq {
                    out.push((mac, envelope.read().unwrap()));
                }
            }
        }
        out
    }

    #[test]
    fn prepare_batches_with_retry() {
        let mut fx = fixture();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            add_online_node(&fx, name, i as u8 + 1, "RELEASE_M40");
        }
        fx.app.pending_reqs.push_back(prepare_req("req1", &["a", "b", "c"], 2, 1));

        // batch 1 = {a, b}
        fx.app.sync_with_status_reports();
        let sent = sent_upgrade_reqs(&mut fx.outbox);
        assert_eq!(sent.len(), 2);
        assert_eq!(
            fx.app.cur_batch.as_ref().unwrap().node_names(),
            ["a", "b"].map(str::to_owned).into()
        );

        // a and b report the prepared image
        for last in [1, 2] {
            set_report(&fx, last, |r| {
                r.upgrade_status = UpgradeStatus {
                    kind: UpgradeStatusKind::Flashed,
                    next_image: ImageMeta {
                        md5: "f00d".into(),
                        version: "RELEASE_M46".into(),
                        ..Default::default()
                    },
                    upgrade_req_id: "req1".into(),
                    ..Default::default()
                };
            });
        }
        fx.app.sync_with_status_reports();
        assert!(!fx.app.cur_batch.as_ref().unwrap().pending());
        assert_eq!(fx.app.upgrade_results.get("a"), Some(&true));
        assert_eq!(fx.app.upgrade_results.get("b"), Some(&true));

        // batch 2 = {c}
        fx.app.sync_with_status_reports();
        let sent = sent_upgrade_reqs(&mut fx.outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, mac(3));

        // c fails once, gets retried
        set_report(&fx, 3, |r| {
            r.upgrade_status = UpgradeStatus {
                kind: UpgradeStatusKind::DownloadFailed,
                upgrade_req_id: "req1".into(),
                reason: "tracker unreachable".into(),
                ..Default::default()
            };
        });
        fx.app.sync_with_status_reports();
        assert_eq!(fx.app.retries.get("c"), Some(&1));

        // retried dispatch, then success
        fx.app.sync_with_status_reports();
        assert_eq!(sent_upgrade_reqs(&mut fx.outbox).len(), 1);
        set_report(&fx, 3, |r| {
            r.upgrade_status = UpgradeStatus {
                kind: UpgradeStatusKind::Flashed,
                next_image: ImageMeta {
                    md5: "f00d".into(),
                    version: "RELEASE_M46".into(),
                    ..Default::default()
                },
                upgrade_req_id: "req1".into(),
                ..Default::default()
            };
        });
        fx.app.sync_with_status_reports();
        assert_eq!(
            fx.app.upgrade_results,
            [("a", true), ("b", true), ("c", true)]
                .map(|(n, ok)| (n.to_owned(), ok))
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn commit_respects_link_adjacency() {
        let mut fx = fixture();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            add_online_node(&fx, name, i as u8 + 1, "RELEASE_M40");
        }
        add_wireless_link(&fx, "a", "b");
        add_wireless_link(&fx, "b", "c");
        // all prepared
        for last in [1, 2, 3] {
            set_report(&fx, last, |r| {
                r.upgrade_status = UpgradeStatus {
                    kind: UpgradeStatusKind::Flashed,
                    next_image: ImageMeta {
                        md5: "f00d".into(),
                        version: "RELEASE_M46".into(),
                        ..Default::default()
                    },
                    upgrade_req_id: "req2".into(),
                    ..Default::default()
                };
            });
        }
        let mut req = prepare_req("req2", &["a", "b", "c"], 2, 0);
        req.req.req_type = UpgradeReqType::Commit;
        fx.app.pending_reqs.push_back(req);

        // first commit batch: the non-adjacent endpoints {a, c}
        fx.app.sync_with_status_reports();
        let sent = sent_upgrade_reqs(&mut fx.outbox);
        assert_eq!(
            sent.iter().map(|(m, _)| *m).collect::<Vec<_>>(),
            vec![mac(1), mac(3)]
        );
        assert_eq!(
            fx.app.cur_batch.as_ref().unwrap().node_names(),
            ["a", "c"].map(str::to_owned).into()
        );

        // both reboot onto the new image, links alive
        for last in [1, 3] {
            set_report(&fx, last, |r| {
                r.version = "Lattice Release RELEASE_M46 (x)".into();
            });
        }
        fx.app.sync_with_status_reports();
        assert!(!fx.app.cur_batch.as_ref().unwrap().pending());

        // second batch: {b} via the degraded sole-path branch
        fx.app.sync_with_status_reports();
        let sent = sent_upgrade_reqs(&mut fx.outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, mac(2));
    }

    #[test]
    fn commit_waits_for_dead_links() {
        let mut fx = fixture();
        for (i, name) in ["a", "b"].iter().enumerate() {
            add_online_node(&fx, name, i as u8 + 1, "RELEASE_M40");
        }
        add_wireless_link(&fx, "a", "b");
        set_report(&fx, 1, |r| {
            r.upgrade_status = UpgradeStatus {
                kind: UpgradeStatusKind::Flashed,
                next_image: ImageMeta {
                    md5: "f00d".into(),
                    version: "RELEASE_M46".into(),
                    ..Default::default()
                },
                ..Default::default()
            };
        });
        let mut req = prepare_req("req3", &["a"], 1, 0);
        req.req.req_type = UpgradeReqType::Commit;
        fx.app.pending_reqs.push_back(req);
        fx.app.sync_with_status_reports();
        let _ = sent_upgrade_reqs(&mut fx.outbox);

        // node reports the new version but its link is down: not recovered
        fx.shared
            .topology
            .write()
            .set_link_alive(&Link::make_name("a", "b"), false)
            .unwrap();
        set_report(&fx, 1, |r| {
            r.version = "Lattice Release RELEASE_M46 (x)".into();
        });
        fx.app.sync_with_status_reports();
        assert!(fx.app.cur_batch.as_ref().unwrap().pending());

        // link restored: recovered
        fx.shared
            .topology
            .write()
            .set_link_alive(&Link::make_name("a", "b"), true)
            .unwrap();
        fx.app.sync_with_status_reports();
        assert!(!fx.app.cur_batch.as_ref().unwrap().pending());
    }

    #[test]
    fn abort_by_id_clears_pending() {
        let mut fx = fixture();
        add_online_node(&fx, "a", 1, "RELEASE_M40");
        fx.app.pending_reqs.push_back(prepare_req("keep", &["a"], 0, 0));
        fx.app.pending_reqs.push_back(prepare_req("drop", &["a"], 0, 0));
        fx.app.process_abort_req(
            AppId::Api("cli".into()),
            UpgradeAbortReq {
                abort_all: false,
                req_ids: vec!["drop".into()],
                reset_status: false,
            },
        );
        assert_eq!(fx.app.pending_reqs.len(), 1);
        assert_eq!(fx.app.pending_reqs[0].req.upgrade_req_id, "keep");

        fx.app.process_abort_req(
            AppId::Api("cli".into()),
            UpgradeAbortReq {
                abort_all: true,
                req_ids: vec![],
                reset_status: false,
            },
        );
        assert!(fx.app.pending_reqs.is_empty());
    }

    #[test]
    fn state_dump_reflects_queue() {
        let mut fx = fixture();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            add_online_node(&fx, name, i as u8 + 1, "RELEASE_M40");
        }
        fx.app.pending_reqs.push_back(prepare_req("req9", &["a", "b", "c"], 2, 0));
        fx.app.sync_with_status_reports();
        let _ = sent_upgrade_reqs(&mut fx.outbox);

        fx.app.process_state_req(AppId::Api("cli".into()));
        let dump: UpgradeStateDump = loop {
            match fx.outbox.try_recv().unwrap() {
                Outbound::ToApp { envelope, .. }
                    if envelope.mtype == MessageType::UpgradeStateDump =>
                {
                    break envelope.read().unwrap();
                }
                _ => continue,
            }
        };
        assert_eq!(dump.cur_batch, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(dump.cur_req.unwrap().req.upgrade_req_id, "req9");
        assert_eq!(dump.pending_batches, vec![vec!["c".to_owned()]]);
    }

    #[test]
    fn full_upgrade_expands_to_prepare_and_commit() {
        let mut fx = fixture();
        add_online_node(&fx, "a", 1, "RELEASE_M40");
        let mut req = prepare_req("full1", &["a"], 0, 0);
        req.req.req_type = UpgradeReqType::Full;
        fx.app.process_upgrade_group_req(AppId::Api("cli".into()), req);
        assert_eq!(fx.app.pending_reqs.len(), 2);
        assert_eq!(fx.app.pending_reqs[0].req.req_type, UpgradeReqType::Prepare);
        assert_eq!(fx.app.pending_reqs[1].req.req_type, UpgradeReqType::Commit);
        assert_eq!(fx.app.pending_reqs[0].req.upgrade_req_id, "full1");
        assert_eq!(fx.app.pending_reqs[1].req.upgrade_req_id, "full1");
    }

    #[test]
    fn request_scope_is_validated() {
        let mut fx = fixture();
        add_online_node(&fx, "a", 1, "RELEASE_M40");
        let req = prepare_req("bad", &["ghost"], 0, 0);
        fx.app.process_upgrade_group_req(AppId::Api("cli".into()), req);
        assert!(fx.app.pending_reqs.is_empty());

        let mut no_timeout = prepare_req("bad2", &["a"], 0, 0);
        no_timeout.timeout = 0;
        fx.app
            .process_upgrade_group_req(AppId::Api("cli".into()), no_timeout);
        assert!(fx.app.pending_reqs.is_empty());
    }

    #[test]
    fn golden_promotion_updates_versions_per_board() {
        let mut fx = fixture();
        // put a real image into the catalog
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("img.bin");
        let mut data = vec![0u8; catalog::IMAGE_HEADER_LEN];
        data.extend_from_slice(&[1, 2, 3, 4]);
        std::fs::write(&image_path, &data).unwrap();
        let md5 = catalog::compute_image_md5(&image_path).unwrap();
        std::fs::write(
            format!("{}.meta", image_path.display()),
            serde_json::json!({
                "version": "RELEASE_M46",
                "md5": md5.clone(),
                "hardware_board_ids": ["MB1", "MB2"],
            })
            .to_string(),
        )
        .unwrap();
        fx.app
            .catalog
            .process_image_file(&image_path, None, "", "", None)
            .unwrap();

        let mut commit = prepare_req("c1", &["a"], 0, 0);
        commit.req.req_type = UpgradeReqType::Commit;
        let req = Arc::new(commit);
        fx.app.upgrade_results.insert("a".into(), true);
        fx.app.node_to_next_image.insert(
            "a".into(),
            ImageMeta {
                version: "RELEASE_M46".into(),
                md5,
                hardware_board_ids: vec!["MB1".into(), "MB2".into()],
            },
        );
        fx.app.update_golden_image_after_upgrade(&req);

        let policy = fx.shared.controller_config.read().golden_image();
        assert_eq!(policy.versions.get("MB1").map(String::as_str), Some("RELEASE_M46"));
        assert_eq!(policy.versions.get("MB2").map(String::as_str), Some("RELEASE_M46"));
    }

    #[test]
    fn golden_loop_is_noop_while_requests_queued() {
        let mut fx = fixture();
        add_online_node(&fx, "a", 1, "RELEASE_M40");
        let mut policy = GoldenImagePolicy {
            enabled: true,
            ..Default::default()
        };
        policy.versions.insert("MB1".into(), "RELEASE_M46".into());
        fx.shared
            .controller_config
            .write()
            .set_golden_image(&policy)
            .unwrap();

        fx.app.pending_reqs.push_back(prepare_req("busy", &["a"], 0, 0));
        let before = fx.app.pending_reqs.len();
        fx.app.golden_image_upgrade();
        assert_eq!(fx.app.pending_reqs.len(), before);
    }
}
