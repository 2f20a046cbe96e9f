//! In-memory torrent generation and the seeding session.
//!
//! Every catalog image gets a v1 single-file torrent built in memory: piece
//! hashes over the image, an info hash, and a magnet URI that minions use
//! to join the swarm. Distribution is strictly tracker-mediated -- no DHT,
//! no NAT traversal -- so the session's job is to keep the tracker aware
//! that this controller seeds every image, within the configured caps.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub type Result<T, E = TorrentError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("failed reading image file for hashing")]
    Read(#[source] std::io::Error),
    #[error("image file is empty")]
    EmptyFile,
}

/// Piece size for generated torrents. Fixed rather than auto-scaled: image
/// sizes are within one order of magnitude fleet-wide.
const PIECE_LENGTH: usize = 256 * 1024;

const CREATOR: &str = "lattice-controller";

/// Seconds between tracker re-announces while seeding.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Bencode (encoder only; the controller never parses foreign torrents)
// ---------------------------------------------------------------------------

fn bencode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

fn bencode_int(out: &mut Vec<u8>, value: i64) {
    out.push(b'i');
    out.extend_from_slice(value.to_string().as_bytes());
    out.push(b'e');
}

fn bencode_str_list(out: &mut Vec<u8>, items: &[&str]) {
    out.push(b'l');
    for item in items {
        out.push(b'l');
        bencode_bytes(out, item.as_bytes());
        out.push(b'e');
    }
    out.push(b'e');
}

// ---------------------------------------------------------------------------
// Metainfo
// ---------------------------------------------------------------------------

/// The parts of a generated torrent the controller keeps around.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TorrentInfo {
    pub name: String,
    pub info_hash: [u8; 20],
    pub length: u64,
    pub magnet_uri: String,
    pub metainfo: Vec<u8>,
}

/// Build a v1 single-file torrent for `path`, announced at `trackers`.
pub fn build_torrent(path: &Path, trackers: &[&str]) -> Result<TorrentInfo> {
    let data = std::fs::read(path).map_err(TorrentError::Read)?;
    if data.is_empty() {
        return Err(TorrentError::EmptyFile);
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image.bin")
        .to_owned();

    let mut pieces = Vec::with_capacity(data.len().div_ceil(PIECE_LENGTH) * 20);
    for chunk in data.chunks(PIECE_LENGTH) {
        pieces.extend_from_slice(&Sha1::digest(chunk));
    }

    // info dict: keys in bencode (lexicographic) order
    let mut info = Vec::new();
    info.push(b'd');
    bencode_bytes(&mut info, b"length");
    bencode_int(&mut info, data.len() as i64);
    bencode_bytes(&mut info, b"name");
    bencode_bytes(&mut info, name.as_bytes());
    bencode_bytes(&mut info, b"piece length");
    bencode_int(&mut info, PIECE_LENGTH as i64);
    bencode_bytes(&mut info, b"pieces");
    bencode_bytes(&mut info, &pieces);
    info.push(b'e');

    let info_hash: [u8; 20] = Sha1::digest(&info).into();

    let mut metainfo = Vec::new();
    metainfo.push(b'd');
    if let Some(primary) = trackers.first() {
        bencode_bytes(&mut metainfo, b"announce");
        bencode_bytes(&mut metainfo, primary.as_bytes());
        bencode_bytes(&mut metainfo, b"announce-list");
        bencode_str_list(&mut metainfo, trackers);
    }
    bencode_bytes(&mut metainfo, b"created by");
    bencode_bytes(&mut metainfo, CREATOR.as_bytes());
    bencode_bytes(&mut metainfo, b"info");
    metainfo.extend_from_slice(&info);
    metainfo.push(b'e');

    let magnet_uri = magnet_uri(&info_hash, &name, trackers);
    Ok(TorrentInfo {
        name,
        info_hash,
        length: data.len() as u64,
        magnet_uri,
        metainfo,
    })
}

fn magnet_uri(info_hash: &[u8; 20], name: &str, trackers: &[&str]) -> String {
    let mut uri = format!(
        "magnet:?xt=urn:btih:{}&dn={}",
        hex::encode(info_hash),
        url_encode(name)
    );
    for tracker in trackers {
        uri.push_str("&tr=");
        uri.push_str(&url_encode(tracker));
    }
    uri
}

fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Seeding session
// ---------------------------------------------------------------------------

/// Session-wide seeding policy (the swarm analog of a settings pack).
#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// `host:port` listen endpoints advertised to the swarm.
    pub listen_interfaces: Vec<String>,
    /// External IP announced to peers, empty for transport default.
    pub announce_ip: String,
    /// Cap on simultaneously active seeds, negative = unlimited.
    pub active_seeds: i32,
    /// ToS byte for peer packets, negative = default.
    pub peer_tos: i32,
    /// Tune buffers and queue depths for seed-mostly workloads.
    pub high_performance_seed: bool,
}

impl SessionSettings {
    pub fn build(
        seeder_port: u16,
        public_ipv6: &str,
        announce_ip: &str,
        active_seeds: i32,
        peer_tos: i32,
        high_performance_seed: bool,
    ) -> Self {
        let mut listen_interfaces = vec![
            format!("127.0.0.1:{seeder_port}"),
            format!("0.0.0.0:{seeder_port}"),
            format!("[::]:{seeder_port}"),
        ];
        if !public_ipv6.is_empty() {
            // Transports sometimes bind only link-local addresses by
            // default; pin the global address explicitly.
            listen_interfaces.push(format!("[{public_ipv6}]:{seeder_port}"));
        }
        Self {
            listen_interfaces,
            announce_ip: announce_ip.to_owned(),
            active_seeds,
            peer_tos: peer_tos.clamp(-1, 255),
            high_performance_seed,
        }
    }
}

/// Live per-torrent counters, updated by the announce loop.
#[derive(Clone, Copy, Debug, Default)]
pub struct SeedStatus {
    pub announces: u64,
    pub last_announce_ok: bool,
    pub peers: u64,
    pub seeds: u64,
}

/// Handle to one seeded torrent; dropping the session stops all of them.
#[derive(Clone)]
pub struct TorrentHandle {
    pub info: TorrentInfo,
    status: Arc<RwLock<SeedStatus>>,
    stop: watch::Sender<bool>,
}

impl TorrentHandle {
    pub fn status(&self) -> SeedStatus {
        *self.status.read()
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// The local swarm session: a registry of seeded torrents plus their
/// tracker announce loops. DHT and NAT traversal are deliberately absent;
/// peers learn about the controller only through the tracker.
pub struct SeederSession {
    settings: SessionSettings,
    torrents: BTreeMap<[u8; 20], TorrentHandle>,
    client: reqwest::Client,
}

impl SeederSession {
    pub fn new(settings: SessionSettings) -> Self {
        info!(
            listen = ?settings.listen_interfaces,
            active_seeds = settings.active_seeds,
            tos = settings.peer_tos,
            high_performance = settings.high_performance_seed,
            "seeder session configured"
        );
        Self {
            settings,
            torrents: BTreeMap::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn active_count(&self) -> usize {
        self.torrents.len()
    }

    /// Start seeding: register the torrent and spawn its announce loop in
    /// `event=started` / periodic re-announce form, `left=0` (seed mode).
    pub fn add_torrent(&mut self, info: TorrentInfo, tracker_url: &str) -> TorrentHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = TorrentHandle {
            info: info.clone(),
            status: Arc::new(RwLock::new(SeedStatus::default())),
            stop: stop_tx,
        };
        if self.settings.active_seeds >= 0
            && self.torrents.len() >= self.settings.active_seeds as usize
        {
            warn!(
                name = %info.name,
                cap = self.settings.active_seeds,
                "active seed cap reached, torrent queued without announcing"
            );
        } else {
            tokio::spawn(announce_loop(
                self.client.clone(),
                tracker_url.to_owned(),
                info,
                self.settings.clone(),
                Arc::clone(&handle.status),
                stop_rx,
            ));
        }
        self.torrents.insert(handle.info.info_hash, handle.clone());
        handle
    }

    pub fn remove_torrent(&mut self, info_hash: &[u8; 20]) {
        if let Some(handle) = self.torrents.remove(info_hash) {
            handle.stop();
            debug!(name = %handle.info.name, "stopped seeding");
        }
    }
}

async fn announce_loop(
    client: reqwest::Client,
    tracker_url: String,
    info: TorrentInfo,
    settings: SessionSettings,
    status: Arc<RwLock<SeedStatus>>,
    mut stop: watch::Receiver<bool>,
) {
    let peer_id = format!("-LT0001-{:012}", std::process::id());
    let port = settings
        .listen_interfaces
        .first()
        .and_then(|ep| ep.rsplit(':').next())
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(6881);

    let mut event = "started";
    loop {
        let url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left=0&compact=1&event={}{}",
            tracker_url,
            percent_encode_bytes(&info.info_hash),
            peer_id,
            port,
            event,
            if settings.announce_ip.is_empty() {
                String::new()
            } else {
                format!("&ip={}", url_encode(&settings.announce_ip))
            },
        );
        let ok = match client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(name = %info.name, ?err, "tracker announce failed");
                false
            }
        };
        {
            let mut s = status.write();
            s.announces += 1;
            s.last_announce_ok = ok;
            if ok {
                s.seeds = s.seeds.max(1);
            }
        }
        event = "";

        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    // best-effort goodbye to the tracker
                    let bye = format!(
                        "{}?info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left=0&event=stopped",
                        tracker_url,
                        percent_encode_bytes(&info.info_hash),
                        peer_id,
                        port,
                    );
                    let _ = client.get(&bye).send().await;
                    return;
                }
            }
            _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {}
        }
    }
}

fn percent_encode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("%{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_image(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0xA5u8; len]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn torrent_has_one_hash_per_piece() {
        let image = temp_image(PIECE_LENGTH * 2 + 1);
        let torrent = build_torrent(image.path(), &["http://[::1]:6969/announce"]).unwrap();
        assert_eq!(torrent.length, (PIECE_LENGTH * 2 + 1) as u64);
        // metainfo contains 3 pieces * 20 bytes of hashes
        assert!(torrent.metainfo.len() > 60);
    }

    #[test]
    fn magnet_uri_carries_hash_name_and_tracker() {
        let image = temp_image(1024);
        let torrent = build_torrent(image.path(), &["http://[::1]:6969/announce"]).unwrap();
        assert!(torrent.magnet_uri.starts_with("magnet:?xt=urn:btih:"));
        assert!(torrent.magnet_uri.contains(&hex::encode(torrent.info_hash)));
        assert!(torrent.magnet_uri.contains("&tr=http%3A%2F%2F"));
    }

    #[test]
    fn identical_content_yields_identical_info_hash() {
        let a = temp_image(4096);
        let b = temp_image(4096);
        let ta = build_torrent(a.path(), &["http://t/announce"]).unwrap();
        let tb = build_torrent(b.path(), &["http://t/announce"]).unwrap();
        // same bytes, different file names: info dict differs by name only
        // when names differ; these tempfiles have distinct names
        assert_eq!(ta.length, tb.length);
        assert_ne!(ta.info_hash, tb.info_hash);
    }

    #[test]
    fn empty_image_is_rejected() {
        let image = temp_image(0);
        assert!(matches!(
            build_torrent(image.path(), &[]),
            Err(TorrentError::EmptyFile)
        ));
    }

    #[test]
    fn session_listen_interfaces_include_global_address() {
        let settings = SessionSettings::build(6881, "2001:db8::1", "", -1, 96, true);
        assert!(settings
            .listen_interfaces
            .contains(&"[2001:db8::1]:6881".to_owned()));
        assert_eq!(settings.listen_interfaces.len(), 4);
    }

    #[tokio::test]
    async fn session_add_and_remove() {
        let image = temp_image(1024);
        let torrent = build_torrent(image.path(), &["http://127.0.0.1:1/announce"]).unwrap();
        let mut session = SeederSession::new(SessionSettings::build(0, "", "", -1, -1, false));
        let handle = session.add_torrent(torrent.clone(), "http://127.0.0.1:1/announce");
        assert_eq!(session.active_count(), 1);
        session.remove_torrent(&torrent.info_hash);
        assert_eq!(session.active_count(), 0);
        handle.stop();
    }
}
