//! The upgrade image catalog.
//!
//! Images land in a local directory (startup scan or by-URL upload), get
//! their metadata extracted and their payload MD5 verified, and are then
//! seeded to the fleet. Version strings are unique in the catalog; an image
//! failing MD5 verification never enters it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::{error, info, warn};

use lattice_primitives::wire::{ImageMeta, UpgradeImage};

use super::torrent::{self, SeederSession, TorrentHandle};

pub type Result<T, E = CatalogError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed reading image metadata sidecar")]
    MetaRead(#[source] std::io::Error),
    #[error("failed parsing image metadata")]
    MetaParse(#[source] serde_json::Error),
    #[error("image with duplicate version `{0}`")]
    Duplicate(String),
    #[error("image MD5 mismatch: expected {expected}, computed {computed}")]
    Md5Mismatch { expected: String, computed: String },
    #[error("failed reading image payload")]
    Read(#[source] std::io::Error),
    #[error("failed generating torrent")]
    Torrent(#[from] torrent::TorrentError),
    #[error("image not found")]
    NotFound,
}

/// Upgrade images carry a signed header ahead of the payload; the catalog
/// MD5 covers only the payload, matching what nodes compute after download.
pub const IMAGE_HEADER_LEN: usize = 16 * 1024;

/// File extension of upgrade images in the image directory.
pub const IMAGE_FILE_EXTENSION: &str = "bin";

#[derive(Clone)]
pub struct ImageEntry {
    pub image: UpgradeImage,
    pub path: PathBuf,
    pub torrent: Option<TorrentHandle>,
}

#[derive(Default)]
pub struct ImageCatalog {
    images: BTreeMap<String, ImageEntry>,
}

impl ImageCatalog {
    pub fn get(&self, version: &str) -> Option<&ImageEntry> {
        self.images.get(version)
    }

    pub fn contains(&self, version: &str) -> bool {
        self.images.contains_key(version)
    }

    pub fn find_by_md5(&self, md5: &str) -> Option<&ImageEntry> {
        self.images.values().find(|e| e.image.md5 == md5)
    }

    pub fn find_by_magnet(&self, magnet: &str) -> Option<&ImageEntry> {
        self.images.values().find(|e| e.image.magnet_uri == magnet)
    }

    pub fn list(&self) -> Vec<UpgradeImage> {
        self.images.values().map(|e| e.image.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ImageEntry)> {
        self.images.iter()
    }

    /// Run the full ingest pipeline on one file already in the image
    /// directory: sidecar metadata, duplicate check, MD5 verification,
    /// torrent generation + seeding, mirror URL. Returns the image name
    /// (its version string).
    pub fn process_image_file(
        &mut self,
        path: &Path,
        seeder: Option<&mut SeederSession>,
        tracker_url: &str,
        local_tracker_url: &str,
        http_base: Option<&str>,
    ) -> Result<String> {
        let meta = read_image_meta(path)?;
        let name = meta.version.clone();
        if self.images.contains_key(&name) {
            return Err(CatalogError::Duplicate(name));
        }
        verify_image_md5(path, &meta.md5)?;

        let mut magnet = String::new();
        let mut handle = None;
        if let Some(seeder) = seeder {
            let mut trackers: Vec<&str> = vec![tracker_url];
            if !local_tracker_url.is_empty() {
                trackers.push(local_tracker_url);
            }
            let torrent_info = torrent::build_torrent(path, &trackers)?;
            magnet = torrent_info.magnet_uri.clone();
            // The controller announces to its local tracker alias when one
            // is configured; nodes use the external URL from the magnet.
            let announce_to = if local_tracker_url.is_empty() {
                tracker_url
            } else {
                local_tracker_url
            };
            let h = seeder.add_torrent(torrent_info, announce_to);
            info!(image = %name, magnet = %magnet, "seeding image");
            handle = Some(h);
        }

        let http_uri = http_base.and_then(|base| {
            let file_name = path.file_name()?.to_str()?;
            Some(format!("{base}/{file_name}"))
        });
        if let Some(uri) = &http_uri {
            info!(image = %name, uri = %uri, "hosting image over HTTP");
        }

        let entry = ImageEntry {
            image: UpgradeImage {
                name: name.clone(),
                magnet_uri: magnet,
                http_uri,
                md5: meta.md5,
                hardware_board_ids: meta.hardware_board_ids,
            },
            path: path.to_owned(),
            torrent: handle,
        };
        self.images.insert(name.clone(), entry);
        Ok(name)
    }

    /// Drop an image: stop seeding and delete the file and its sidecar.
    pub fn delete(&mut self, name: &str, seeder: Option<&mut SeederSession>) -> Result<()> {
        let entry = self.images.remove(name).ok_or(CatalogError::NotFound)?;
        if let (Some(seeder), Some(handle)) = (seeder, &entry.torrent) {
            seeder.remove_torrent(&handle.info.info_hash);
        }
        if let Err(err) = std::fs::remove_file(&entry.path) {
            warn!(image = %name, ?err, "failed removing image file");
        }
        let _ = std::fs::remove_file(meta_path(&entry.path));
        info!(image = %name, category = "upgrade", "deleted image");
        Ok(())
    }

    /// Verify P3 for one entry: the MD5 on disk still matches the catalog.
    pub fn verify_entry(&self, name: &str) -> Result<()> {
        let entry = self.images.get(name).ok_or(CatalogError::NotFound)?;
        verify_image_md5(&entry.path, &entry.image.md5)
    }
}

fn meta_path(image_path: &Path) -> PathBuf {
    let mut os = image_path.as_os_str().to_owned();
    os.push(".meta");
    PathBuf::from(os)
}

/// Image metadata rides in a JSON sidecar written by the image build
/// (`<image>.meta`), extracted at ingest.
pub fn read_image_meta(image_path: &Path) -> Result<ImageMeta> {
    let contents = std::fs::read_to_string(meta_path(image_path)).map_err(CatalogError::MetaRead)?;
    serde_json::from_str(&contents).map_err(CatalogError::MetaParse)
}

/// MD5 of the payload after the signed header.
pub fn compute_image_md5(path: &Path) -> Result<String> {
    let data = std::fs::read(path).map_err(CatalogError::Read)?;
    let payload = data.get(IMAGE_HEADER_LEN.min(data.len())..).unwrap_or(&[]);
    Ok(hex::encode(Md5::digest(payload)))
}

pub fn verify_image_md5(path: &Path, expected: &str) -> Result<()> {
    let computed = compute_image_md5(path)?;
    if computed != expected {
        error!(?path, expected, computed, "image failed MD5 verification");
        return Err(CatalogError::Md5Mismatch {
            expected: expected.to_owned(),
            computed,
        });
    }
    Ok(())
}

/// Free bytes on the filesystem holding `path`.
pub fn free_disk_bytes(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bsize as u64 * stat.f_bavail as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_image(dir: &Path, file: &str, version: &str) -> PathBuf {
        let path = dir.join(file);
        let mut data = vec![0u8; IMAGE_HEADER_LEN];
        data.extend_from_slice(version.as_bytes());
        data.extend_from_slice(&[0x5A; 4096]);
        fs::write(&path, &data).unwrap();
        let md5 = compute_image_md5(&path).unwrap();
        let meta = serde_json::json!({
            "version": version,
            "md5": md5,
            "hardware_board_ids": ["MB1"],
        });
        fs::write(meta_path(&path), meta.to_string()).unwrap();
        path
    }

    #[test]
    fn ingest_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "a.bin", "RELEASE_M45");
        let mut catalog = ImageCatalog::default();
        let name = catalog
            .process_image_file(&path, None, "", "", Some("http://[2001:db8::1]/images"))
            .unwrap();
        assert_eq!(name, "RELEASE_M45");
        let images = catalog.list();
        assert_eq!(images.len(), 1);
        assert_eq!(
            images[0].http_uri.as_deref(),
            Some("http://[2001:db8::1]/images/a.bin")
        );
        catalog.verify_entry("RELEASE_M45").unwrap();
    }

    #[test]
    fn duplicate_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_image(dir.path(), "a.bin", "RELEASE_M45");
        let b = write_image(dir.path(), "b.bin", "RELEASE_M45");
        let mut catalog = ImageCatalog::default();
        catalog.process_image_file(&a, None, "", "", None).unwrap();
        assert!(matches!(
            catalog.process_image_file(&b, None, "", "", None),
            Err(CatalogError::Duplicate(_))
        ));
    }

    #[test]
    fn corrupted_payload_fails_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "a.bin", "RELEASE_M45");
        // flip one payload byte after the sidecar was written
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, data).unwrap();

        let mut catalog = ImageCatalog::default();
        assert!(matches!(
            catalog.process_image_file(&path, None, "", "", None),
            Err(CatalogError::Md5Mismatch { .. })
        ));
        assert!(catalog.list().is_empty());
    }

    #[test]
    fn header_is_excluded_from_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "a.bin", "RELEASE_M45");
        let before = compute_image_md5(&path).unwrap();
        // corrupting the signed header does not change the payload MD5
        let mut data = fs::read(&path).unwrap();
        data[0] ^= 0xFF;
        fs::write(&path, data).unwrap();
        assert_eq!(compute_image_md5(&path).unwrap(), before);
    }

    #[test]
    fn delete_removes_file_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "a.bin", "RELEASE_M45");
        let mut catalog = ImageCatalog::default();
        catalog.process_image_file(&path, None, "", "", None).unwrap();
        catalog.delete("RELEASE_M45", None).unwrap();
        assert!(!path.exists());
        assert!(!meta_path(&path).exists());
        assert!(matches!(
            catalog.delete("RELEASE_M45", None),
            Err(CatalogError::NotFound)
        ));
    }

    #[test]
    fn free_disk_bytes_reports_something() {
        assert!(free_disk_bytes(Path::new("/")).unwrap_or(0) > 0);
    }
}
