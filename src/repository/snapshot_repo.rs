use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{write_bytes_atomic, RepositoryError};
use crate::domain::track::Track;
use crate::utils::config::SnapshotConfig;
use crate::utils::timeutil;

pub const SNAPSHOT_VERSION: u32 = 3;
pub const FORCE_SCAN_INTERVAL_DAYS: i64 = 7;

const JSON_SUFFIX: &str = "json";
const GZIP_SUFFIX: &str = "json.gz";

// When the processed-ids set grows past this, the delta cache resets itself
// instead of growing without bound.
const DELTA_PROCESSED_IDS_CAP: usize = 50_000;

/// Sidecar describing the snapshot on disk; read to decide freshness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryCacheMetadata {
    pub version: u32,
    pub last_full_scan: NaiveDateTime,
    pub library_mtime: NaiveDateTime,
    pub track_count: usize,
    pub snapshot_hash: String,
    #[serde(default)]
    pub last_force_scan_time: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryDeltaCache {
    pub last_run: NaiveDateTime,
    #[serde(default)]
    pub processed_track_ids: BTreeSet<String>,
    pub tracked_since: NaiveDateTime,
}

impl LibraryDeltaCache {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            last_run: now,
            processed_track_ids: BTreeSet::new(),
            tracked_since: now,
        }
    }

    pub fn add_processed_ids<I: IntoIterator<Item = String>>(&mut self, ids: I) {
        self.processed_track_ids.extend(ids.into_iter().filter(|id| !id.is_empty()));
    }

    pub fn should_reset(&self) -> bool {
        self.processed_track_ids.len() > DELTA_PROCESSED_IDS_CAP
    }
}

/// Owner of the three snapshot files in the cache directory: the snapshot
/// itself (JSON, optionally gzipped — the two extensions are exclusive), its
/// metadata sidecar, and the delta cache. All writes go through one lock and
/// the atomic write helper.
pub struct SnapshotRepository {
    base_path: PathBuf,
    metadata_path: PathBuf,
    delta_path: PathBuf,
    music_library_path: Option<PathBuf>,
    enabled: bool,
    delta_enabled: bool,
    compress: bool,
    compress_level: u32,
    max_age: Duration,
    write_lock: tokio::sync::Mutex<()>,
}

impl SnapshotRepository {
    pub fn new(cache_dir: &Path, config: &SnapshotConfig, music_library_path: Option<PathBuf>) -> Self {
        let mut base_path = cache_dir.join(&config.snapshot_file);
        // The configured name may carry either suffix; normalize to .json
        // and derive the compressed variant from it.
        if base_path.extension().is_some_and(|ext| ext == "gz") {
            base_path.set_extension("");
        }
        if base_path.extension().is_none_or(|ext| ext != "json") {
            base_path.set_extension(JSON_SUFFIX);
        }

        let metadata_path = base_path.with_extension("meta.json");
        let delta_path = base_path.parent().unwrap_or(Path::new(".")).join("library_delta.json");

        Self {
            base_path,
            metadata_path,
            delta_path,
            music_library_path,
            enabled: config.enabled,
            delta_enabled: config.delta_enabled,
            compress: config.compress,
            compress_level: config.compress_level.clamp(1, 9),
            max_age: Duration::hours(config.max_age_hours as i64),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_delta_enabled(&self) -> bool {
        self.enabled && self.delta_enabled
    }

    pub fn snapshot_path(&self) -> PathBuf {
        if self.compress {
            self.base_path.with_extension(GZIP_SUFFIX)
        } else {
            self.base_path.clone()
        }
    }

    pub async fn load_snapshot(&self) -> Result<Option<Vec<Track>>, RepositoryError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let mut raw = tokio::fs::read(&path).await?;
        if self.compress {
            let mut decoded = Vec::new();
            let mut decoder = GzDecoder::new(raw.as_slice());
            decoder.read_to_end(&mut decoded).map_err(|gz_err| RepositoryError::Corrupt {
                path: path.clone(),
                reason: gz_err.to_string(),
            })?;
            raw = decoded;
        }

        let tracks: Vec<Track> = serde_json::from_slice(&raw).map_err(|parse_err| RepositoryError::Corrupt {
            path: path.clone(),
            reason: parse_err.to_string(),
        })?;
        Ok(Some(tracks))
    }

    /// Persists the snapshot atomically and returns its content hash.
    pub async fn save_snapshot(&self, tracks: &[Track]) -> Result<String, RepositoryError> {
        let _guard = self.write_lock.lock().await;

        let serialized = serde_json::to_vec(tracks)?;
        let snapshot_hash = Self::compute_snapshot_hash(&serialized);

        let payload = if self.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.compress_level));
            encoder.write_all(&serialized)?;
            encoder.finish()?
        } else {
            serialized
        };

        let target = self.snapshot_path();
        tokio::task::spawn_blocking(move || write_bytes_atomic(&target, &payload))
            .await
            .map_err(|join_err| std::io::Error::other(join_err.to_string()))??;

        self.ensure_single_cache_format().await;
        log::info!("Saved library snapshot ({} tracks)", tracks.len());
        Ok(snapshot_hash)
    }

    /// A snapshot is valid when its version matches, its file exists, and
    /// either the library has not been modified since it was taken, or it is
    /// younger than the configured age cap.
    pub async fn is_snapshot_valid(&self) -> bool {
        let Some(metadata) = self.get_metadata().await else {
            log::warn!("Snapshot metadata not found at {}; treating snapshot as invalid", self.metadata_path.display());
            return false;
        };

        if metadata.version != SNAPSHOT_VERSION {
            log::warn!("Snapshot version mismatch (found {}, expected {SNAPSHOT_VERSION})", metadata.version);
            return false;
        }

        let library_mtime = match self.get_library_mtime().await {
            Ok(mtime) => mtime,
            Err(_) => {
                log::warn!("Music library path not found; treating snapshot as stale");
                return false;
            }
        };

        let library_unchanged = library_mtime <= metadata.library_mtime;
        if library_unchanged {
            log::info!(
                "Library unchanged since snapshot; using cached snapshot (age: {})",
                timeutil::utc_now_naive() - metadata.last_full_scan
            );
        } else {
            let drift = library_mtime - metadata.library_mtime;
            log::warn!("Music library was modified {:.1} seconds after snapshot creation", drift.num_milliseconds() as f64 / 1000.0);

            if self.max_age > Duration::zero() {
                let age = timeutil::utc_now_naive() - metadata.last_full_scan;
                if age > self.max_age {
                    log::warn!("Snapshot expired: age {age} exceeds {}", self.max_age);
                    return false;
                }
            }
        }

        if !self.snapshot_path().exists() {
            log::warn!("Snapshot file not found at {}", self.snapshot_path().display());
            return false;
        }

        true
    }

    pub async fn get_metadata(&self) -> Option<LibraryCacheMetadata> {
        if !self.metadata_path.exists() {
            return None;
        }

        let raw = tokio::fs::read(&self.metadata_path).await.ok()?;
        match serde_json::from_slice(&raw) {
            Ok(metadata) => Some(metadata),
            Err(parse_err) => {
                log::warn!("Failed to parse snapshot metadata: {parse_err}");
                None
            }
        }
    }

    pub async fn update_metadata(&self, metadata: &LibraryCacheMetadata) -> Result<(), RepositoryError> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(metadata)?;
        let target = self.metadata_path.clone();
        tokio::task::spawn_blocking(move || write_bytes_atomic(&target, &bytes))
            .await
            .map_err(|join_err| std::io::Error::other(join_err.to_string()))??;
        Ok(())
    }

    pub async fn load_delta(&self) -> Option<LibraryDeltaCache> {
        if !self.is_delta_enabled() || !self.delta_path.exists() {
            return None;
        }

        let raw = tokio::fs::read(&self.delta_path).await.ok()?;
        let delta: LibraryDeltaCache = match serde_json::from_slice(&raw) {
            Ok(delta) => delta,
            Err(parse_err) => {
                log::warn!("Failed to load delta cache: {parse_err}");
                return None;
            }
        };

        if delta.should_reset() {
            log::info!("Delta cache exceeded limits; resetting");
            return None;
        }
        Some(delta)
    }

    pub async fn save_delta(&self, delta: &mut LibraryDeltaCache) -> Result<(), RepositoryError> {
        if !self.is_delta_enabled() {
            return Ok(());
        }

        if delta.should_reset() {
            delta.processed_track_ids.clear();
            delta.tracked_since = timeutil::utc_now_naive();
        }

        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(delta)?;
        let target = self.delta_path.clone();
        tokio::task::spawn_blocking(move || write_bytes_atomic(&target, &bytes))
            .await
            .map_err(|join_err| std::io::Error::other(join_err.to_string()))??;
        Ok(())
    }

    /// Modification time of the watched library file, as naive UTC so it
    /// compares cleanly against snapshot timestamps regardless of the local
    /// timezone.
    pub async fn get_library_mtime(&self) -> Result<NaiveDateTime, RepositoryError> {
        let Some(path) = &self.music_library_path else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "music_library_path not configured").into());
        };

        let meta = tokio::fs::metadata(path).await?;
        let mtime = meta.modified()?;
        Ok(timeutil::system_time_to_naive_utc(mtime))
    }

    pub fn clear_snapshot(&self) -> bool {
        let path = self.snapshot_path();
        if path.exists() {
            if let Err(remove_err) = std::fs::remove_file(&path) {
                log::warn!("Failed to clear snapshot {}: {remove_err}", path.display());
                return false;
            }
            log::info!("Cleared library snapshot: {}", path.display());
            return true;
        }
        false
    }

    /// Decides between the fast id-only delta and the full metadata scan.
    /// Returns the chosen mode together with the reason for logging.
    pub async fn should_force_scan(&self, force_flag: bool) -> (bool, String) {
        if force_flag {
            return (true, "--force flag".to_string());
        }

        let Some(metadata) = self.get_metadata().await else {
            return (false, "first run (use --force to detect manual edits)".to_string());
        };
        let Some(last_force) = metadata.last_force_scan_time else {
            return (false, "first run (use --force to detect manual edits)".to_string());
        };

        let days_since = (timeutil::utc_now_naive() - last_force).num_days();
        if days_since >= FORCE_SCAN_INTERVAL_DAYS {
            (true, format!("weekly scan ({days_since} days since last force)"))
        } else {
            (false, format!("fast mode ({days_since}d since last force scan)"))
        }
    }

    pub async fn update_force_scan_time(&self) -> Result<(), RepositoryError> {
        if let Some(mut metadata) = self.get_metadata().await {
            metadata.last_force_scan_time = Some(timeutil::utc_now_naive());
            self.update_metadata(&metadata).await?;
        }
        Ok(())
    }

    pub fn compute_snapshot_hash(serialized: &[u8]) -> String {
        let digest = Sha256::digest(serialized);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    // The plain and gzipped snapshot files are mutually exclusive on disk;
    // whichever format is not in use gets removed after a save.
    async fn ensure_single_cache_format(&self) {
        let plain = self.base_path.clone();
        let compressed = self.base_path.with_extension(GZIP_SUFFIX);
        let stale = if self.compress { plain } else { compressed };

        if stale.exists() {
            if let Err(remove_err) = tokio::fs::remove_file(&stale).await {
                log::warn!("Failed to remove stale snapshot file {}: {remove_err}", stale.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_config(compress: bool) -> SnapshotConfig {
        SnapshotConfig { compress, ..SnapshotConfig::default() }
    }

    fn sample_tracks() -> Vec<Track> {
        ["1", "2", "3"]
            .iter()
            .map(|id| {
                let mut track = Track::new(*id).unwrap();
                track.name = format!("Track {id}");
                track.artist = "Artist".to_string();
                track.album = "Album".to_string();
                track
            })
            .collect()
    }

    fn metadata_now(library_mtime: NaiveDateTime) -> LibraryCacheMetadata {
        LibraryCacheMetadata {
            version: SNAPSHOT_VERSION,
            last_full_scan: timeutil::utc_now_naive(),
            library_mtime,
            track_count: 3,
            snapshot_hash: String::new(),
            last_force_scan_time: None,
        }
    }

    #[tokio::test]
    async fn test_compressed_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = SnapshotRepository::new(dir.path(), &snapshot_config(true), None);

        let tracks = sample_tracks();
        let hash = repo.save_snapshot(&tracks).await.expect("save");
        assert_eq!(hash.len(), 64);
        assert!(dir.path().join("library_snapshot.json.gz").exists());
        assert!(!dir.path().join("library_snapshot.json").exists());

        let loaded = repo.load_snapshot().await.expect("load").expect("some tracks");
        assert_eq!(loaded, tracks);
    }

    #[tokio::test]
    async fn test_plain_roundtrip_removes_gz_variant() {
        let dir = tempfile::tempdir().expect("tempdir");

        // First write compressed, then flip the config to plain.
        let gz_repo = SnapshotRepository::new(dir.path(), &snapshot_config(true), None);
        gz_repo.save_snapshot(&sample_tracks()).await.expect("save gz");

        let plain_repo = SnapshotRepository::new(dir.path(), &snapshot_config(false), None);
        plain_repo.save_snapshot(&sample_tracks()).await.expect("save plain");

        assert!(dir.path().join("library_snapshot.json").exists());
        assert!(!dir.path().join("library_snapshot.json.gz").exists());
    }

    #[tokio::test]
    async fn test_missing_snapshot_loads_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = SnapshotRepository::new(dir.path(), &snapshot_config(true), None);
        assert!(repo.load_snapshot().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_validity_requires_metadata_and_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let library = dir.path().join("Library.musicdb");
        std::fs::write(&library, b"lib").expect("library file");

        let repo = SnapshotRepository::new(dir.path(), &snapshot_config(true), Some(library));
        repo.save_snapshot(&sample_tracks()).await.expect("save");

        // No metadata yet.
        assert!(!repo.is_snapshot_valid().await);

        let mut metadata = metadata_now(timeutil::utc_now_naive() + Duration::hours(1));
        repo.update_metadata(&metadata).await.expect("meta");
        assert!(repo.is_snapshot_valid().await);

        metadata.version = SNAPSHOT_VERSION - 1;
        repo.update_metadata(&metadata).await.expect("meta");
        assert!(!repo.is_snapshot_valid().await);
    }

    #[tokio::test]
    async fn test_modified_library_invalidates_only_old_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let library = dir.path().join("Library.musicdb");
        std::fs::write(&library, b"lib").expect("library file");

        let repo = SnapshotRepository::new(dir.path(), &snapshot_config(true), Some(library));
        repo.save_snapshot(&sample_tracks()).await.expect("save");

        // Library mtime is after the recorded one, but the snapshot is fresh.
        let mut metadata = metadata_now(timeutil::utc_now_naive() - Duration::hours(1));
        repo.update_metadata(&metadata).await.expect("meta");
        assert!(repo.is_snapshot_valid().await);

        // Same drift, but the snapshot itself is past the age cap.
        metadata.last_full_scan = timeutil::utc_now_naive() - Duration::hours(48);
        repo.update_metadata(&metadata).await.expect("meta");
        assert!(!repo.is_snapshot_valid().await);
    }

    #[tokio::test]
    async fn test_force_scan_scheduling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = SnapshotRepository::new(dir.path(), &snapshot_config(true), None);

        let (force, reason) = repo.should_force_scan(true).await;
        assert!(force);
        assert!(reason.contains("--force"));

        // No metadata: first run, fast mode.
        let (force, reason) = repo.should_force_scan(false).await;
        assert!(!force);
        assert!(reason.contains("first run"));

        // Recent force scan: fast mode.
        let mut metadata = metadata_now(timeutil::utc_now_naive());
        metadata.last_force_scan_time = Some(timeutil::utc_now_naive() - Duration::days(2));
        repo.update_metadata(&metadata).await.expect("meta");
        let (force, _) = repo.should_force_scan(false).await;
        assert!(!force);

        // Stale force scan: weekly auto-force.
        metadata.last_force_scan_time = Some(timeutil::utc_now_naive() - Duration::days(8));
        repo.update_metadata(&metadata).await.expect("meta");
        let (force, reason) = repo.should_force_scan(false).await;
        assert!(force);
        assert!(reason.contains("weekly"));
    }

    #[tokio::test]
    async fn test_delta_cache_reset_on_overflow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = SnapshotRepository::new(dir.path(), &snapshot_config(true), None);

        let mut delta = LibraryDeltaCache::new(timeutil::utc_now_naive());
        delta.add_processed_ids((0..=DELTA_PROCESSED_IDS_CAP).map(|i| i.to_string()));
        assert!(delta.should_reset());

        repo.save_delta(&mut delta).await.expect("save");
        // Saving a delta past the cap clears it first.
        assert!(delta.processed_track_ids.is_empty());

        let loaded = repo.load_delta().await.expect("delta should load");
        assert!(loaded.processed_track_ids.is_empty());
    }

    #[tokio::test]
    async fn test_clear_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = SnapshotRepository::new(dir.path(), &snapshot_config(true), None);

        assert!(!repo.clear_snapshot());
        repo.save_snapshot(&sample_tracks()).await.expect("save");
        assert!(repo.clear_snapshot());
        assert!(repo.load_snapshot().await.expect("load").is_none());
    }
}
