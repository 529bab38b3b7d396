use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::agent::LibraryAgentClient;
use super::AgentError;
use crate::domain::delta::{has_track_changed, TrackDelta};
use crate::domain::track::Track;
use crate::repository::{RepositoryError, SnapshotRepository, TrackListRepository};

// Smart Delta force-scan batch settings: 200 ids per fetch, generous
// per-batch timeout.
const DELTA_BATCH_SIZE: usize = 200;
const DELTA_BATCH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Default)]
pub struct CsvSyncReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub total: usize,
}

/// Reconciles the persisted state (snapshot + CSV projection) with the live
/// library as seen through the agent.
pub struct LibrarySyncService<'a> {
    agent: &'a LibraryAgentClient,
    snapshot_repo: &'a SnapshotRepository,
}

impl<'a> LibrarySyncService<'a> {
    pub fn new(agent: &'a LibraryAgentClient, snapshot_repo: &'a SnapshotRepository) -> Self {
        Self { agent, snapshot_repo }
    }

    /// Computes the Smart Delta between the snapshot and the live library.
    ///
    /// Fast mode compares ids only (one lightweight agent call). Force mode
    /// additionally fetches the id intersection in batches and compares
    /// metadata, so manual edits invisible to ids are caught. Returns
    /// `None` when no snapshot is available to diff against.
    pub async fn compute_smart_delta(&self, force: bool) -> Result<Option<TrackDelta>, AgentError> {
        let (is_force, reason) = self.snapshot_repo.should_force_scan(force).await;
        let mode_label = if is_force { "force" } else { "fast" };
        log::info!("Smart Delta {mode_label} mode: {reason}");

        let snapshot_tracks = match self.snapshot_repo.load_snapshot().await {
            Ok(Some(tracks)) => tracks,
            Ok(None) => {
                log::warn!("No snapshot available for Smart Delta");
                return Ok(None);
            }
            Err(load_err) => {
                log::warn!("Snapshot unreadable for Smart Delta: {load_err}");
                return Ok(None);
            }
        };

        let snapshot_map: HashMap<String, Track> =
            snapshot_tracks.into_iter().map(|t| (t.id.clone(), t)).collect();
        let snapshot_ids: HashSet<&String> = snapshot_map.keys().collect();

        log::info!("Loaded snapshot with {} tracks, fetching current ids...", snapshot_ids.len());

        let current_ids_list = self.agent.fetch_all_track_ids().await?;
        if current_ids_list.is_empty() {
            log::warn!("Failed to fetch track ids from the library");
            return Ok(None);
        }
        let current_ids: HashSet<&String> = current_ids_list.iter().collect();

        let mut new_ids: Vec<String> = current_ids.difference(&snapshot_ids).map(|id| id.to_string()).collect();
        new_ids.sort();
        let mut removed_ids: Vec<String> = snapshot_ids.difference(&current_ids).map(|id| id.to_string()).collect();
        removed_ids.sort();

        log::info!(
            "Id comparison: {} new, {} removed, {} existing",
            new_ids.len(),
            removed_ids.len(),
            current_ids.intersection(&snapshot_ids).count()
        );

        let updated_ids = if is_force {
            let mut common_ids: Vec<String> = current_ids
                .intersection(&snapshot_ids)
                .map(|id| id.to_string())
                .collect();
            common_ids.sort();
            self.detect_updated_tracks(&common_ids, &snapshot_map).await?
        } else {
            log::info!("Fast mode: skipping updated detection (trusting snapshot)");
            Vec::new()
        };

        log::info!(
            "Smart Delta ({mode_label}): {} new, {} updated, {} removed",
            new_ids.len(),
            updated_ids.len(),
            removed_ids.len()
        );

        Ok(Some(TrackDelta { new_ids, updated_ids, removed_ids }))
    }

    /// Force-mode update detection over the id intersection. Tracks that
    /// fail to fetch are silently treated as unchanged.
    async fn detect_updated_tracks(
        &self,
        common_ids: &[String],
        snapshot_map: &HashMap<String, Track>,
    ) -> Result<Vec<String>, AgentError> {
        if common_ids.is_empty() {
            log::info!("No common tracks to check for updates");
            if let Err(meta_err) = self.snapshot_repo.update_force_scan_time().await {
                log::warn!("Failed to record force scan time: {meta_err}");
            }
            return Ok(Vec::new());
        }

        let total_batches = common_ids.len().div_ceil(DELTA_BATCH_SIZE);
        log::info!("Force mode: fetching {} common tracks in {total_batches} batches...", common_ids.len());

        let progress = indicatif::ProgressBar::new(total_batches as u64);
        let mut current_map: HashMap<String, Track> = HashMap::new();
        for (batch_num, batch) in common_ids.chunks(DELTA_BATCH_SIZE).enumerate() {
            match self
                .agent
                .fetch_tracks_by_ids(&batch.to_vec(), Some(DELTA_BATCH_TIMEOUT))
                .await
            {
                Ok(tracks) if tracks.is_empty() => {
                    log::warn!("Batch {}/{total_batches} returned empty, skipping", batch_num + 1);
                }
                Ok(tracks) => {
                    for track in tracks {
                        current_map.insert(track.id.clone(), track);
                    }
                }
                Err(fetch_err) => {
                    log::warn!("Batch {}/{total_batches} failed ({fetch_err}), skipping", batch_num + 1);
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        if current_map.is_empty() {
            log::warn!("Force scan: no tracks fetched successfully");
        }

        let updated_ids: Vec<String> = common_ids
            .iter()
            .filter(|id| {
                match (current_map.get(*id), snapshot_map.get(*id)) {
                    (Some(live), Some(stored)) => has_track_changed(live, stored),
                    _ => false,
                }
            })
            .cloned()
            .collect();

        log::info!(
            "Force scan found {} updated tracks (checked {}/{} common)",
            updated_ids.len(),
            current_map.len(),
            common_ids.len()
        );

        if let Err(meta_err) = self.snapshot_repo.update_force_scan_time().await {
            log::warn!("Failed to record force scan time: {meta_err}");
        }
        Ok(updated_ids)
    }

    /// Produces the current in-memory track set from a snapshot and a
    /// delta: removed tracks drop out, new and updated ones are fetched
    /// from the agent and merged in, preserving snapshot order.
    pub async fn merge_smart_delta(
        &self,
        snapshot_tracks: Vec<Track>,
        delta: &TrackDelta,
    ) -> Result<Vec<Track>, AgentError> {
        let removed: HashSet<&String> = delta.removed_ids.iter().collect();
        let mut to_fetch: Vec<String> = delta.new_ids.clone();
        to_fetch.extend(delta.updated_ids.iter().cloned());

        let mut fetched: HashMap<String, Track> = HashMap::new();
        for batch in to_fetch.chunks(DELTA_BATCH_SIZE) {
            let tracks = self.agent.fetch_tracks_by_ids(&batch.to_vec(), Some(DELTA_BATCH_TIMEOUT)).await?;
            for track in tracks {
                fetched.insert(track.id.clone(), track);
            }
        }

        let mut merged: Vec<Track> = Vec::with_capacity(snapshot_tracks.len() + delta.new_ids.len());
        let mut seen: HashSet<String> = HashSet::new();

        for track in snapshot_tracks {
            if removed.contains(&track.id) {
                continue;
            }
            seen.insert(track.id.clone());
            match fetched.remove(&track.id) {
                Some(updated) => merged.push(merge_preserving_tracking(track, updated)),
                None => merged.push(track),
            }
        }

        for id in &delta.new_ids {
            if seen.contains(id) {
                continue;
            }
            if let Some(track) = fetched.remove(id) {
                merged.push(track);
            }
        }

        Ok(merged)
    }
}

/// Replaces the library-owned fields of `stored` with the live values while
/// keeping the pipeline-owned tracking fields.
fn merge_preserving_tracking(stored: Track, live: Track) -> Track {
    let mut merged = live;
    if merged.year_before_mgu.is_empty() {
        merged.year_before_mgu = if stored.year_before_mgu.is_empty() {
            // First sight of this track's year: remember it for rollback.
            merged.year.clone()
        } else {
            stored.year_before_mgu
        };
    }
    if merged.year_set_by_mgu.is_empty() {
        merged.year_set_by_mgu = stored.year_set_by_mgu;
    }
    merged
}

/// Bidirectional CSV sync: the library-owned fields (name, artist, album,
/// genre, year, dates, status) are replaced from the live record; the
/// tracking fields (year_before_mgu, year_set_by_mgu) belong to the year
/// pipeline and survive; tracks gone from the library leave the projection.
pub fn sync_track_list_with_current(
    all_tracks: &[Track],
    csv_repo: &TrackListRepository,
) -> Result<CsvSyncReport, RepositoryError> {
    log::info!("Starting sync: fetched {} tracks; CSV file: {}", all_tracks.len(), csv_repo.path().display());

    let mut csv_map = csv_repo.load()?;
    let mut report = CsvSyncReport::default();

    let mut live_ids: HashSet<&str> = HashSet::new();
    for live in all_tracks {
        let id = live.id.trim();
        if id.is_empty() {
            continue;
        }
        live_ids.insert(id);

        match csv_map.get_mut(id) {
            None => {
                let mut new_track = live.clone();
                if new_track.year_before_mgu.is_empty() {
                    // Pre-empts a redundant fetch later: the year we see now
                    // IS the original year for rollback purposes.
                    new_track.year_before_mgu = new_track.year.clone();
                }
                csv_map.insert(id.to_string(), new_track);
                report.added += 1;
            }
            Some(csv_track) => {
                let differs = csv_track.name != live.name
                    || csv_track.artist != live.artist
                    || csv_track.album != live.album
                    || csv_track.genre != live.genre
                    || csv_track.year != live.year
                    || csv_track.date_added != live.date_added
                    || csv_track.last_modified != live.last_modified
                    || csv_track.track_status != live.track_status;

                if differs {
                    csv_track.name = live.name.clone();
                    csv_track.artist = live.artist.clone();
                    csv_track.album = live.album.clone();
                    csv_track.genre = live.genre.clone();
                    csv_track.year = live.year.clone();
                    csv_track.date_added = live.date_added.clone();
                    csv_track.last_modified = live.last_modified.clone();
                    csv_track.track_status = live.track_status.clone();
                    report.updated += 1;
                }

                if csv_track.year_before_mgu.is_empty() && !live.year.is_empty() {
                    csv_track.year_before_mgu = live.year.clone();
                }
            }
        }
    }

    let before = csv_map.len();
    csv_map.retain(|id, _| live_ids.contains(id.as_str()));
    report.removed = before - csv_map.len();
    report.total = csv_map.len();

    if report.removed > 0 {
        log::info!("Removed {} tracks from CSV that no longer exist in the library", report.removed);
    }
    log::info!("Final CSV track count after sync: {}", report.total);

    csv_repo.save(&csv_map)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_helpers::make_track;

    mod csv_sync {
        use super::*;

        fn repo_in(dir: &std::path::Path) -> TrackListRepository {
            TrackListRepository::new(dir.join("track_list.csv"))
        }

        #[test]
        fn test_new_tracks_added_with_year_seed() {
            let dir = tempfile::tempdir().expect("tempdir");
            let repo = repo_in(dir.path());

            let mut live = make_track("1", "Artist", "Album");
            live.year = "1994".to_string();

            let report = sync_track_list_with_current(&[live], &repo).expect("sync");
            assert_eq!(report.added, 1);

            let saved = repo.load().expect("load");
            assert_eq!(saved["1"].year_before_mgu, "1994");
        }

        #[test]
        fn test_tracking_fields_survive_sync() {
            let dir = tempfile::tempdir().expect("tempdir");
            let repo = repo_in(dir.path());

            let mut existing = make_track("1", "Artist", "Album");
            existing.year = "2024".to_string();
            existing.year_before_mgu = "1999".to_string();
            existing.year_set_by_mgu = "1994".to_string();
            let mut map = HashMap::new();
            map.insert("1".to_string(), existing);
            repo.save(&map).expect("seed csv");

            // The live track reports different library fields and empty
            // tracking fields (the agent never sends those).
            let mut live = make_track("1", "Artist", "Album");
            live.name = "Renamed".to_string();
            live.year = "1994".to_string();

            let report = sync_track_list_with_current(&[live], &repo).expect("sync");
            assert_eq!(report.updated, 1);

            let saved = repo.load().expect("load");
            assert_eq!(saved["1"].name, "Renamed");
            assert_eq!(saved["1"].year, "1994");
            assert_eq!(saved["1"].year_before_mgu, "1999");
            assert_eq!(saved["1"].year_set_by_mgu, "1994");
        }

        #[test]
        fn test_absent_tracks_removed() {
            let dir = tempfile::tempdir().expect("tempdir");
            let repo = repo_in(dir.path());

            let mut map = HashMap::new();
            for id in ["1", "2", "3"] {
                map.insert(id.to_string(), make_track(id, "Artist", "Album"));
            }
            repo.save(&map).expect("seed csv");

            let live = vec![make_track("1", "Artist", "Album"), make_track("3", "Artist", "Album")];
            let report = sync_track_list_with_current(&live, &repo).expect("sync");

            assert_eq!(report.removed, 1);
            let saved = repo.load().expect("load");
            assert_eq!(saved.len(), 2);
            assert!(!saved.contains_key("2"));
        }

        #[test]
        fn test_unchanged_tracks_not_counted_as_updates() {
            let dir = tempfile::tempdir().expect("tempdir");
            let repo = repo_in(dir.path());

            let track = make_track("1", "Artist", "Album");
            let mut map = HashMap::new();
            map.insert("1".to_string(), track.clone());
            repo.save(&map).expect("seed csv");

            let report = sync_track_list_with_current(&[track], &repo).expect("sync");
            assert_eq!(report.updated, 0);
            assert_eq!(report.added, 0);
            assert_eq!(report.removed, 0);
        }
    }

    #[test]
    fn test_merge_preserving_tracking() {
        let mut stored = make_track("1", "Artist", "Album");
        stored.year_before_mgu = "1990".to_string();
        stored.year_set_by_mgu = "1991".to_string();

        let mut live = make_track("1", "Artist", "Album");
        live.name = "New Name".to_string();
        live.year = "2020".to_string();

        let merged = merge_preserving_tracking(stored, live);
        assert_eq!(merged.name, "New Name");
        assert_eq!(merged.year_before_mgu, "1990");
        assert_eq!(merged.year_set_by_mgu, "1991");

        // With no stored tracking value, the live year seeds it.
        let stored_blank = make_track("2", "Artist", "Album");
        let mut live2 = make_track("2", "Artist", "Album");
        live2.year = "2005".to_string();
        let merged2 = merge_preserving_tracking(stored_blank, live2);
        assert_eq!(merged2.year_before_mgu, "2005");
    }

    #[cfg(unix)]
    mod smart_delta {
        use super::*;
        use crate::repository::SnapshotRepository;
        use crate::services::agent::FIELD_SEPARATOR;
        use crate::utils::config::{AgentConfig, SnapshotConfig};
        use crate::utils::timeutil;
        use std::os::unix::fs::PermissionsExt;

        fn write_script(dir: &std::path::Path, name: &str, body: &str) {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
            let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("chmod");
        }

        fn agent_for(dir: &std::path::Path) -> LibraryAgentClient {
            let config = AgentConfig {
                scripts_dir: dir.to_path_buf(),
                script_timeout_secs: 5,
                requests_per_window: 100,
                window_seconds: 1.0,
                max_concurrent: 4,
            };
            let client = LibraryAgentClient::new(&config).expect("client");
            client.initialize();
            client
        }

        async fn seeded_repo(dir: &std::path::Path, ids: &[&str]) -> SnapshotRepository {
            let repo = SnapshotRepository::new(dir, &SnapshotConfig::default(), None);
            let tracks: Vec<Track> = ids.iter().map(|id| make_track(id, "Artist", "Album")).collect();
            repo.save_snapshot(&tracks).await.expect("seed snapshot");
            repo
        }

        #[tokio::test]
        async fn test_fast_delta_finds_additions_and_removals() {
            let dir = tempfile::tempdir().expect("tempdir");
            // Live library has 1,3,4,5; snapshot has 1,2,3.
            write_script(dir.path(), "fetch_track_ids", r"printf '1\0353\0354\0355'");

            let repo = seeded_repo(dir.path(), &["1", "2", "3"]).await;
            let agent = agent_for(dir.path());
            let service = LibrarySyncService::new(&agent, &repo);

            let delta = service.compute_smart_delta(false).await.expect("delta").expect("some delta");
            assert_eq!(delta.new_ids, vec!["4", "5"]);
            assert_eq!(delta.removed_ids, vec!["2"]);
            assert!(delta.updated_ids.is_empty());
        }

        #[tokio::test]
        async fn test_no_snapshot_returns_none() {
            let dir = tempfile::tempdir().expect("tempdir");
            write_script(dir.path(), "fetch_track_ids", r"printf '1'");

            let repo = SnapshotRepository::new(dir.path(), &SnapshotConfig::default(), None);
            let agent = agent_for(dir.path());
            let service = LibrarySyncService::new(&agent, &repo);

            assert!(service.compute_smart_delta(false).await.expect("delta").is_none());
        }

        #[tokio::test]
        async fn test_force_mode_detects_metadata_change() {
            let dir = tempfile::tempdir().expect("tempdir");
            write_script(dir.path(), "fetch_track_ids", r"printf '42'");

            // The live record for id 42 carries a newer last_modified.
            let record: String = [
                "42",
                "Track 42",
                "Artist",
                "",
                "Album",
                "",
                "2020-01-01 09:00:00",
                "2024-06-15 08:00:00",
                "subscription",
                "",
                "",
                "",
            ]
            .join(&FIELD_SEPARATOR.to_string());
            write_script(dir.path(), "fetch_tracks_by_ids", &format!("printf '%s' '{record}'"));

            let repo = SnapshotRepository::new(dir.path(), &SnapshotConfig::default(), None);
            let mut stored = make_track("42", "Artist", "Album");
            stored.last_modified = "2024-01-01 10:00:00".to_string();
            stored.date_added = "2020-01-01 09:00:00".to_string();
            repo.save_snapshot(&[stored]).await.expect("seed snapshot");

            // Metadata with a stale force-scan time would also force; use
            // the explicit flag here.
            let agent = agent_for(dir.path());
            let service = LibrarySyncService::new(&agent, &repo);
            let delta = service.compute_smart_delta(true).await.expect("delta").expect("some delta");

            assert_eq!(delta.updated_ids, vec!["42"]);
            assert!(delta.new_ids.is_empty());
            assert!(delta.removed_ids.is_empty());
        }

        #[tokio::test]
        async fn test_merge_smart_delta_applies_changes() {
            let dir = tempfile::tempdir().expect("tempdir");

            let record: String = [
                "4",
                "Fresh Track",
                "Artist",
                "",
                "Album",
                "",
                "2025-01-01 09:00:00",
                "2025-01-01 09:00:00",
                "subscription",
                "2025",
                "",
                "",
            ]
            .join(&FIELD_SEPARATOR.to_string());
            write_script(dir.path(), "fetch_tracks_by_ids", &format!("printf '%s' '{record}'"));

            let repo = seeded_repo(dir.path(), &["1", "2"]).await;
            let agent = agent_for(dir.path());
            let service = LibrarySyncService::new(&agent, &repo);

            let delta = TrackDelta {
                new_ids: vec!["4".to_string()],
                updated_ids: vec![],
                removed_ids: vec!["2".to_string()],
            };
            let snapshot = repo.load_snapshot().await.expect("load").expect("tracks");
            let merged = service.merge_smart_delta(snapshot, &delta).await.expect("merge");

            let ids: Vec<&str> = merged.iter().map(|t| t.id.as_str()).collect();
            assert_eq!(ids, vec!["1", "4"]);
            assert_eq!(merged[1].name, "Fresh Track");
        }

        #[tokio::test]
        async fn test_force_scan_records_timestamp() {
            let dir = tempfile::tempdir().expect("tempdir");
            write_script(dir.path(), "fetch_track_ids", r"printf '1'");
            write_script(dir.path(), "fetch_tracks_by_ids", "printf ''");

            let repo = seeded_repo(dir.path(), &["1"]).await;
            let metadata = crate::repository::snapshot_repo::LibraryCacheMetadata {
                version: crate::repository::snapshot_repo::SNAPSHOT_VERSION,
                last_full_scan: timeutil::utc_now_naive(),
                library_mtime: timeutil::utc_now_naive(),
                track_count: 1,
                snapshot_hash: String::new(),
                last_force_scan_time: None,
            };
            repo.update_metadata(&metadata).await.expect("meta");

            let agent = agent_for(dir.path());
            let service = LibrarySyncService::new(&agent, &repo);
            service.compute_smart_delta(true).await.expect("delta");

            let updated = repo.get_metadata().await.expect("metadata");
            assert!(updated.last_force_scan_time.is_some());
        }
    }
}
