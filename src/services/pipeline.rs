use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;

use super::agent::LibraryAgentClient;
use super::api::ExternalApiOrchestrator;
use super::cleaner::NameCleaningService;
use super::genre::GenreManager;
use super::report;
use super::sync::{sync_track_list_with_current, LibrarySyncService};
use super::verifier::DatabaseVerifier;
use super::year_batch::YearBatchProcessor;
use super::year_resolver::YearResolver;
use super::{AgentError, PipelineError};
use crate::domain::album::AlbumTypePatterns;
use crate::domain::changelog::{ChangeLogEntry, ChangeType};
use crate::domain::track::Track;
use crate::repository::snapshot_repo::{LibraryCacheMetadata, LibraryDeltaCache, SNAPSHOT_VERSION};
use crate::repository::{
    ensure_directory, AlbumYearCache, ApiResponseCache, GenericCache, PendingVerificationStore,
    SnapshotRepository, TrackListRepository,
};
use crate::utils::config::Config;
use crate::utils::timeutil;

const FULL_FETCH_PAGE_SIZE: usize = 1000;

/// The only run initiator. Wires every service together and owns the
/// startup/shutdown sequence around a run.
pub struct Pipeline {
    config: Config,
    agent: LibraryAgentClient,
    snapshot_repo: SnapshotRepository,
    csv_repo: TrackListRepository,
    album_cache: AlbumYearCache,
    api_cache: Arc<ApiResponseCache>,
    generic_cache: Arc<GenericCache>,
    pending: Arc<PendingVerificationStore>,
    orchestrator: ExternalApiOrchestrator,
    patterns: AlbumTypePatterns,
    dry_run: bool,
}

impl Pipeline {
    pub fn new(config: Config, dry_run: bool) -> Result<Self, PipelineError> {
        ensure_directory(&config.paths.cache_dir)?;

        let agent = LibraryAgentClient::new(&config.agent)?;
        let snapshot_repo = SnapshotRepository::new(
            &config.paths.cache_dir,
            &config.caching.snapshot,
            config.paths.music_library_path.clone(),
        );
        let csv_repo = TrackListRepository::new(config.paths.csv_file.clone());
        let album_cache = AlbumYearCache::new(
            config.cache_path(&config.caching.album_cache_file),
            config.year_retrieval.logic.cache_trust_threshold,
        );
        let api_cache = Arc::new(ApiResponseCache::new(config.cache_path(&config.caching.api_cache_file)));
        let generic_cache = Arc::new(GenericCache::new(
            config.cache_path(&config.caching.generic_cache_file),
            Duration::from_secs(config.caching.default_ttl_secs),
            config.caching.max_generic_entries,
        ));
        let pending = Arc::new(PendingVerificationStore::new(
            config.cache_path(&config.caching.pending_file),
            config.year_retrieval.processing.pending_recheck_days,
            config.year_retrieval.processing.max_pending_entries,
        ));

        let orchestrator = ExternalApiOrchestrator::new(&config, Arc::clone(&api_cache), Arc::clone(&pending))?;

        let patterns = AlbumTypePatterns::from_config(&config.album_types);

        Ok(Self {
            config,
            agent,
            snapshot_repo,
            csv_repo,
            album_cache,
            api_cache,
            generic_cache,
            pending,
            orchestrator,
            patterns,
            dry_run,
        })
    }

    /// Loads persisted caches and starts background maintenance.
    pub async fn initialize(&self) -> Result<(), PipelineError> {
        self.agent.initialize();
        self.orchestrator.initialize();

        self.album_cache.load_from_disk().await?;
        self.api_cache.load_from_disk().await?;
        self.generic_cache.load_from_disk().await?;
        self.pending.load_from_disk().await?;

        self.generic_cache
            .start_cleanup_task(Duration::from_secs(self.config.caching.cleanup_interval_secs));
        Ok(())
    }

    /// Flushes every cache and stops background tasks; also the interrupt
    /// path, so it must stay best-effort.
    pub async fn shutdown(&self) {
        self.generic_cache.stop_cleanup_task();
        if let Err(save_err) = self.album_cache.save_to_disk().await {
            log::warn!("Failed to save album cache on shutdown: {save_err}");
        }
        if let Err(save_err) = self.api_cache.save_to_disk().await {
            log::warn!("Failed to save API cache on shutdown: {save_err}");
        }
        if let Err(save_err) = self.generic_cache.save_to_disk().await {
            log::warn!("Failed to save generic cache on shutdown: {save_err}");
        }
    }

    fn verifier(&self) -> DatabaseVerifier<'_> {
        DatabaseVerifier::new(
            &self.agent,
            &self.csv_repo,
            &self.config.verification,
            &self.config.incremental,
            self.config.cache_path(&self.config.paths.last_run_file),
            self.dry_run,
        )
    }

    async fn require_library(&self) -> Result<(), PipelineError> {
        if self.agent.is_library_available().await {
            Ok(())
        } else {
            Err(AgentError::Unavailable.into())
        }
    }

    /// The main incremental run: scope selection, cleaning, renames,
    /// genres, years, report, CSV sync, snapshot persist, timestamp.
    pub async fn run_main_pipeline(&self, force: bool, fresh: bool) -> Result<(), PipelineError> {
        log::info!("Starting main update pipeline");
        self.require_library().await?;

        if fresh {
            self.snapshot_repo.clear_snapshot();
        }

        let verifier = self.verifier();
        if !verifier.can_run_incremental(force) {
            return Ok(());
        }

        // Capture the library mtime BEFORE any fetch. Tracks added during
        // the fetch are not in this snapshot; recording a later mtime would
        // make the next run believe they were.
        let pre_fetch_mtime = self.snapshot_repo.get_library_mtime().await.ok();

        let (mut tracks, scope_ids, delta_empty) = self.fetch_pipeline_scope(force).await?;
        if tracks.is_empty() {
            log::warn!("No tracks found in the library");
            return Ok(());
        }
        log::info!("Found {} tracks in the library", tracks.len());

        if delta_empty && !force {
            log::info!("No new tracks to process, skipping pipeline");
            // Early exit: the last-run timestamp stays untouched so the next
            // invocation re-evaluates the same window.
            return Ok(());
        }

        let last_run_time = if force { None } else { verifier.get_last_run_timestamp() };
        let mut all_changes: Vec<ChangeLogEntry> = Vec::new();

        // Step 1: metadata cleaning on the incremental scope.
        let cleaning_changes = self.clean_in_scope(&mut tracks, &scope_ids).await;
        all_changes.extend(cleaning_changes);

        // Step 2: configured artist renames.
        if !self.config.artist_renames.is_empty() {
            let rename_changes = self.apply_artist_renames(&mut tracks, &scope_ids).await;
            all_changes.extend(rename_changes);
        } else {
            log::debug!("No artist rename mappings configured, skipping rename step");
        }

        // Step 3: genres. Needs the FULL set for dominant-genre math; the
        // manager filters writes internally.
        let genre_manager = GenreManager::new(&self.config.genre_update, &self.agent, self.dry_run);
        let genre_changes = genre_manager.update_genres(&mut tracks, last_run_time, force).await;
        all_changes.extend(genre_changes);

        // Step 4: years, also on the full set; the batch processor skips
        // albums that need nothing.
        if self.config.year_retrieval.enabled {
            let resolver = YearResolver::new(
                &self.orchestrator,
                &self.album_cache,
                &self.pending,
                &self.patterns,
                &self.config.year_retrieval.logic,
            );
            let processor = YearBatchProcessor::new(
                &resolver,
                &self.agent,
                &self.pending,
                &self.config.year_retrieval.processing,
                &self.config.year_retrieval.logic,
                self.dry_run,
            );
            let (year_changes, year_stats) = processor.process_tracks(&mut tracks).await;
            log::info!(
                "Year pass: {} albums processed, {} skipped, {} tracks updated",
                year_stats.albums_processed,
                year_stats.albums_skipped,
                year_stats.tracks_updated
            );
            all_changes.extend(year_changes);
        }

        // Report, CSV sync, snapshot, timestamp.
        report::save_changes_report(
            &all_changes,
            &self.config.paths.changes_report_file,
            self.config.reporting.timestamped_reports,
        )?;

        if !self.dry_run {
            sync_track_list_with_current(&tracks, &self.csv_repo)?;
            self.persist_snapshot(&tracks, pre_fetch_mtime, &scope_ids).await;
        }

        let processed_any = !scope_ids.is_empty() || force;
        if processed_any && !self.dry_run {
            verifier.update_last_incremental_run();
        }

        log::info!("Main update pipeline completed successfully ({} changes)", all_changes.len());
        Ok(())
    }

    /// Determines the working set: Smart Delta over the snapshot when
    /// possible, a full paged fetch otherwise. Returns the full in-memory
    /// track set, the ids in incremental scope, and whether the delta was
    /// empty.
    async fn fetch_pipeline_scope(&self, force: bool) -> Result<(Vec<Track>, HashSet<String>, bool), PipelineError> {
        if self.snapshot_repo.is_enabled() && self.snapshot_repo.is_snapshot_valid().await {
            let sync_service = LibrarySyncService::new(&self.agent, &self.snapshot_repo);
            match sync_service.compute_smart_delta(force).await {
                Ok(Some(delta)) => {
                    if let Ok(Some(snapshot_tracks)) = self.snapshot_repo.load_snapshot().await {
                        let mut scope: HashSet<String> = delta.new_ids.iter().cloned().collect();
                        scope.extend(delta.updated_ids.iter().cloned());

                        let delta_empty = delta.is_empty();
                        if delta_empty {
                            log::info!("Smart Delta: no changes detected, reusing snapshot");
                            return Ok((snapshot_tracks, scope, true));
                        }

                        log::info!(
                            "Smart Delta detected: {} new, {} updated, {} removed",
                            delta.new_ids.len(),
                            delta.updated_ids.len(),
                            delta.removed_ids.len()
                        );
                        let merged = sync_service.merge_smart_delta(snapshot_tracks, &delta).await?;
                        return Ok((merged, scope, false));
                    }
                }
                Ok(None) => log::info!("Smart Delta unavailable, falling back to full fetch"),
                Err(delta_err) => log::warn!("Smart Delta failed ({delta_err}), falling back to full fetch"),
            }
        }

        log::info!("Using batch processing for full library fetch");
        let tracks = self.agent.fetch_all_tracks(None, FULL_FETCH_PAGE_SIZE).await?;
        let scope: HashSet<String> = tracks.iter().map(|t| t.id.clone()).collect();
        Ok((tracks, scope, false))
    }

    async fn clean_in_scope(&self, tracks: &mut [Track], scope_ids: &HashSet<String>) -> Vec<ChangeLogEntry> {
        let cleaner = NameCleaningService::new(&self.config.cleaning, &self.agent, self.dry_run);

        // Pull the in-scope tracks out, clean them, then fold the results
        // back into the full set by id.
        let mut in_scope: Vec<Track> = tracks.iter().filter(|t| scope_ids.contains(&t.id)).cloned().collect();
        let changes = cleaner.process_tracks(&mut in_scope).await;

        if !changes.is_empty() {
            let cleaned_by_id: HashMap<String, Track> = in_scope.into_iter().map(|t| (t.id.clone(), t)).collect();
            for track in tracks.iter_mut() {
                if let Some(cleaned) = cleaned_by_id.get(&track.id) {
                    track.name = cleaned.name.clone();
                    track.album = cleaned.album.clone();
                }
            }
        }
        changes
    }

    async fn apply_artist_renames(&self, tracks: &mut [Track], scope_ids: &HashSet<String>) -> Vec<ChangeLogEntry> {
        let mut changes = Vec::new();

        for track in tracks.iter_mut() {
            if !scope_ids.contains(&track.id) {
                continue;
            }
            let Some(new_artist) = self.config.artist_renames.get(&track.artist) else {
                continue;
            };

            if !self.dry_run {
                if let Err(write_err) = self.agent.update_property(&track.id, "artist", new_artist).await {
                    log::warn!("Failed to rename artist on track {}: {write_err}", track.id);
                    continue;
                }
            }

            changes.push(
                ChangeLogEntry::new(ChangeType::ArtistRename, track.id.clone())
                    .with_context(track.artist.clone(), track.album.clone(), track.name.clone())
                    .with_values(track.artist.clone(), new_artist.clone())
                    .with_field("artist"),
            );
            track.artist = new_artist.clone();
        }

        if !changes.is_empty() {
            log::info!("Renamed artists for {} tracks", changes.len());
        }
        changes
    }

    async fn persist_snapshot(&self, tracks: &[Track], pre_fetch_mtime: Option<NaiveDateTime>, processed_ids: &HashSet<String>) {
        if !self.snapshot_repo.is_enabled() {
            return;
        }

        let snapshot_hash = match self.snapshot_repo.save_snapshot(tracks).await {
            Ok(hash) => hash,
            Err(save_err) => {
                log::warn!("Failed to persist snapshot: {save_err}");
                return;
            }
        };

        let now = timeutil::utc_now_naive();
        let previous = self.snapshot_repo.get_metadata().await;
        let library_mtime = match pre_fetch_mtime {
            Some(mtime) => mtime,
            None => self.snapshot_repo.get_library_mtime().await.unwrap_or(now),
        };

        let metadata = LibraryCacheMetadata {
            version: SNAPSHOT_VERSION,
            last_full_scan: now,
            library_mtime,
            track_count: tracks.len(),
            snapshot_hash,
            last_force_scan_time: previous.and_then(|m| m.last_force_scan_time),
        };
        if let Err(meta_err) = self.snapshot_repo.update_metadata(&metadata).await {
            log::warn!("Failed to persist snapshot metadata: {meta_err}");
        }

        if self.snapshot_repo.is_delta_enabled() {
            let mut delta_cache = match self.snapshot_repo.load_delta().await {
                Some(existing) => existing,
                None => LibraryDeltaCache::new(now),
            };
            delta_cache.last_run = now;
            delta_cache.add_processed_ids(processed_ids.iter().cloned());
            if let Err(delta_err) = self.snapshot_repo.save_delta(&mut delta_cache).await {
                log::warn!("Failed to persist delta cache: {delta_err}");
            }
        }
    }

    /// `clean-artist`: name cleaning for a single artist's tracks.
    pub async fn run_clean_artist(&self, artist: &str) -> Result<(), PipelineError> {
        log::info!("Starting clean operation for artist: {artist}");
        self.require_library().await?;

        let mut tracks = self.agent.fetch_all_tracks(Some(artist), FULL_FETCH_PAGE_SIZE).await?;
        if tracks.is_empty() {
            log::warn!("No tracks found for artist: {artist}");
            return Ok(());
        }
        log::info!("Found {} tracks for artist {artist}", tracks.len());

        let cleaner = NameCleaningService::new(&self.config.cleaning, &self.agent, self.dry_run);
        let changes = cleaner.process_tracks(&mut tracks).await;

        report::save_changes_report(
            &changes,
            &self.config.paths.changes_report_file,
            self.config.reporting.timestamped_reports,
        )?;

        log::info!("Clean operation complete. Updated {} tracks for artist {artist}", changes.len());
        Ok(())
    }

    /// `update-years`: the year pass alone, optionally scoped to an artist.
    pub async fn run_update_years(&self, artist: Option<&str>, _force: bool) -> Result<(), PipelineError> {
        self.require_library().await?;

        let mut tracks = self.agent.fetch_all_tracks(artist, FULL_FETCH_PAGE_SIZE).await?;
        if tracks.is_empty() {
            log::warn!("No tracks found to update");
            return Ok(());
        }

        let resolver = YearResolver::new(
            &self.orchestrator,
            &self.album_cache,
            &self.pending,
            &self.patterns,
            &self.config.year_retrieval.logic,
        );
        let processor = YearBatchProcessor::new(
            &resolver,
            &self.agent,
            &self.pending,
            &self.config.year_retrieval.processing,
            &self.config.year_retrieval.logic,
            self.dry_run,
        );
        let (changes, stats) = processor.process_tracks(&mut tracks).await;

        report::save_changes_report(
            &changes,
            &self.config.paths.changes_report_file,
            self.config.reporting.timestamped_reports,
        )?;
        if !self.dry_run {
            sync_track_list_with_current(&tracks, &self.csv_repo)?;
        }

        log::info!(
            "Year update complete: {} albums processed, {} tracks updated",
            stats.albums_processed,
            stats.tracks_updated
        );
        Ok(())
    }

    /// `revert-years`: writes `year_before_mgu` back for an artist's tracks
    /// (optionally narrowed to one album), using the CSV projection or a
    /// caller-supplied backup of it.
    pub async fn run_revert_years(
        &self,
        artist: &str,
        album: Option<&str>,
        backup_csv: Option<&std::path::Path>,
    ) -> Result<(), PipelineError> {
        self.require_library().await?;

        let source_repo = match backup_csv {
            Some(path) => TrackListRepository::new(path.to_path_buf()),
            None => TrackListRepository::new(self.csv_repo.path().clone()),
        };
        let track_map = source_repo.load()?;

        let mut changes = Vec::new();
        let mut reverted = 0usize;
        for track in track_map.values() {
            if track.artist != artist {
                continue;
            }
            if album.is_some_and(|a| track.album != a) {
                continue;
            }
            if track.year_before_mgu.is_empty() || track.year == track.year_before_mgu {
                continue;
            }

            if !self.dry_run {
                if let Err(write_err) = self.agent.update_property(&track.id, "year", &track.year_before_mgu).await {
                    log::warn!("Failed to revert year on track {}: {write_err}", track.id);
                    changes.push(
                        ChangeLogEntry::new(ChangeType::YearUpdateError, track.id.clone())
                            .with_context(track.artist.clone(), track.album.clone(), track.name.clone())
                            .with_values(track.year.clone(), track.year_before_mgu.clone())
                            .with_field("year"),
                    );
                    continue;
                }
            }

            reverted += 1;
            changes.push(
                ChangeLogEntry::new(ChangeType::YearUpdate, track.id.clone())
                    .with_context(track.artist.clone(), track.album.clone(), track.name.clone())
                    .with_values(track.year.clone(), track.year_before_mgu.clone())
                    .with_field("year"),
            );
        }

        report::save_changes_report(
            &changes,
            &self.config.paths.changes_report_file,
            self.config.reporting.timestamped_reports,
        )?;
        log::info!("Reverted years on {reverted} tracks for {artist}");
        Ok(())
    }

    /// `verify-database`: batched existence check of every CSV row.
    pub async fn run_verify_database(&self, force: bool) -> Result<usize, PipelineError> {
        log::info!("Starting database verification");
        self.require_library().await?;

        let removed = self.verifier().verify_and_clean(force).await?;
        log::info!("Database verification complete. Removed {removed} invalid tracks");
        Ok(removed)
    }

    /// `verify-pending`: re-checks albums whose deadline has passed.
    pub async fn run_verify_pending(&self) -> Result<(), PipelineError> {
        self.require_library().await?;

        let due = self.pending.get_due_entries();
        if due.is_empty() {
            log::info!("PENDING SKIP | {} pending, none due yet", self.pending.len());
            return Ok(());
        }
        log::info!("PENDING START | due: {} (total: {})", due.len(), self.pending.len());

        let mut verified = 0usize;
        let mut failed = 0usize;
        for entry in due {
            let outcome = self
                .orchestrator
                .get_album_year(&entry.artist, &entry.album, None, None)
                .await;

            let Some(year) = outcome.year else {
                failed += 1;
                if let Err(attempt_err) = self.pending.record_attempt(&entry.artist, &entry.album).await {
                    log::warn!("Failed to record verification attempt: {attempt_err}");
                }
                continue;
            };

            if self.verify_single_pending_album(&entry.artist, &entry.album, &year).await {
                verified += 1;
            } else {
                failed += 1;
                if let Err(attempt_err) = self.pending.record_attempt(&entry.artist, &entry.album).await {
                    log::warn!("Failed to record verification attempt: {attempt_err}");
                }
            }
        }

        log::info!("PENDING DONE | verified: {verified} failed: {failed}");
        Ok(())
    }

    async fn verify_single_pending_album(&self, artist: &str, album: &str, year: &str) -> bool {
        let tracks = match self.agent.fetch_all_tracks(Some(artist), FULL_FETCH_PAGE_SIZE).await {
            Ok(tracks) => tracks,
            Err(fetch_err) => {
                log::warn!("Failed to fetch tracks for pending album {artist} - {album}: {fetch_err}");
                return false;
            }
        };

        let album_track_ids: Vec<String> = tracks
            .iter()
            .filter(|t| t.album == album && t.is_editable() && t.year != year)
            .map(|t| t.id.clone())
            .collect();

        if !album_track_ids.is_empty() && !self.dry_run {
            if let Err(write_err) = self.agent.bulk_update_year(&album_track_ids, year).await {
                log::warn!("Failed to write verified year for {artist} - {album}: {write_err}");
                return false;
            }
        }

        if let Err(remove_err) = self.pending.remove_from_pending(artist, album).await {
            log::warn!("Failed to remove {artist} - {album} from pending: {remove_err}");
        }
        log::info!("Verified pending album {artist} - {album}: {year}");
        true
    }

    /// `full-sync`: complete bidirectional resync of the CSV projection.
    pub async fn run_full_sync(&self) -> Result<(), PipelineError> {
        log::info!("Starting full media library resync...");
        self.require_library().await?;

        let tracks = self.agent.fetch_all_tracks(None, FULL_FETCH_PAGE_SIZE).await?;
        if tracks.is_empty() {
            log::warn!("No tracks found in the library");
            return Ok(());
        }
        log::info!("Found {} tracks in the library", tracks.len());

        if !self.dry_run {
            let report = sync_track_list_with_current(&tracks, &self.csv_repo)?;
            log::info!(
                "Full resync completed: {} added, {} updated, {} removed, {} total",
                report.added,
                report.updated,
                report.removed,
                report.total
            );
            self.persist_snapshot(&tracks, None, &HashSet::new()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
    }

    /// A 12-field scan record with octal separators for printf.
    fn printf_record(fields: [&str; 12]) -> String {
        fields.join(r"\036")
    }

    struct Harness {
        dir: tempfile::TempDir,
        config: Config,
    }

    impl Harness {
        /// A two-track library that is already clean and internally
        /// consistent, served by shell scripts.
        fn consistent_library() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let scripts = dir.path().join("scripts");
            std::fs::create_dir_all(&scripts).expect("scripts dir");

            write_script(&scripts, "library_status", "printf 'running'");
            write_script(&scripts, "fetch_track_ids", r"printf '1\0352'");

            let rec1 = printf_record([
                "1",
                "Opening Song",
                "Artist",
                "",
                "Album",
                "Metal",
                "2020-01-01 10:00:00",
                "2020-01-01 10:00:00",
                "purchased",
                "1994",
                "1994",
                "",
            ]);
            let rec2 = printf_record([
                "2",
                "Closing Song",
                "Artist",
                "",
                "Album",
                "Metal",
                "2020-01-02 10:00:00",
                "2020-01-02 10:00:00",
                "purchased",
                "1994",
                "1994",
                "",
            ]);
            write_script(
                &scripts,
                "fetch_tracks",
                &format!(r#"if [ "$2" = "0" ]; then printf '{rec1}\035{rec2}'; fi"#),
            );
            write_script(&scripts, "fetch_tracks_by_ids", "printf ''");
            write_script(&scripts, "update_property", "printf '%s %s %s\\n' \"$1\" \"$2\" \"$3\" >> \"$(dirname \"$0\")/writes.log\"");
            write_script(&scripts, "bulk_update_year", "printf '%s %s\\n' \"$1\" \"$2\" >> \"$(dirname \"$0\")/writes.log\"; printf '1'");

            let mut config = Config::default();
            config.agent.scripts_dir = scripts;
            config.paths.cache_dir = dir.path().join("cache");
            config.paths.csv_file = dir.path().join("csv/track_list.csv");
            config.paths.changes_report_file = dir.path().join("csv/changes_report.csv");
            config.paths.last_run_file = dir.path().join("last_incremental_run.log");
            // Keep the pipeline off the network: years resolve locally from
            // the dominant year.
            config.year_retrieval.retries.max_retries = 0;

            Self { dir, config }
        }

        async fn pipeline(&self) -> Pipeline {
            let pipeline = Pipeline::new(self.config.clone(), false).expect("pipeline");
            pipeline.initialize().await.expect("initialize");
            pipeline
        }

        fn writes_log(&self) -> String {
            std::fs::read_to_string(self.config.agent.scripts_dir.join("writes.log")).unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn test_first_run_builds_snapshot_and_csv_with_no_changes() {
        let harness = Harness::consistent_library();
        let pipeline = harness.pipeline().await;

        pipeline.run_main_pipeline(false, false).await.expect("run");
        pipeline.shutdown().await;

        // The snapshot and its metadata landed in the cache dir.
        assert!(harness.config.paths.cache_dir.join("library_snapshot.json.gz").exists());
        assert!(harness.config.paths.cache_dir.join("library_snapshot.meta.json").exists());

        // The CSV projection has both tracks with the year seed recorded.
        let csv_repo = TrackListRepository::new(harness.config.paths.csv_file.clone());
        let rows = csv_repo.load().expect("csv");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows["1"].year_before_mgu, "1994");

        // A consistent library produces zero changes and no report file.
        assert!(!harness.config.paths.changes_report_file.exists());
        assert_eq!(harness.writes_log(), "");

        // The run processed tracks, so the timestamp was recorded.
        assert!(harness.config.cache_path(&harness.config.paths.last_run_file).exists());
    }

    #[tokio::test]
    async fn test_second_run_within_interval_is_skipped() {
        let harness = Harness::consistent_library();
        let pipeline = harness.pipeline().await;

        pipeline.run_main_pipeline(false, false).await.expect("first run");
        let stamp_path = harness.config.cache_path(&harness.config.paths.last_run_file);
        let first_stamp = std::fs::read_to_string(&stamp_path).expect("stamp");

        // Interval gate: the second run does nothing and keeps the stamp.
        pipeline.run_main_pipeline(false, false).await.expect("second run");
        assert_eq!(std::fs::read_to_string(&stamp_path).expect("stamp"), first_stamp);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_forced_second_run_is_idempotent() {
        let harness = Harness::consistent_library();
        let pipeline = harness.pipeline().await;

        pipeline.run_main_pipeline(true, false).await.expect("first run");
        pipeline.run_main_pipeline(true, false).await.expect("second run");
        pipeline.shutdown().await;

        // Two forced runs over an unchanged consistent library never write.
        assert_eq!(harness.writes_log(), "");
        assert!(!harness.config.paths.changes_report_file.exists());
    }

    #[tokio::test]
    async fn test_genre_alignment_produces_changes_and_report() {
        let harness = Harness::consistent_library();

        // Re-point the scan at a library where track 2 disagrees on genre.
        let scripts = harness.config.agent.scripts_dir.clone();
        let rec1 = printf_record([
            "1", "One", "Artist", "", "Album", "Metal",
            "2020-01-01 10:00:00", "2020-01-01 10:00:00", "purchased", "1994", "1994", "",
        ]);
        let rec2 = printf_record([
            "2", "Two", "Artist", "", "Album", "Metal",
            "2020-01-02 10:00:00", "2020-01-02 10:00:00", "purchased", "1994", "1994", "",
        ]);
        let rec3 = printf_record([
            "3", "Three", "Artist", "", "Album", "Rock",
            "2020-01-03 10:00:00", "2020-01-03 10:00:00", "purchased", "1994", "1994", "",
        ]);
        write_script(
            &scripts,
            "fetch_tracks",
            &format!(r#"if [ "$2" = "0" ]; then printf '{rec1}\035{rec2}\035{rec3}'; fi"#),
        );

        let pipeline = harness.pipeline().await;
        pipeline.run_main_pipeline(true, false).await.expect("run");
        pipeline.shutdown().await;

        // Track 3 got its genre aligned through the agent.
        assert!(harness.writes_log().contains("3 genre Metal"));

        let report = report::load_changes_report(&harness.config.paths.changes_report_file).expect("report");
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].change_type, ChangeType::GenreUpdate);
        assert_eq!(report[0].track_id, "3");
    }

    #[tokio::test]
    async fn test_unavailable_library_is_fatal() {
        let harness = Harness::consistent_library();
        write_script(&harness.config.agent.scripts_dir, "library_status", "printf 'stopped'");

        let pipeline = harness.pipeline().await;
        let result = pipeline.run_main_pipeline(false, false).await;
        assert!(matches!(result, Err(PipelineError::Agent(AgentError::Unavailable))));
    }

    #[tokio::test]
    async fn test_artist_rename_applied_in_scope() {
        let harness = Harness::consistent_library();
        let mut config = harness.config.clone();
        config
            .artist_renames
            .insert("Artist".to_string(), "Renamed Artist".to_string());

        let pipeline = Pipeline::new(config.clone(), false).expect("pipeline");
        pipeline.initialize().await.expect("initialize");
        pipeline.run_main_pipeline(true, false).await.expect("run");
        pipeline.shutdown().await;

        let log = harness.writes_log();
        assert!(log.contains("1 artist Renamed Artist"));
        assert!(log.contains("2 artist Renamed Artist"));

        let report = report::load_changes_report(&config.paths.changes_report_file).expect("report");
        assert!(report.iter().any(|c| c.change_type == ChangeType::ArtistRename));
    }

    #[tokio::test]
    async fn test_full_sync_populates_csv() {
        let harness = Harness::consistent_library();
        let pipeline = harness.pipeline().await;

        pipeline.run_full_sync().await.expect("full sync");
        pipeline.shutdown().await;

        let csv_repo = TrackListRepository::new(harness.config.paths.csv_file.clone());
        assert_eq!(csv_repo.load().expect("csv").len(), 2);
    }

    #[tokio::test]
    async fn test_revert_years_writes_back_original() {
        let harness = Harness::consistent_library();
        let pipeline = harness.pipeline().await;

        // Seed a projection where the pipeline had changed a year.
        let csv_repo = TrackListRepository::new(harness.config.paths.csv_file.clone());
        let mut track = crate::services::test_helpers::make_track("1", "Artist", "Album");
        track.year = "1994".to_string();
        track.year_before_mgu = "2001".to_string();
        let mut map = std::collections::HashMap::new();
        map.insert("1".to_string(), track);
        csv_repo.save(&map).expect("seed csv");

        pipeline.run_revert_years("Artist", None, None).await.expect("revert");
        pipeline.shutdown().await;

        assert!(harness.writes_log().contains("1 year 2001"));
    }

    #[tokio::test]
    async fn test_dirty_dir_does_not_leak_tmp_files() {
        let harness = Harness::consistent_library();
        let pipeline = harness.pipeline().await;
        pipeline.run_main_pipeline(true, false).await.expect("run");
        pipeline.shutdown().await;

        let leftovers: Vec<_> = walk(&harness.dir.path().to_path_buf())
            .into_iter()
            .filter(|p| p.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    fn walk(root: &std::path::PathBuf) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    out.extend(walk(&path));
                } else {
                    out.push(path);
                }
            }
        }
        out
    }
}
