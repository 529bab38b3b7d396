use std::collections::BTreeMap;

use chrono::Datelike;
use futures::future::join_all;

use super::agent::LibraryAgentClient;
use super::api;
use super::year_resolver::{AlbumYearSource, YearResolver};
use crate::domain::album::YearHandlingStrategy;
use crate::domain::changelog::{ChangeLogEntry, ChangeType};
use crate::domain::track::Track;
use crate::repository::PendingVerificationStore;
use crate::utils::config::{LogicConfig, ProcessingConfig};

pub const REASON_PRERELEASE: &str = "prerelease";
pub const REASON_MIXED_ALBUM: &str = "mixed_album";
pub const REASON_REISSUE: &str = "reissue";

#[derive(Debug, Default)]
pub struct YearBatchStats {
    pub albums_processed: usize,
    pub albums_skipped: usize,
    pub tracks_updated: usize,
    pub tracks_restored: usize,
}

/// What the prerelease policy decided for one album group.
enum GroupDecision {
    /// Write to these track indices. `keep_pending` is set for mixed
    /// albums, whose verification entry must outlive a successful write.
    Process { writable: Vec<usize>, keep_pending: bool },
    Skip,
}

/// Groups tracks by `(artist, album)`, applies the prerelease policy, runs
/// the resolver per group, and writes resolved years back through the
/// agent, collecting an audit entry per mutation.
pub struct YearBatchProcessor<'a, S: AlbumYearSource> {
    resolver: &'a YearResolver<'a, S>,
    agent: &'a LibraryAgentClient,
    pending: &'a PendingVerificationStore,
    processing: &'a ProcessingConfig,
    logic: &'a LogicConfig,
    current_year: i32,
    dry_run: bool,
}

impl<'a, S: AlbumYearSource> YearBatchProcessor<'a, S> {
    pub fn new(
        resolver: &'a YearResolver<'a, S>,
        agent: &'a LibraryAgentClient,
        pending: &'a PendingVerificationStore,
        processing: &'a ProcessingConfig,
        logic: &'a LogicConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            resolver,
            agent,
            pending,
            processing,
            logic,
            current_year: chrono::Utc::now().year(),
            dry_run,
        }
    }

    /// Processes the whole track set. Tracks are mutated in place so the
    /// caller's snapshot reflects every write.
    pub async fn process_tracks(&self, tracks: &mut [Track]) -> (Vec<ChangeLogEntry>, YearBatchStats) {
        let mut changes = Vec::new();
        let mut stats = YearBatchStats::default();

        self.restore_years_from_release_year(tracks, &mut changes, &mut stats).await;

        // Group indices by (artist, album); tracks without an album name
        // have nothing to resolve and are left alone.
        let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
        for (idx, track) in tracks.iter().enumerate() {
            if track.album.trim().is_empty() || track.artist.trim().is_empty() {
                continue;
            }
            groups
                .entry((track.artist.clone(), track.album.clone()))
                .or_default()
                .push(idx);
        }

        let group_list: Vec<((String, String), Vec<usize>)> = groups.into_iter().collect();
        for chunk in group_list.chunks(self.processing.batch_size.max(1)) {
            // Resolutions within a chunk run concurrently; writes are
            // applied after the chunk boundary.
            let resolutions = join_all(chunk.iter().map(|((artist, album), indices)| {
                let group_tracks: Vec<Track> = indices.iter().map(|&i| tracks[i].clone()).collect();
                async move {
                    self.resolver.resolve(artist, album, &group_tracks).await
                }
            }))
            .await;

            for (((artist, album), indices), resolution) in chunk.iter().zip(resolutions) {
                match self.apply_group_result(artist, album, indices, resolution, tracks, &mut changes).await {
                    GroupOutcome::Updated(count) => {
                        stats.albums_processed += 1;
                        stats.tracks_updated += count;
                    }
                    GroupOutcome::Skipped => stats.albums_skipped += 1,
                }
            }
        }

        (changes, stats)
    }

    /// When the library year has drifted more than the threshold away from
    /// a known release_year, the release_year wins. Strictly greater: a
    /// difference of exactly the threshold is left alone.
    async fn restore_years_from_release_year(
        &self,
        tracks: &mut [Track],
        changes: &mut Vec<ChangeLogEntry>,
        stats: &mut YearBatchStats,
    ) {
        let threshold = self.logic.year_difference_threshold;

        for track in tracks.iter_mut() {
            if !track.is_editable() {
                continue;
            }
            let (Some(year), Some(release_year)) = (track.year_value(), track.release_year_value()) else {
                continue;
            };
            if (year - release_year).abs() <= threshold {
                continue;
            }

            let old_year = track.year.clone();
            let new_year = track.release_year.clone();
            log::info!(
                "Restoring year for {} - {} ({}): {old_year} -> {new_year}",
                track.artist,
                track.album,
                track.name
            );

            if !self.dry_run {
                if let Err(write_err) = self.agent.update_property(&track.id, "year", &new_year).await {
                    log::warn!("Failed to restore year on track {}: {write_err}", track.id);
                    changes.push(
                        ChangeLogEntry::new(ChangeType::YearUpdateError, track.id.clone())
                            .with_context(track.artist.clone(), track.album.clone(), track.name.clone())
                            .with_values(old_year, new_year)
                            .with_field("year"),
                    );
                    continue;
                }
            }

            if track.year_before_mgu.is_empty() {
                track.year_before_mgu = old_year.clone();
            }
            track.year = new_year.clone();
            stats.tracks_restored += 1;
            changes.push(
                ChangeLogEntry::new(ChangeType::YearRestoredFromReleaseYear, track.id.clone())
                    .with_context(track.artist.clone(), track.album.clone(), track.name.clone())
                    .with_values(old_year, new_year)
                    .with_field("year"),
            );
        }
    }

    async fn apply_group_result(
        &self,
        artist: &str,
        album: &str,
        indices: &[usize],
        resolution: super::year_resolver::YearResolution,
        tracks: &mut [Track],
        changes: &mut Vec<ChangeLogEntry>,
    ) -> GroupOutcome {
        let decision = self.apply_prerelease_policy(artist, album, indices, tracks).await;

        let GroupDecision::Process { writable, keep_pending } = decision else {
            return GroupOutcome::Skipped;
        };

        let Some(year) = resolution.year else {
            return GroupOutcome::Skipped;
        };

        if resolution.strategy == YearHandlingStrategy::MarkAndSkip {
            return GroupOutcome::Skipped;
        }

        // The album-level skip: only tracks whose year actually differs get
        // written.
        let targets: Vec<usize> = writable
            .into_iter()
            .filter(|&idx| tracks[idx].year != year)
            .collect();

        if targets.is_empty() {
            // Nothing to write, but the album is answered; a pending entry
            // from an earlier run is settled.
            if resolution.is_definitive && !keep_pending {
                self.remove_pending(artist, album).await;
            }
            return GroupOutcome::Skipped;
        }

        if !self.dry_run {
            let ids: Vec<String> = targets.iter().map(|&idx| tracks[idx].id.clone()).collect();
            if let Err(write_err) = self.agent.bulk_update_year(&ids, &year).await {
                log::warn!("Bulk year write failed for {artist} - {album}: {write_err}");
                for &idx in &targets {
                    let track = &tracks[idx];
                    changes.push(
                        ChangeLogEntry::new(ChangeType::YearUpdateError, track.id.clone())
                            .with_context(artist, album, track.name.clone())
                            .with_values(track.year.clone(), year.clone())
                            .with_field("year"),
                    );
                }
                return GroupOutcome::Skipped;
            }
        }

        for &idx in &targets {
            let track = &mut tracks[idx];
            let old_year = track.year.clone();
            if track.year_before_mgu.is_empty() {
                // Only once: the first observed year is the rollback value.
                track.year_before_mgu = old_year.clone();
            }
            track.year = year.clone();
            track.year_set_by_mgu = year.clone();

            changes.push(
                ChangeLogEntry::new(ChangeType::YearUpdate, track.id.clone())
                    .with_context(artist, album, track.name.clone())
                    .with_values(old_year, year.clone())
                    .with_field("year"),
            );
        }

        match resolution.strategy {
            YearHandlingStrategy::MarkAndUpdate => {
                // Reissues keep their year but stay on the re-check list.
                self.mark_pending(artist, album, REASON_REISSUE, None).await;
            }
            _ => {
                if resolution.is_definitive && !keep_pending {
                    self.remove_pending(artist, album).await;
                }
            }
        }

        GroupOutcome::Updated(targets.len())
    }

    async fn apply_prerelease_policy(
        &self,
        artist: &str,
        album: &str,
        indices: &[usize],
        tracks: &[Track],
    ) -> GroupDecision {
        let group_tracks: Vec<Track> = indices.iter().map(|&i| tracks[i].clone()).collect();
        let editable: Vec<usize> = indices.iter().copied().filter(|&i| tracks[i].is_editable()).collect();
        let prerelease_count = api::count_prerelease_tracks(&group_tracks);

        if editable.is_empty() && prerelease_count > 0 {
            // Entirely prerelease: never write, always queue.
            log::info!("Album {artist} - {album} is entirely prerelease; deferring");
            self.mark_pending_with_days(artist, album, REASON_PRERELEASE, None, self.processing.prerelease_recheck_days).await;
            return GroupDecision::Skip;
        }

        if prerelease_count == 0 {
            // No explicit prerelease status, but an album whose tracks
            // mostly claim future years is a prerelease in disguise.
            let stats = api::compute_future_year_stats(
                &group_tracks,
                self.current_year,
                self.processing.future_year_threshold_count,
                self.processing.future_year_threshold_ratio,
            );
            if api::is_prerelease_album(0, &stats) {
                log::info!(
                    "Album {artist} - {album} has {} future-year tracks (max {}); deferring",
                    stats.future_count,
                    stats.max_future_year
                );
                self.mark_pending_with_days(artist, album, REASON_PRERELEASE, None, self.processing.prerelease_recheck_days).await;
                return GroupDecision::Skip;
            }
            return GroupDecision::Process { writable: editable, keep_pending: false };
        }

        match self.processing.prerelease_handling.as_str() {
            "skip_all" => {
                log::info!("Album {artist} - {album} has prerelease tracks; skip_all mode skips it");
                GroupDecision::Skip
            }
            "mark_only" => {
                let mut metadata = BTreeMap::new();
                metadata.insert("mode".to_string(), "mark_only".to_string());
                self.mark_pending_with_days(artist, album, REASON_PRERELEASE, Some(metadata), self.processing.prerelease_recheck_days).await;
                GroupDecision::Skip
            }
            other => {
                if other != "process_editable" {
                    log::warn!(
                        "Unknown prerelease_handling mode '{other}' (valid: process_editable, skip_all, mark_only); \
                         treating as process_editable"
                    );
                }
                let mut metadata = BTreeMap::new();
                metadata.insert("mixed_album".to_string(), "true".to_string());
                self.mark_pending_with_days(artist, album, REASON_MIXED_ALBUM, Some(metadata), self.processing.prerelease_recheck_days).await;
                GroupDecision::Process { writable: editable, keep_pending: true }
            }
        }
    }

    async fn mark_pending(&self, artist: &str, album: &str, reason: &str, metadata: Option<BTreeMap<String, String>>) {
        if let Err(mark_err) = self.pending.mark_for_verification(artist, album, reason, metadata, None).await {
            log::warn!("Failed to mark {artist} - {album} for verification: {mark_err}");
        }
    }

    async fn mark_pending_with_days(
        &self,
        artist: &str,
        album: &str,
        reason: &str,
        metadata: Option<BTreeMap<String, String>>,
        recheck_days: i64,
    ) {
        if let Err(mark_err) = self
            .pending
            .mark_for_verification(artist, album, reason, metadata, Some(recheck_days))
            .await
        {
            log::warn!("Failed to mark {artist} - {album} for verification: {mark_err}");
        }
    }

    async fn remove_pending(&self, artist: &str, album: &str) {
        if let Err(remove_err) = self.pending.remove_from_pending(artist, album).await {
            log::warn!("Failed to remove {artist} - {album} from pending: {remove_err}");
        }
    }
}

enum GroupOutcome {
    Updated(usize),
    Skipped,
}
