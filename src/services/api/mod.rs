pub mod discogs;
pub mod itunes;
pub mod musicbrainz;
pub mod scoring;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Datelike;

use self::discogs::DiscogsClient;
use self::itunes::ItunesClient;
use self::musicbrainz::MusicBrainzClient;
use self::scoring::{ReleaseCandidate, ReleaseScorer, ScoredCandidate, ScoringContext};
use super::rate_limiter::RateLimiter;
use super::ApiError;
use crate::domain::album::AlbumTypePatterns;
use crate::domain::track::Track;
use crate::repository::api_cache::{ApiResultMetadata, ApiResponseCache};
use crate::repository::PendingVerificationStore;
use crate::utils::config::Config;

pub const REASON_NO_YEAR_FOUND: &str = "no_year_found";
pub const REASON_API_ERROR: &str = "api_error";
pub const REASON_CONTAMINATION: &str = "contamination_suspected";
pub const REASON_PRERELEASE: &str = "prerelease";

const SOUNDTRACK_MARKERS: [&str; 4] = ["soundtrack", "ost", "original score", "motion picture"];
const VARIOUS_ARTISTS_NAMES: [&str; 3] = ["various artists", "various", "va"];

/// What a full fan-out across the enabled sources concluded.
#[derive(Debug, Clone, Default)]
pub struct YearSearchOutcome {
    pub year: Option<String>,
    pub is_definitive: bool,
    pub confidence: i32,
    pub source: Option<String>,
}

impl YearSearchOutcome {
    fn null() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FutureYearStats {
    pub future_count: usize,
    pub max_future_year: i32,
    pub ratio_triggered: bool,
    pub significant: bool,
}

/// Fans a query out across the enabled sources in preferred order, scores
/// candidates, caches per-source outcomes, and applies the current-year
/// contamination rules.
pub struct ExternalApiOrchestrator {
    musicbrainz: MusicBrainzClient,
    discogs: DiscogsClient,
    itunes: Option<ItunesClient>,
    limiters: HashMap<&'static str, RateLimiter>,
    scorer: ReleaseScorer,
    api_cache: Arc<ApiResponseCache>,
    pending: Arc<PendingVerificationStore>,
    preferred_api: String,
    max_retries: u32,
    base_delay: Duration,
    current_year: i32,
}

impl ExternalApiOrchestrator {
    pub fn new(
        config: &Config,
        api_cache: Arc<ApiResponseCache>,
        pending: Arc<PendingVerificationStore>,
    ) -> Result<Self, ApiError> {
        let retrieval = &config.year_retrieval;
        let patterns = AlbumTypePatterns::from_config(&config.album_types);

        let scorer = ReleaseScorer::new(
            retrieval.scoring.clone(),
            retrieval.logic.clone(),
            patterns.reissue.clone(),
        );

        let limits = &retrieval.rate_limits;
        let mut limiters = HashMap::new();
        for (source, per_window, window_seconds) in [
            (musicbrainz::SOURCE_NAME, limits.musicbrainz_requests_per_window, limits.musicbrainz_window_seconds),
            (discogs::SOURCE_NAME, limits.discogs_requests_per_window, limits.discogs_window_seconds),
            (itunes::SOURCE_NAME, limits.itunes_requests_per_window, limits.itunes_window_seconds),
        ] {
            let limiter = RateLimiter::new(per_window, window_seconds, limits.concurrent_api_calls)
                .map_err(|limiter_err| ApiError::Transient {
                    source_name: source.to_string(),
                    reason: limiter_err.to_string(),
                })?;
            limiters.insert(source, limiter);
        }

        Ok(Self {
            musicbrainz: MusicBrainzClient::new(&retrieval.auth.musicbrainz_app_name, &retrieval.auth.contact_email)?,
            discogs: DiscogsClient::new(&retrieval.auth.discogs_token)?,
            itunes: Some(ItunesClient::new()?),
            limiters,
            scorer,
            api_cache,
            pending,
            preferred_api: retrieval.preferred_api.clone(),
            max_retries: retrieval.retries.max_retries,
            base_delay: Duration::from_millis(retrieval.retries.base_delay_ms),
            current_year: chrono::Utc::now().year(),
        })
    }

    pub fn initialize(&self) {
        for limiter in self.limiters.values() {
            limiter.initialize();
        }
    }

    #[cfg(test)]
    pub fn with_base_urls(mut self, musicbrainz: &str, discogs: &str, itunes: Option<&str>) -> Self {
        self.musicbrainz = MusicBrainzClient::new("tests/0.1", "dev@example.com")
            .expect("mb client")
            .with_base_url(musicbrainz);
        self.discogs = DiscogsClient::new("test_token").expect("discogs client").with_base_url(discogs);
        self.itunes = itunes.map(|url| ItunesClient::new().expect("itunes client").with_base_url(url));
        self
    }

    #[cfg(test)]
    pub fn with_current_year(mut self, year: i32) -> Self {
        self.current_year = year;
        self
    }

    pub fn current_year(&self) -> i32 {
        self.current_year
    }

    pub fn normalize_api_name(name: &str) -> &'static str {
        match name.to_lowercase().as_str() {
            "discogs" => discogs::SOURCE_NAME,
            "itunes" | "applemusic" => itunes::SOURCE_NAME,
            _ => musicbrainz::SOURCE_NAME,
        }
    }

    /// Enabled sources with the preferred one first, deduplicated.
    pub fn apply_preferred_order(&self) -> Vec<&'static str> {
        let preferred = Self::normalize_api_name(&self.preferred_api);
        let mut order = vec![preferred];
        for source in [musicbrainz::SOURCE_NAME, discogs::SOURCE_NAME, itunes::SOURCE_NAME] {
            if source == itunes::SOURCE_NAME && self.itunes.is_none() {
                continue;
            }
            if !order.contains(&source) {
                order.push(source);
            }
        }
        order
    }

    /// Resolves an album year across the enabled sources.
    ///
    /// `current_library_year` feeds the year-difference scoring dimension
    /// and the contamination guard; `earliest_track_added_year` is the
    /// oldest `date_added` year among the album's tracks.
    pub async fn get_album_year(
        &self,
        artist: &str,
        album: &str,
        current_library_year: Option<i32>,
        earliest_track_added_year: Option<i32>,
    ) -> YearSearchOutcome {
        let context = ScoringContext {
            artist: artist.to_string(),
            album: album.to_string(),
            current_library_year,
            artist_region: None,
        };

        let order = self.apply_preferred_order();
        let mut all_scored: Vec<ScoredCandidate> = Vec::new();
        let mut sources_answered = 0usize;
        let mut sources_failed = 0usize;

        for &source in &order {
            match self.fetch_source_results(source, artist, album, false, true, &context).await {
                Ok(scored) => {
                    sources_answered += 1;
                    all_scored.extend(scored);
                }
                Err(fetch_err) => {
                    sources_failed += 1;
                    log::warn!("Source {source} produced no usable result for {artist} - {album}: {fetch_err}");
                }
            }

            sort_scored(&mut all_scored);
            if self.scorer.is_definitive(&all_scored) {
                // The preferred source already answered beyond doubt; do
                // not spend the remaining sources' quota.
                break;
            }
        }

        // Relaxed title-only retry for special titles. Runs only when the
        // standard query produced zero candidates everywhere.
        if all_scored.is_empty() && Self::needs_alternative_search(artist, album) {
            log::info!("Alternative search fallback for {artist} - {album}");
            for &source in &order {
                if let Ok(scored) = self.fetch_source_results(source, artist, album, true, false, &context).await {
                    sources_answered += 1;
                    all_scored.extend(scored);
                }
                sort_scored(&mut all_scored);
                if self.scorer.is_definitive(&all_scored) {
                    break;
                }
            }
        }

        if all_scored.is_empty() {
            let reason = if sources_answered == 0 && sources_failed > 0 {
                REASON_API_ERROR
            } else {
                REASON_NO_YEAR_FOUND
            };
            return self
                .fallback_year_when_no_results(artist, album, current_library_year, earliest_track_added_year, reason)
                .await;
        }

        let best = &all_scored[0];
        let best_year = best.candidate.year.expect("scored candidates always carry a year");

        // Current-year contamination guard: a result equal to "today" is
        // only believable when the album actually arrived this year.
        if best_year == self.current_year && earliest_track_added_year.is_none_or(|y| y < self.current_year) {
            log::warn!(
                "Rejecting {best_year} for {artist} - {album} as contamination (earliest add year: {:?})",
                earliest_track_added_year
            );
            self.safe_mark_for_verification(artist, album, REASON_CONTAMINATION, None).await;
            return YearSearchOutcome::null();
        }

        YearSearchOutcome {
            year: Some(best_year.to_string()),
            is_definitive: self.scorer.is_definitive(&all_scored),
            confidence: best.score,
            source: Some(best.candidate.source.to_string()),
        }
    }

    /// One source's answer: cached when possible, fetched and cached
    /// otherwise. `Ok(vec![])` is a definitive "nothing there"; `Err` is a
    /// source failure (quota, malformed, transport after retries).
    async fn fetch_source_results(
        &self,
        source: &'static str,
        artist: &str,
        album: &str,
        title_only: bool,
        use_cache: bool,
        context: &ScoringContext,
    ) -> Result<Vec<ScoredCandidate>, ApiError> {
        if use_cache {
            if let Some(cached) = self.api_cache.get_cached_result(artist, album, source) {
                if cached.is_negative() {
                    log::debug!("Cached negative for {artist} - {album} from {source}");
                    return Ok(Vec::new());
                }
                if let Some(year) = cached.year.as_deref().and_then(|y| y.parse::<i32>().ok()) {
                    log::debug!("Cached year {year} for {artist} - {album} from {source}");
                    return Ok(vec![ScoredCandidate {
                        score: cached.metadata.score,
                        candidate: ReleaseCandidate {
                            source,
                            title: album.to_string(),
                            artist: artist.to_string(),
                            year: Some(year),
                            country: None,
                            release_type: None,
                            status: None,
                            release_group_id: None,
                            master_id: None,
                        },
                    }]);
                }
            }
        }

        let candidates = self.search_with_retry(source, artist, album, title_only).await?;
        let scored = self.scorer.score_all(candidates, context);

        match scored.first() {
            Some(best) => {
                self.api_cache.set_cached_result(
                    artist,
                    album,
                    source,
                    best.candidate.year.map(|y| y.to_string()),
                    ApiResultMetadata { is_negative: false, score: best.score, is_definitive: false },
                );
            }
            None => {
                // The source answered and had nothing: cache the negative so
                // the next run skips the call entirely.
                self.api_cache.set_cached_result(
                    artist,
                    album,
                    source,
                    None,
                    ApiResultMetadata { is_negative: true, ..Default::default() },
                );
            }
        }

        Ok(scored)
    }

    async fn search_with_retry(
        &self,
        source: &'static str,
        artist: &str,
        album: &str,
        title_only: bool,
    ) -> Result<Vec<ReleaseCandidate>, ApiError> {
        let mut attempt = 0u32;
        loop {
            let result = {
                let _permit = match self.limiters.get(source) {
                    Some(limiter) => Some(limiter.acquire().await.map_err(|limiter_err| ApiError::Transient {
                        source_name: source.to_string(),
                        reason: limiter_err.to_string(),
                    })?),
                    None => None,
                };

                match source {
                    "discogs" => self.discogs.search_releases(artist, album, title_only).await,
                    "itunes" => match &self.itunes {
                        Some(client) => client.search_releases(artist, album, title_only).await,
                        None => Ok(Vec::new()),
                    },
                    _ => self.musicbrainz.search_releases(artist, album, title_only).await,
                }
            };

            match result {
                Ok(candidates) => return Ok(candidates),
                Err(ApiError::Transient { source_name, reason }) if attempt < self.max_retries => {
                    let delay = self.base_delay * 2u32.pow(attempt);
                    log::warn!("Transient failure from {source_name} (attempt {}): {reason}; retrying in {delay:?}", attempt + 1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// What to report when no source produced a candidate. The library's own
    /// year is reusable unless it smells like contamination.
    async fn fallback_year_when_no_results(
        &self,
        artist: &str,
        album: &str,
        current_library_year: Option<i32>,
        earliest_track_added_year: Option<i32>,
        reason: &str,
    ) -> YearSearchOutcome {
        if let Some(library_year) = current_library_year {
            let contaminated = library_year == self.current_year
                && earliest_track_added_year.is_none_or(|y| y < self.current_year);

            if !contaminated {
                log::info!("No API result for {artist} - {album}; keeping library year {library_year}");
                return YearSearchOutcome {
                    year: Some(library_year.to_string()),
                    is_definitive: false,
                    confidence: 0,
                    source: None,
                };
            }

            log::warn!("Library year {library_year} for {artist} - {album} looks contaminated; returning no result");
            self.safe_mark_for_verification(artist, album, REASON_CONTAMINATION, None).await;
            return YearSearchOutcome::null();
        }

        self.safe_mark_for_verification(artist, album, reason, None).await;
        YearSearchOutcome::null()
    }

    /// Bookkeeping must never take the resolution path down with it.
    pub async fn safe_mark_for_verification(
        &self,
        artist: &str,
        album: &str,
        reason: &str,
        metadata: Option<std::collections::BTreeMap<String, String>>,
    ) {
        if let Err(mark_err) = self.pending.mark_for_verification(artist, album, reason, metadata, None).await {
            log::warn!("Failed to mark {artist} - {album} for verification: {mark_err}");
        }
    }

    pub async fn safe_remove_from_pending(&self, artist: &str, album: &str) {
        if let Err(remove_err) = self.pending.remove_from_pending(artist, album).await {
            log::warn!("Failed to remove {artist} - {album} from pending: {remove_err}");
        }
    }

    /// Whether the relaxed title-only retry applies to this album at all.
    fn needs_alternative_search(artist: &str, album: &str) -> bool {
        let album_lower = album.to_lowercase();
        let artist_lower = artist.trim().to_lowercase();

        if SOUNDTRACK_MARKERS.iter().any(|marker| album_lower.contains(marker)) {
            return true;
        }
        if VARIOUS_ARTISTS_NAMES.contains(&artist_lower.as_str()) {
            return true;
        }
        // Unusual bracketed content in the title tends to defeat the exact
        // artist+title query.
        album_lower.contains('[') && album_lower.contains(']')
    }
}

/// Counts explicit prerelease tracks in a group.
pub fn count_prerelease_tracks(tracks: &[Track]) -> usize {
    tracks.iter().filter(|t| t.is_prerelease()).count()
}

/// Future-year statistics for the prerelease heuristic: how many tracks
/// claim a year past `current_year`, and whether the count and ratio
/// thresholds both trip.
pub fn compute_future_year_stats(
    tracks: &[Track],
    current_year: i32,
    threshold_count: usize,
    threshold_ratio: f64,
) -> FutureYearStats {
    let mut stats = FutureYearStats::default();
    if tracks.is_empty() {
        return stats;
    }

    for track in tracks {
        if let Some(year) = track.year_value() {
            if year > current_year {
                stats.future_count += 1;
                stats.max_future_year = stats.max_future_year.max(year);
            }
        }
    }

    stats.significant = stats.future_count >= threshold_count;
    stats.ratio_triggered = stats.future_count as f64 / tracks.len() as f64 >= threshold_ratio;
    stats
}

/// An album is treated as prerelease when tracks say so outright or the
/// future-year mix crosses both thresholds.
pub fn is_prerelease_album(prerelease_count: usize, stats: &FutureYearStats) -> bool {
    prerelease_count > 0 || (stats.ratio_triggered && stats.significant)
}

fn sort_scored(scored: &mut [ScoredCandidate]) {
    scored.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.candidate.year.unwrap_or(i32::MAX).cmp(&b.candidate.year.unwrap_or(i32::MAX)))
    });
}
