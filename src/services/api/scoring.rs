use crate::utils::config::{LogicConfig, ScoringConfig};

/// One release candidate as returned by a source, normalised to the fields
/// the scorer cares about.
#[derive(Debug, Clone)]
pub struct ReleaseCandidate {
    pub source: &'static str,
    pub title: String,
    pub artist: String,
    pub year: Option<i32>,
    pub country: Option<String>,
    pub release_type: Option<String>,
    pub status: Option<String>,
    pub release_group_id: Option<String>,
    pub master_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: ReleaseCandidate,
    pub score: i32,
}

/// Inputs the caller already knows about the album, used for match and
/// contamination scoring.
#[derive(Debug, Clone, Default)]
pub struct ScoringContext {
    pub artist: String,
    pub album: String,
    /// The library's current opinion of the album year, if any.
    pub current_library_year: Option<i32>,
    /// Two-letter country the artist is known to be from, if any.
    pub artist_region: Option<String>,
}

/// Config-driven scorer for release candidates. All weights live in the
/// scoring table; the code only knows the dimensions.
pub struct ReleaseScorer {
    scoring: ScoringConfig,
    logic: LogicConfig,
    reissue_keywords: Vec<String>,
}

impl ReleaseScorer {
    pub fn new(scoring: ScoringConfig, logic: LogicConfig, reissue_keywords: Vec<String>) -> Self {
        Self { scoring, logic, reissue_keywords }
    }

    pub fn score(&self, candidate: &ReleaseCandidate, context: &ScoringContext) -> i32 {
        let mut score = self.scoring.base_score;

        let artist_norm = normalize(&context.artist);
        let album_norm = normalize(&context.album);
        let cand_artist = normalize(&candidate.artist);
        let cand_title = normalize(&candidate.title);

        let artist_exact = !artist_norm.is_empty() && cand_artist == artist_norm;
        let album_exact = !album_norm.is_empty() && cand_title == album_norm;

        if artist_exact {
            score += self.scoring.artist_exact_match_bonus;
        }
        if album_exact {
            score += self.scoring.album_exact_match_bonus;
        }
        if artist_exact && album_exact {
            score += self.scoring.perfect_match_bonus;
        }

        if !album_exact && !album_norm.is_empty() {
            if cand_title.contains(&album_norm) || album_norm.contains(&cand_title) {
                score += self.scoring.album_substring_penalty;
            } else {
                score += self.scoring.album_unrelated_penalty;
            }
        }

        if candidate.release_group_id.is_some() || candidate.master_id.is_some() {
            score += self.scoring.mb_release_group_match_bonus;
        }

        if let Some(release_type) = candidate.release_type.as_deref() {
            match release_type.to_lowercase().as_str() {
                "album" => score += self.scoring.type_album_bonus,
                "ep" | "single" => score += self.scoring.type_ep_single_penalty,
                "compilation" | "live" => score += self.scoring.type_compilation_live_penalty,
                _ => {}
            }
        }

        if let Some(status) = candidate.status.as_deref() {
            match status.to_lowercase().as_str() {
                "official" => score += self.scoring.status_official_bonus,
                "promotion" | "promo" => score += self.scoring.status_promo_penalty,
                "bootleg" => score += self.scoring.status_bootleg_penalty,
                _ => {}
            }
        }

        if self.title_looks_like_reissue(&cand_title) {
            score += self.scoring.reissue_penalty;
        }

        if let Some(country) = candidate.country.as_deref() {
            let artist_match = context
                .artist_region
                .as_deref()
                .is_some_and(|region| region.eq_ignore_ascii_case(country));
            if artist_match {
                score += self.scoring.country_artist_match_bonus;
            } else if self
                .logic
                .major_market_codes
                .iter()
                .any(|code| code.eq_ignore_ascii_case(country))
            {
                score += self.scoring.country_major_market_bonus;
            }
        }

        match candidate.source {
            "musicbrainz" => score += self.scoring.source_mb_bonus,
            "discogs" => score += self.scoring.source_discogs_bonus,
            _ => {}
        }

        // Quadratic penalty on drifting away from the year the library
        // already believes, capped so one bad year cannot sink an otherwise
        // perfect match entirely.
        if let (Some(candidate_year), Some(library_year)) = (candidate.year, context.current_library_year) {
            let diff = (candidate_year - library_year).abs();
            let penalty = (self.scoring.year_diff_penalty_scale * diff * diff).min(self.scoring.year_diff_max_penalty);
            score -= penalty;
        }

        score
    }

    pub fn score_all(&self, candidates: Vec<ReleaseCandidate>, context: &ScoringContext) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .filter(|candidate| candidate.year.is_some())
            .map(|candidate| ScoredCandidate { score: self.score(&candidate, context), candidate })
            .collect();

        // Deterministic order: higher score first, the earlier year wins a
        // tie (we are after the original release).
        scored.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.candidate.year.unwrap_or(i32::MAX).cmp(&b.candidate.year.unwrap_or(i32::MAX)))
        });
        scored
    }

    /// A winner is definitive when it clears the absolute threshold and
    /// beats the runner-up by the configured margin.
    pub fn is_definitive(&self, scored: &[ScoredCandidate]) -> bool {
        match scored {
            [] => false,
            [only] => only.score >= self.logic.definitive_score_threshold,
            [best, runner_up, ..] => {
                best.score >= self.logic.definitive_score_threshold
                    && best.score - runner_up.score >= self.logic.definitive_score_diff
            }
        }
    }

    fn title_looks_like_reissue(&self, normalized_title: &str) -> bool {
        self.reissue_keywords
            .iter()
            .any(|keyword| normalized_title.contains(&normalize(keyword)))
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}
