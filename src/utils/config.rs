use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read the config ({0}): {1}")]
    FailedToReadConfig(String, String),

    #[error("Failed to parse the config: {0}")]
    FailedToParseConfig(#[from] toml::de::Error),

    #[error("Invalid config value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub paths: PathsConfig,
    pub caching: CachingConfig,
    pub year_retrieval: YearRetrievalConfig,
    pub album_types: AlbumTypesConfig,
    pub genre_update: GenreUpdateConfig,
    pub cleaning: CleaningConfig,
    pub artist_renames: std::collections::BTreeMap<String, String>,
    pub verification: VerificationConfig,
    pub incremental: IncrementalConfig,
    pub reporting: ReportingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub scripts_dir: PathBuf,
    pub script_timeout_secs: u64,
    pub requests_per_window: u32,
    pub window_seconds: f64,
    pub max_concurrent: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("scripts"),
            script_timeout_secs: 120,
            requests_per_window: 30,
            window_seconds: 60.0,
            max_concurrent: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub cache_dir: PathBuf,
    pub csv_file: PathBuf,
    pub changes_report_file: PathBuf,
    pub last_run_file: PathBuf,
    /// The library database file watched for modification time changes.
    pub music_library_path: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            csv_file: PathBuf::from("csv/track_list.csv"),
            changes_report_file: PathBuf::from("csv/changes_report.csv"),
            last_run_file: PathBuf::from("last_incremental_run.log"),
            music_library_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CachingConfig {
    pub default_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_generic_entries: usize,
    pub album_cache_file: PathBuf,
    pub api_cache_file: PathBuf,
    pub generic_cache_file: PathBuf,
    pub pending_file: PathBuf,
    pub snapshot: SnapshotConfig,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 7 * 24 * 3600,
            cleanup_interval_secs: 300,
            max_generic_entries: 10_000,
            album_cache_file: PathBuf::from("album_years.json"),
            api_cache_file: PathBuf::from("api_results.json"),
            generic_cache_file: PathBuf::from("generic_cache.json"),
            pending_file: PathBuf::from("pending_verification.json"),
            snapshot: SnapshotConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub delta_enabled: bool,
    pub compress: bool,
    pub compress_level: u32,
    pub max_age_hours: u64,
    pub snapshot_file: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delta_enabled: true,
            compress: true,
            compress_level: 6,
            max_age_hours: 24,
            snapshot_file: PathBuf::from("library_snapshot.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct YearRetrievalConfig {
    pub enabled: bool,
    pub preferred_api: String,
    pub auth: ApiAuthConfig,
    pub rate_limits: RateLimitsConfig,
    pub processing: ProcessingConfig,
    pub logic: LogicConfig,
    pub scoring: ScoringConfig,
    pub retries: RetriesConfig,
}

impl Default for YearRetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preferred_api: "musicbrainz".to_string(),
            auth: ApiAuthConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            processing: ProcessingConfig::default(),
            logic: LogicConfig::default(),
            scoring: ScoringConfig::default(),
            retries: RetriesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiAuthConfig {
    pub discogs_token: String,
    pub musicbrainz_app_name: String,
    pub contact_email: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub musicbrainz_requests_per_window: u32,
    pub musicbrainz_window_seconds: f64,
    pub discogs_requests_per_window: u32,
    pub discogs_window_seconds: f64,
    pub itunes_requests_per_window: u32,
    pub itunes_window_seconds: f64,
    pub concurrent_api_calls: u32,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            musicbrainz_requests_per_window: 1,
            musicbrainz_window_seconds: 1.1,
            discogs_requests_per_window: 25,
            discogs_window_seconds: 60.0,
            itunes_requests_per_window: 20,
            itunes_window_seconds: 60.0,
            concurrent_api_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub batch_size: usize,
    pub prerelease_handling: String,
    pub future_year_threshold_count: usize,
    pub future_year_threshold_ratio: f64,
    pub prerelease_recheck_days: i64,
    pub pending_recheck_days: i64,
    pub max_pending_entries: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            prerelease_handling: "process_editable".to_string(),
            future_year_threshold_count: 2,
            future_year_threshold_ratio: 0.5,
            prerelease_recheck_days: 30,
            pending_recheck_days: 30,
            max_pending_entries: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogicConfig {
    pub min_valid_year: i32,
    pub definitive_score_threshold: i32,
    pub definitive_score_diff: i32,
    pub trust_api_score_threshold: i32,
    pub cache_trust_threshold: u8,
    pub consensus_confidence: u8,
    pub year_difference_threshold: i32,
    pub preferred_countries: Vec<String>,
    pub major_market_codes: Vec<String>,
}

impl Default for LogicConfig {
    fn default() -> Self {
        Self {
            min_valid_year: 1900,
            definitive_score_threshold: 85,
            definitive_score_diff: 15,
            trust_api_score_threshold: 70,
            cache_trust_threshold: 85,
            consensus_confidence: 95,
            year_difference_threshold: 5,
            preferred_countries: Vec::new(),
            major_market_codes: vec![
                "US".to_string(),
                "GB".to_string(),
                "DE".to_string(),
                "JP".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub base_score: i32,
    pub artist_exact_match_bonus: i32,
    pub album_exact_match_bonus: i32,
    pub perfect_match_bonus: i32,
    pub album_substring_penalty: i32,
    pub album_unrelated_penalty: i32,
    pub mb_release_group_match_bonus: i32,
    pub type_album_bonus: i32,
    pub type_ep_single_penalty: i32,
    pub type_compilation_live_penalty: i32,
    pub status_official_bonus: i32,
    pub status_promo_penalty: i32,
    pub status_bootleg_penalty: i32,
    pub reissue_penalty: i32,
    pub year_diff_penalty_scale: i32,
    pub year_diff_max_penalty: i32,
    pub country_artist_match_bonus: i32,
    pub country_major_market_bonus: i32,
    pub source_mb_bonus: i32,
    pub source_discogs_bonus: i32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_score: 10,
            artist_exact_match_bonus: 30,
            album_exact_match_bonus: 30,
            perfect_match_bonus: 20,
            album_substring_penalty: -15,
            album_unrelated_penalty: -40,
            mb_release_group_match_bonus: 10,
            type_album_bonus: 15,
            type_ep_single_penalty: -10,
            type_compilation_live_penalty: -20,
            status_official_bonus: 10,
            status_promo_penalty: -15,
            status_bootleg_penalty: -30,
            reissue_penalty: -20,
            year_diff_penalty_scale: 2,
            year_diff_max_penalty: 30,
            country_artist_match_bonus: 5,
            country_major_market_bonus: 3,
            source_mb_bonus: 5,
            source_discogs_bonus: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetriesConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetriesConfig {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 500 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlbumTypesConfig {
    pub special_patterns: Option<Vec<String>>,
    pub compilation_patterns: Option<Vec<String>>,
    pub reissue_patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenreUpdateConfig {
    pub enabled: bool,
}

impl Default for GenreUpdateConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    pub enabled: bool,
    pub remaster_keywords: Vec<String>,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remaster_keywords: vec![
                "remaster".to_string(),
                "remastered".to_string(),
                "deluxe".to_string(),
                "anniversary".to_string(),
                "expanded".to_string(),
                "bonus track".to_string(),
                "re-issue".to_string(),
                "reissue".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub auto_verify_days: i64,
    pub batch_size: usize,
    pub pause_ms: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self { auto_verify_days: 7, batch_size: 20, pause_ms: 200 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IncrementalConfig {
    pub interval_minutes: i64,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self { interval_minutes: 1440 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub timestamped_reports: bool,
}

const KNOWN_APIS: [&str; 3] = ["musicbrainz", "discogs", "itunes"];

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .map_err(|err| ConfigError::FailedToReadConfig(path.display().to_string(), err.to_string()))?;
        let mut config: Config = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates all loaded values in one pass. Called once at startup;
    /// nothing downstream re-checks these.
    fn validate(&mut self) -> Result<(), ConfigError> {
        fn positive_u32(field: &'static str, value: u32) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::InvalidValue { field, reason: "must be a positive integer".to_string() });
            }
            Ok(())
        }

        fn positive_f64(field: &'static str, value: f64) -> Result<(), ConfigError> {
            if value <= 0.0 {
                return Err(ConfigError::InvalidValue { field, reason: "must be a positive number".to_string() });
            }
            Ok(())
        }

        positive_u32("agent.requests_per_window", self.agent.requests_per_window)?;
        positive_f64("agent.window_seconds", self.agent.window_seconds)?;
        positive_u32("agent.max_concurrent", self.agent.max_concurrent)?;

        let limits = &self.year_retrieval.rate_limits;
        positive_u32("rate_limits.musicbrainz_requests_per_window", limits.musicbrainz_requests_per_window)?;
        positive_f64("rate_limits.musicbrainz_window_seconds", limits.musicbrainz_window_seconds)?;
        positive_u32("rate_limits.discogs_requests_per_window", limits.discogs_requests_per_window)?;
        positive_f64("rate_limits.discogs_window_seconds", limits.discogs_window_seconds)?;
        positive_u32("rate_limits.itunes_requests_per_window", limits.itunes_requests_per_window)?;
        positive_f64("rate_limits.itunes_window_seconds", limits.itunes_window_seconds)?;
        positive_u32("rate_limits.concurrent_api_calls", limits.concurrent_api_calls)?;

        if self.year_retrieval.logic.cache_trust_threshold > 100 {
            return Err(ConfigError::InvalidValue {
                field: "logic.cache_trust_threshold",
                reason: "confidence is a 0-100 score".to_string(),
            });
        }
        if self.year_retrieval.logic.consensus_confidence > 100 {
            return Err(ConfigError::InvalidValue {
                field: "logic.consensus_confidence",
                reason: "confidence is a 0-100 score".to_string(),
            });
        }

        let preferred = self.year_retrieval.preferred_api.to_lowercase();
        let preferred = if preferred == "applemusic" { "itunes".to_string() } else { preferred };
        if !KNOWN_APIS.contains(&preferred.as_str()) {
            log::warn!(
                "Unknown preferred_api '{}', falling back to musicbrainz",
                self.year_retrieval.preferred_api
            );
            self.year_retrieval.preferred_api = "musicbrainz".to_string();
        } else {
            self.year_retrieval.preferred_api = preferred;
        }

        let handling = self.year_retrieval.processing.prerelease_handling.as_str();
        if !matches!(handling, "process_editable" | "skip_all" | "mark_only") {
            log::warn!(
                "Unknown prerelease_handling mode '{}' (valid: process_editable, skip_all, mark_only); \
                 will behave as process_editable",
                handling
            );
        }

        Ok(())
    }

    /// Resolves a cache-relative file name against the configured cache dir.
    pub fn cache_path(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.paths.cache_dir.join(file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().expect("temp config");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let file = write_config("");
        let config = Config::load(file.path()).expect("defaults should parse");

        assert_eq!(config.year_retrieval.preferred_api, "musicbrainz");
        assert_eq!(config.year_retrieval.logic.cache_trust_threshold, 85);
        assert_eq!(config.year_retrieval.logic.min_valid_year, 1900);
        assert_eq!(config.verification.batch_size, 20);
        assert_eq!(config.incremental.interval_minutes, 1440);
        assert!(config.caching.snapshot.compress);
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let file = write_config("[year_retrieval.rate_limits]\ndiscogs_requests_per_window = 0\n");
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field.contains("discogs_requests_per_window")));
    }

    #[test]
    fn test_negative_window_rejected() {
        let file = write_config("[agent]\nwindow_seconds = -1.0\n");
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_unknown_preferred_api_falls_back() {
        let file = write_config("[year_retrieval]\npreferred_api = \"lastfm\"\n");
        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.year_retrieval.preferred_api, "musicbrainz");
    }

    #[test]
    fn test_applemusic_alias_normalized() {
        let file = write_config("[year_retrieval]\npreferred_api = \"AppleMusic\"\n");
        let config = Config::load(file.path()).expect("load");
        assert_eq!(config.year_retrieval.preferred_api, "itunes");
    }

    #[test]
    fn test_cache_path_resolution() {
        let file = write_config("[paths]\ncache_dir = \"/var/cache/tunekeeper\"\n");
        let config = Config::load(file.path()).expect("load");

        assert_eq!(
            config.cache_path(Path::new("album_years.json")),
            PathBuf::from("/var/cache/tunekeeper/album_years.json")
        );
        assert_eq!(config.cache_path(Path::new("/tmp/abs.json")), PathBuf::from("/tmp/abs.json"));
    }

    #[test]
    fn test_overflowing_confidence_rejected() {
        let file = write_config("[year_retrieval.logic]\ncache_trust_threshold = 101\n");
        assert!(Config::load(file.path()).is_err());
    }
}
