use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::rate_limiter::RateLimiter;
use super::AgentError;
use crate::domain::track::Track;
use crate::domain::ValidationError;
use crate::utils::config::AgentConfig;

/// Output dialect of the library agent's scan scripts: records separated by
/// ASCII 29, fields within a record by ASCII 30.
pub const RECORD_SEPARATOR: char = '\u{1d}';
pub const FIELD_SEPARATOR: char = '\u{1e}';

const MISSING_VALUE: &str = "missing value";

// Scan records carry either 12 fields (with album_artist) or 11 (without);
// anything shorter is skipped.
const FIELD_COUNT_WITH_ALBUM_ARTIST: usize = 12;
const FIELD_COUNT_WITHOUT_ALBUM_ARTIST: usize = 11;

pub const SCRIPT_FETCH_TRACKS: &str = "fetch_tracks";
pub const SCRIPT_FETCH_TRACK_IDS: &str = "fetch_track_ids";
pub const SCRIPT_FETCH_TRACKS_BY_IDS: &str = "fetch_tracks_by_ids";
pub const SCRIPT_TRACK_EXISTS: &str = "track_exists";
pub const SCRIPT_UPDATE_PROPERTY: &str = "update_property";
pub const SCRIPT_BULK_UPDATE_YEAR: &str = "bulk_update_year";
pub const SCRIPT_LIBRARY_STATUS: &str = "library_status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistenceResult {
    Exists,
    NotFound,
    /// The probe errored; callers treat this as "present" so transient
    /// failures never cascade into deletions.
    Unknown,
}

/// Rate-limited, concurrency-bounded client for the out-of-process library
/// agent. Every call acquires a limiter slot before spawning the script.
pub struct LibraryAgentClient {
    scripts_dir: PathBuf,
    default_timeout: Duration,
    limiter: RateLimiter,
}

impl LibraryAgentClient {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let limiter = RateLimiter::new(
            config.requests_per_window,
            config.window_seconds,
            config.max_concurrent,
        )?;

        Ok(Self {
            scripts_dir: config.scripts_dir.clone(),
            default_timeout: Duration::from_secs(config.script_timeout_secs),
            limiter,
        })
    }

    pub fn initialize(&self) {
        self.limiter.initialize();
    }

    /// Runs a named script with positional string arguments and returns its
    /// stdout. A non-zero exit is an `AgentError::ScriptFailed`; callers
    /// decide whether that is fatal or just "result unknown".
    pub async fn run_script(
        &self,
        script: &str,
        args: &[&str],
        timeout_override: Option<Duration>,
    ) -> Result<String, AgentError> {
        let _permit = self.limiter.acquire().await?;
        let timeout = timeout_override.unwrap_or(self.default_timeout);
        let script_path = self.scripts_dir.join(script);

        let child = Command::new(&script_path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AgentError::Timeout { script: script.to_string(), seconds: timeout.as_secs() });
            }
        };

        if !output.status.success() {
            return Err(AgentError::ScriptFailed {
                script: script.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout)
            .map(|stdout| stdout.trim_end_matches(['\n', '\r']).to_string())
            .map_err(|utf8_err| AgentError::InvalidOutput {
                script: script.to_string(),
                reason: utf8_err.to_string(),
            })
    }

    /// Whether the library application answers at all. Used as the fatal
    /// gate for commands that need the library.
    pub async fn is_library_available(&self) -> bool {
        match self.run_script(SCRIPT_LIBRARY_STATUS, &[], Some(Duration::from_secs(10))).await {
            Ok(response) => response.trim() == "running",
            Err(probe_err) => {
                log::warn!("Library availability probe failed: {probe_err}");
                false
            }
        }
    }

    /// Paged library scan. An empty artist filter means the whole library;
    /// `min_date_added` is a unix timestamp lower bound on `date_added`.
    pub async fn fetch_tracks(
        &self,
        artist_filter: Option<&str>,
        offset: usize,
        limit: usize,
        min_date_added: Option<i64>,
    ) -> Result<Vec<Track>, AgentError> {
        let offset_arg = offset.to_string();
        let limit_arg = limit.to_string();
        let min_date_arg = min_date_added.map(|ts| ts.to_string()).unwrap_or_default();
        let args = [artist_filter.unwrap_or(""), &offset_arg, &limit_arg, &min_date_arg];

        let raw = self.run_script(SCRIPT_FETCH_TRACKS, &args, None).await?;
        Ok(parse_track_records(&raw))
    }

    /// Fetches the whole library by paging until a short page comes back.
    pub async fn fetch_all_tracks(&self, artist_filter: Option<&str>, page_size: usize) -> Result<Vec<Track>, AgentError> {
        let mut all = Vec::new();
        let mut offset = 0;

        loop {
            let page = self.fetch_tracks(artist_filter, offset, page_size, None).await?;
            let page_len = page.len();
            all.extend(page);
            if page_len < page_size {
                break;
            }
            offset += page_size;
        }

        Ok(all)
    }

    /// Lightweight id-only scan used by the fast delta path.
    pub async fn fetch_all_track_ids(&self) -> Result<Vec<String>, AgentError> {
        let raw = self.run_script(SCRIPT_FETCH_TRACK_IDS, &[], None).await?;
        Ok(raw
            .split(RECORD_SEPARATOR)
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
            .collect())
    }

    pub async fn fetch_tracks_by_ids(&self, ids: &[String], timeout_override: Option<Duration>) -> Result<Vec<Track>, AgentError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids_arg = ids.join(",");
        let raw = self.run_script(SCRIPT_FETCH_TRACKS_BY_IDS, &[&ids_arg], timeout_override).await?;
        Ok(parse_track_records(&raw))
    }

    /// Per-id existence probe. Only "not_found" means the track is gone;
    /// every error path reports `Unknown`.
    pub async fn track_exists(&self, track_id: &str) -> Result<ExistenceResult, AgentError> {
        if track_id.is_empty() || !track_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ValidationError::TrackIdNotNumeric(track_id.to_string()).into());
        }

        match self.run_script(SCRIPT_TRACK_EXISTS, &[track_id], None).await {
            Ok(response) => match response.trim() {
                "exists" => Ok(ExistenceResult::Exists),
                "not_found" => Ok(ExistenceResult::NotFound),
                other => {
                    log::warn!("Existence probe for track {track_id} returned unexpected '{other}'; assuming present");
                    Ok(ExistenceResult::Unknown)
                }
            },
            Err(AgentError::ScriptFailed { stderr, .. }) => {
                log::warn!("Existence probe for track {track_id} failed ({stderr}); assuming present");
                Ok(ExistenceResult::Unknown)
            }
            Err(other) => Err(other),
        }
    }

    pub async fn update_property(&self, track_id: &str, field: &str, value: &str) -> Result<(), AgentError> {
        self.run_script(SCRIPT_UPDATE_PROPERTY, &[track_id, field, value], None).await?;
        Ok(())
    }

    /// Multi-track year write; returns how many tracks the agent reports as
    /// updated.
    pub async fn bulk_update_year(&self, track_ids: &[String], year: &str) -> Result<usize, AgentError> {
        if track_ids.is_empty() {
            return Ok(0);
        }
        let ids_arg = track_ids.join(",");
        let response = self.run_script(SCRIPT_BULK_UPDATE_YEAR, &[&ids_arg, year], None).await?;
        Ok(response.trim().parse().unwrap_or(track_ids.len()))
    }
}

fn sanitize_field(value: &str) -> String {
    if value == MISSING_VALUE {
        String::new()
    } else {
        value.to_string()
    }
}

/// Parses scan output into tracks. Splitting on the record separator alone
/// keeps single-record output (no separator present) as exactly one record
/// instead of shattering it into one row per field.
pub fn parse_track_records(raw: &str) -> Vec<Track> {
    let mut tracks = Vec::new();

    for (record_num, record) in raw.split(RECORD_SEPARATOR).enumerate() {
        if record.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = record.split(FIELD_SEPARATOR).collect();
        let Some(track) = track_from_fields(&fields) else {
            let preview: String = record.chars().take(100).collect();
            log::warn!(
                "Skipping record {} with insufficient fields ({} < {FIELD_COUNT_WITHOUT_ALBUM_ARTIST}): {preview:?}",
                record_num + 1,
                fields.len()
            );
            continue;
        };
        tracks.push(track);
    }

    tracks
}

fn track_from_fields(fields: &[&str]) -> Option<Track> {
    let has_album_artist = match fields.len() {
        n if n >= FIELD_COUNT_WITH_ALBUM_ARTIST => true,
        FIELD_COUNT_WITHOUT_ALBUM_ARTIST => false,
        _ => return None,
    };

    let id = sanitize_field(fields[0].trim());
    let mut track = Track::new(id).ok()?;
    track.name = sanitize_field(fields[1]);
    track.artist = sanitize_field(fields[2]);

    // The 11-field dialect has no album_artist; everything after `artist`
    // shifts down by one.
    let base = if has_album_artist {
        track.album_artist = sanitize_field(fields[3]);
        4
    } else {
        3
    };

    track.album = sanitize_field(fields[base]);
    track.genre = sanitize_field(fields[base + 1]);
    track.date_added = sanitize_field(fields[base + 2]);
    track.last_modified = sanitize_field(fields[base + 3]);
    track.track_status = sanitize_field(fields[base + 4]);
    track.year = sanitize_field(fields[base + 5].trim());
    track.release_year = sanitize_field(fields[base + 6].trim());

    Some(track)
}
