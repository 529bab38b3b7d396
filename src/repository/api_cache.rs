use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::{write_bytes_atomic, RepositoryError};
use crate::utils::hash::hash_api_key;

/// Extra context carried with a cached API outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiResultMetadata {
    /// True when the source definitively answered "no such release".
    /// Distinguishes a cached negative from a plain cache miss.
    #[serde(default)]
    pub is_negative: bool,
    #[serde(default)]
    pub score: i32,
    #[serde(default)]
    pub is_definitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedApiResult {
    pub artist: String,
    pub album: String,
    pub source: String,
    pub year: Option<String>,
    pub timestamp: f64,
    #[serde(default)]
    pub metadata: ApiResultMetadata,
}

impl CachedApiResult {
    pub fn is_negative(&self) -> bool {
        self.metadata.is_negative
    }
}

const KNOWN_SOURCES: [&str; 3] = ["musicbrainz", "discogs", "itunes"];

/// Per-source cache of external lookups, including definitive negatives, so
/// repeated runs do not burn API quota on albums that already answered.
pub struct ApiResponseCache {
    entries: Mutex<HashMap<String, CachedApiResult>>,
    cache_file: PathBuf,
}

impl ApiResponseCache {
    pub fn new(cache_file: PathBuf) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cache_file,
        }
    }

    pub fn set_cached_result(
        &self,
        artist: &str,
        album: &str,
        source: &str,
        year: Option<String>,
        metadata: ApiResultMetadata,
    ) {
        let entry = CachedApiResult {
            artist: artist.to_string(),
            album: album.to_string(),
            source: source.to_string(),
            year,
            timestamp: unix_now(),
            metadata,
        };

        let key = hash_api_key(artist, album, source);
        let mut entries = self.entries.lock().expect("api cache lock poisoned");
        entries.insert(key, entry);
    }

    pub fn get_cached_result(&self, artist: &str, album: &str, source: &str) -> Option<CachedApiResult> {
        let key = hash_api_key(artist, album, source);
        let entries = self.entries.lock().expect("api cache lock poisoned");
        entries.get(&key).cloned()
    }

    /// Removes every source's entry for the album pair in one call.
    pub fn invalidate_for_album(&self, artist: &str, album: &str) -> usize {
        let keys: Vec<String> = KNOWN_SOURCES
            .iter()
            .map(|source| hash_api_key(artist, album, source))
            .collect();

        let mut entries = self.entries.lock().expect("api cache lock poisoned");
        keys.iter().filter(|key| entries.remove(*key).is_some()).count()
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock().expect("api cache lock poisoned");
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("api cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn save_to_disk(&self) -> Result<(), RepositoryError> {
        let payload: HashMap<String, CachedApiResult> = {
            let entries = self.entries.lock().expect("api cache lock poisoned");
            entries.clone()
        };

        let bytes = serde_json::to_vec_pretty(&payload)?;
        let target = self.cache_file.clone();
        tokio::task::spawn_blocking(move || write_bytes_atomic(&target, &bytes))
            .await
            .map_err(|join_err| std::io::Error::other(join_err.to_string()))??;

        log::info!("API response cache saved ({} entries)", payload.len());
        Ok(())
    }

    pub async fn load_from_disk(&self) -> Result<usize, RepositoryError> {
        if !self.cache_file.exists() {
            return Ok(0);
        }

        let raw = tokio::fs::read(&self.cache_file).await?;
        let payload: HashMap<String, CachedApiResult> = match serde_json::from_slice(&raw) {
            Ok(payload) => payload,
            Err(parse_err) => {
                log::warn!("API cache {} is corrupt, starting fresh: {parse_err}", self.cache_file.display());
                return Ok(0);
            }
        };

        let count = payload.len();
        let mut entries = self.entries.lock().expect("api cache lock poisoned");
        *entries = payload;
        Ok(count)
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
