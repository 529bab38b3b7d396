use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::{write_bytes_atomic, RepositoryError};
use crate::domain::ValidationError;
use crate::utils::hash::hash_album_key;

/// One resolved album year with the confidence it was resolved at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumCacheEntry {
    pub artist: String,
    pub album: String,
    pub year: String,
    /// 0-100 score; entries at or above the trust threshold short-circuit
    /// API calls.
    pub confidence: u8,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlbumCacheStats {
    pub total_albums: usize,
    pub trusted_albums: usize,
}

/// Typed cache of `(artist, album) -> {year, confidence}` with JSON
/// persistence. Entries do not expire; better evidence overwrites them.
pub struct AlbumYearCache {
    entries: Mutex<HashMap<String, AlbumCacheEntry>>,
    cache_file: PathBuf,
    trust_threshold: u8,
}

impl AlbumYearCache {
    pub fn new(cache_file: PathBuf, trust_threshold: u8) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cache_file,
            trust_threshold,
        }
    }

    pub fn store_album_year(
        &self,
        artist: &str,
        album: &str,
        year: &str,
        confidence: i64,
    ) -> Result<(), ValidationError> {
        if !(0..=100).contains(&confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(confidence));
        }

        let entry = AlbumCacheEntry {
            artist: artist.to_string(),
            album: album.to_string(),
            year: year.to_string(),
            confidence: confidence as u8,
            timestamp: unix_now(),
        };

        let key = hash_album_key(artist, album);
        let mut entries = self.entries.lock().expect("album cache lock poisoned");
        entries.insert(key, entry);
        Ok(())
    }

    /// The string shortcut most callers want.
    pub fn get_album_year(&self, artist: &str, album: &str) -> Option<String> {
        self.get_album_year_entry(artist, album).map(|entry| entry.year)
    }

    pub fn get_album_year_entry(&self, artist: &str, album: &str) -> Option<AlbumCacheEntry> {
        let key = hash_album_key(artist, album);
        let entries = self.entries.lock().expect("album cache lock poisoned");
        entries.get(&key).cloned()
    }

    /// Whether the stored entry is confident enough to skip the APIs.
    pub fn has_trusted_entry(&self, artist: &str, album: &str) -> bool {
        self.get_album_year_entry(artist, album)
            .is_some_and(|entry| entry.confidence >= self.trust_threshold)
    }

    pub fn invalidate_album(&self, artist: &str, album: &str) -> bool {
        let key = hash_album_key(artist, album);
        let mut entries = self.entries.lock().expect("album cache lock poisoned");
        entries.remove(&key).is_some()
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock().expect("album cache lock poisoned");
        let count = entries.len();
        entries.clear();
        log::info!("Cleared album year cache ({count} entries)");
    }

    pub fn get_stats(&self) -> AlbumCacheStats {
        let entries = self.entries.lock().expect("album cache lock poisoned");
        AlbumCacheStats {
            total_albums: entries.len(),
            trusted_albums: entries
                .values()
                .filter(|e| e.confidence >= self.trust_threshold)
                .count(),
        }
    }

    pub async fn save_to_disk(&self) -> Result<(), RepositoryError> {
        let payload: HashMap<String, AlbumCacheEntry> = {
            let entries = self.entries.lock().expect("album cache lock poisoned");
            entries.clone()
        };

        let bytes = serde_json::to_vec_pretty(&payload)?;
        let target = self.cache_file.clone();
        tokio::task::spawn_blocking(move || write_bytes_atomic(&target, &bytes))
            .await
            .map_err(|join_err| std::io::Error::other(join_err.to_string()))??;

        log::info!("Album year cache saved ({} entries)", payload.len());
        Ok(())
    }

    pub async fn load_from_disk(&self) -> Result<usize, RepositoryError> {
        if !self.cache_file.exists() {
            return Ok(0);
        }

        let raw = tokio::fs::read(&self.cache_file).await?;
        let payload: HashMap<String, AlbumCacheEntry> = match serde_json::from_slice(&raw) {
            Ok(payload) => payload,
            Err(parse_err) => {
                log::warn!("Album year cache {} is corrupt, starting fresh: {parse_err}", self.cache_file.display());
                return Ok(0);
            }
        };

        let count = payload.len();
        let mut entries = self.entries.lock().expect("album cache lock poisoned");
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
