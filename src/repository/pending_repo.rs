use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::{write_bytes_atomic, RepositoryError};
use crate::utils::hash::hash_album_key;
use crate::utils::timeutil;

/// An album whose year could not be confidently resolved, queued for a
/// re-check after its deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAlbumEntry {
    pub artist: String,
    pub album: String,
    /// Short token naming why the album is queued, e.g. `no_year_found`,
    /// `api_error`, `prerelease`, `low_confidence`, `mixed_album`,
    /// `contamination_suspected`.
    pub reason: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub first_marked_at: NaiveDateTime,
    #[serde(default)]
    pub last_checked_at: Option<NaiveDateTime>,
    pub next_check_at: NaiveDateTime,
    #[serde(default)]
    pub attempts: u32,
}

/// Durable map of albums awaiting re-verification. Every mutation is
/// persisted with an atomic write so the queue survives crashes.
pub struct PendingVerificationStore {
    entries: Mutex<HashMap<String, PendingAlbumEntry>>,
    store_file: PathBuf,
    default_recheck_days: i64,
    max_entries: usize,
}

impl PendingVerificationStore {
    pub fn new(store_file: PathBuf, default_recheck_days: i64, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            store_file,
            default_recheck_days,
            max_entries,
        }
    }

    /// Idempotent upsert: repeated marks keep the original `first_marked_at`
    /// and only refresh the reason, metadata, and deadline.
    pub async fn mark_for_verification(
        &self,
        artist: &str,
        album: &str,
        reason: &str,
        metadata: Option<BTreeMap<String, String>>,
        recheck_days: Option<i64>,
    ) -> Result<(), RepositoryError> {
        let now = timeutil::utc_now_naive();
        let days = recheck_days.unwrap_or(self.default_recheck_days);
        let next_check_at = now + Duration::days(days);
        let key = hash_album_key(artist, album);

        {
            let mut entries = self.entries.lock().expect("pending store lock poisoned");
            match entries.get_mut(&key) {
                Some(existing) => {
                    existing.reason = reason.to_string();
                    if let Some(metadata) = metadata {
                        existing.metadata = metadata;
                    }
                    existing.next_check_at = next_check_at;
                }
                None => {
                    entries.insert(
                        key,
                        PendingAlbumEntry {
                            artist: artist.to_string(),
                            album: album.to_string(),
                            reason: reason.to_string(),
                            metadata: metadata.unwrap_or_default(),
                            first_marked_at: now,
                            last_checked_at: None,
                            next_check_at,
                            attempts: 0,
                        },
                    );
                }
            }

            Self::enforce_cap(&mut entries, self.max_entries);
        }

        self.persist().await
    }

    pub fn get_entry(&self, artist: &str, album: &str) -> Option<PendingAlbumEntry> {
        let key = hash_album_key(artist, album);
        let entries = self.entries.lock().expect("pending store lock poisoned");
        entries.get(&key).cloned()
    }

    /// True iff the album is queued and its deadline has passed.
    pub fn is_verification_needed(&self, artist: &str, album: &str) -> bool {
        self.get_entry(artist, album)
            .is_some_and(|entry| entry.next_check_at <= timeutil::utc_now_naive())
    }

    pub fn get_all_pending(&self) -> Vec<PendingAlbumEntry> {
        let entries = self.entries.lock().expect("pending store lock poisoned");
        let mut all: Vec<PendingAlbumEntry> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.first_marked_at.cmp(&b.first_marked_at));
        all
    }

    pub fn get_due_entries(&self) -> Vec<PendingAlbumEntry> {
        let now = timeutil::utc_now_naive();
        self.get_all_pending()
            .into_iter()
            .filter(|entry| entry.next_check_at <= now)
            .collect()
    }

    /// Whether a verification pass is worth scheduling at all.
    pub fn should_auto_verify(&self) -> bool {
        !self.get_due_entries().is_empty()
    }

    pub async fn remove_from_pending(&self, artist: &str, album: &str) -> Result<bool, RepositoryError> {
        let key = hash_album_key(artist, album);
        let removed = {
            let mut entries = self.entries.lock().expect("pending store lock poisoned");
            entries.remove(&key).is_some()
        };

        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Records a failed re-check: bumps the attempt counter and pushes the
    /// deadline out by the default interval.
    pub async fn record_attempt(&self, artist: &str, album: &str) -> Result<(), RepositoryError> {
        let key = hash_album_key(artist, album);
        let now = timeutil::utc_now_naive();
        let touched = {
            let mut entries = self.entries.lock().expect("pending store lock poisoned");
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.attempts += 1;
                    entry.last_checked_at = Some(now);
                    entry.next_check_at = now + Duration::days(self.default_recheck_days);
                    true
                }
                None => false,
            }
        };

        if touched {
            self.persist().await?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pending store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enforce_cap(entries: &mut HashMap<String, PendingAlbumEntry>, max_entries: usize) {
        if entries.len() <= max_entries {
            return;
        }

        let mut by_age: Vec<(String, NaiveDateTime)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.first_marked_at))
            .collect();
        by_age.sort_by(|a, b| a.1.cmp(&b.1));

        let excess = entries.len() - max_entries;
        for (key, _) in by_age.into_iter().take(excess) {
            entries.remove(&key);
        }
        log::warn!("Pending verification store over cap; evicted {excess} oldest entries");
    }

    async fn persist(&self) -> Result<(), RepositoryError> {
        let payload: HashMap<String, PendingAlbumEntry> = {
            let entries = self.entries.lock().expect("pending store lock poisoned");
            entries.clone()
        };

        let bytes = serde_json::to_vec_pretty(&payload)?;
        let target = self.store_file.clone();
        tokio::task::spawn_blocking(move || write_bytes_atomic(&target, &bytes))
            .await
            .map_err(|join_err| std::io::Error::other(join_err.to_string()))??;
        Ok(())
    }

    pub async fn load_from_disk(&self) -> Result<usize, RepositoryError> {
        if !self.store_file.exists() {
            return Ok(0);
        }

        let raw = tokio::fs::read(&self.store_file).await?;
        let payload: HashMap<String, PendingAlbumEntry> = match serde_json::from_slice(&raw) {
            Ok(payload) => payload,
            Err(parse_err) => {
                log::warn!(
                    "Pending verification store {} is corrupt, starting fresh: {parse_err}",
                    self.store_file.display()
                );
                return Ok(0);
            }
        };

        let count = payload.len();
        let mut entries = self.entries.lock().expect("pending store lock poisoned");
        *entries = payload;
        Ok(count)
    }
}
