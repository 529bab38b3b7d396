use std::collections::HashMap;

use chrono::NaiveDateTime;

use super::agent::LibraryAgentClient;
use crate::domain::changelog::{ChangeLogEntry, ChangeType};
use crate::domain::track::Track;
use crate::utils::config::GenreUpdateConfig;
use crate::utils::timeutil;

/// Keeps every track of an artist on the artist's dominant genre.
///
/// Needs the FULL track set: the dominant genre is a property of the whole
/// discography, so incremental callers still pass everything and the
/// manager filters internally.
pub struct GenreManager<'a> {
    config: &'a GenreUpdateConfig,
    agent: &'a LibraryAgentClient,
    dry_run: bool,
}

impl<'a> GenreManager<'a> {
    pub fn new(config: &'a GenreUpdateConfig, agent: &'a LibraryAgentClient, dry_run: bool) -> Self {
        Self { config, agent, dry_run }
    }

    /// Aligns genres and returns the audit entries. `last_run` limits the
    /// writes to tracks added since then; the dominant-genre computation
    /// always uses everything.
    pub async fn update_genres(
        &self,
        tracks: &mut [Track],
        last_run: Option<NaiveDateTime>,
        force: bool,
    ) -> Vec<ChangeLogEntry> {
        if !self.config.enabled {
            return Vec::new();
        }

        let dominant = dominant_genre_per_artist(tracks);
        let mut changes = Vec::new();

        for track in tracks.iter_mut() {
            let Some(target_genre) = dominant.get(track.artist.as_str()) else {
                continue;
            };
            if track.genre == *target_genre {
                continue;
            }
            if !force && !added_since(track, last_run) {
                continue;
            }

            if !self.dry_run {
                if let Err(write_err) = self.agent.update_property(&track.id, "genre", target_genre).await {
                    log::warn!("Failed to write genre for track {}: {write_err}", track.id);
                    continue;
                }
            }

            changes.push(
                ChangeLogEntry::new(ChangeType::GenreUpdate, track.id.clone())
                    .with_context(track.artist.clone(), track.album.clone(), track.name.clone())
                    .with_values(track.genre.clone(), target_genre.clone())
                    .with_field("genre"),
            );
            track.genre = target_genre.clone();
        }

        if !changes.is_empty() {
            log::info!("Updated genres for {} tracks", changes.len());
        }
        changes
    }
}

fn added_since(track: &Track, last_run: Option<NaiveDateTime>) -> bool {
    let Some(last_run) = last_run else {
        return true;
    };
    match timeutil::parse_stored_timestamp(&track.date_added) {
        Some(added) => added >= last_run,
        None => true,
    }
}

/// The most frequent non-empty genre per artist. A tie resolves to the
/// genre of the tied track with the earliest `date_added`, falling back to
/// the lexicographically smaller genre when no dates help.
pub fn dominant_genre_per_artist(tracks: &[Track]) -> HashMap<String, String> {
    struct GenreTally {
        count: usize,
        earliest_added: String,
    }

    let mut per_artist: HashMap<&str, HashMap<&str, GenreTally>> = HashMap::new();
    for track in tracks {
        if track.artist.is_empty() || track.genre.is_empty() {
            continue;
        }
        let tally = per_artist
            .entry(track.artist.as_str())
            .or_default()
            .entry(track.genre.as_str())
            .or_insert_with(|| GenreTally { count: 0, earliest_added: track.date_added.clone() });
        tally.count += 1;
        if !track.date_added.is_empty()
            && (tally.earliest_added.is_empty() || track.date_added < tally.earliest_added)
        {
            tally.earliest_added = track.date_added.clone();
        }
    }

    per_artist
        .into_iter()
        .filter_map(|(artist, genres)| {
            genres
                .into_iter()
                .max_by(|(genre_a, tally_a), (genre_b, tally_b)| {
                    tally_a
                        .count
                        .cmp(&tally_b.count)
                        // Earlier date wins, so compare reversed.
                        .then_with(|| tally_b.earliest_added.cmp(&tally_a.earliest_added))
                        .then_with(|| genre_b.cmp(genre_a))
                })
                .map(|(genre, _)| (artist.to_string(), genre.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_helpers::make_track;

    fn track_with_genre(id: &str, artist: &str, genre: &str, date_added: &str) -> Track {
        let mut track = make_track(id, artist, "Album");
        track.genre = genre.to_string();
        track.date_added = date_added.to_string();
        track
    }

    #[test]
    fn test_majority_genre_wins() {
        let tracks = vec![
            track_with_genre("1", "Artist", "Metal", "2020-01-01 00:00:00"),
            track_with_genre("2", "Artist", "Metal", "2020-01-02 00:00:00"),
            track_with_genre("3", "Artist", "Rock", "2019-01-01 00:00:00"),
        ];

        let dominant = dominant_genre_per_artist(&tracks);
        assert_eq!(dominant.get("Artist").map(String::as_str), Some("Metal"));
    }

    #[test]
    fn test_tie_resolves_to_earliest_date_added() {
        let tracks = vec![
            track_with_genre("1", "Artist", "Metal", "2020-05-01 00:00:00"),
            track_with_genre("2", "Artist", "Rock", "2018-01-01 00:00:00"),
        ];

        let dominant = dominant_genre_per_artist(&tracks);
        assert_eq!(dominant.get("Artist").map(String::as_str), Some("Rock"));
    }

    #[test]
    fn test_tie_without_dates_is_deterministic() {
        let tracks = vec![
            track_with_genre("1", "Artist", "Zouk", ""),
            track_with_genre("2", "Artist", "Ambient", ""),
        ];

        let dominant = dominant_genre_per_artist(&tracks);
        assert_eq!(dominant.get("Artist").map(String::as_str), Some("Ambient"));
    }

    #[test]
    fn test_empty_genres_ignored() {
        let tracks = vec![
            track_with_genre("1", "Artist", "", "2020-01-01 00:00:00"),
            track_with_genre("2", "Artist", "", "2020-01-02 00:00:00"),
        ];
        assert!(dominant_genre_per_artist(&tracks).is_empty());
    }

    #[cfg(unix)]
    mod with_agent {
        use super::*;
        use crate::utils::config::AgentConfig;
        use std::os::unix::fs::PermissionsExt;

        fn agent_in(dir: &std::path::Path) -> LibraryAgentClient {
            let script = dir.join("update_property");
            std::fs::write(&script, "#!/bin/sh\nexit 0\n").expect("script");
            let mut perms = std::fs::metadata(&script).expect("meta").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).expect("chmod");

            let config = AgentConfig {
                scripts_dir: dir.to_path_buf(),
                script_timeout_secs: 5,
                requests_per_window: 100,
                window_seconds: 1.0,
                max_concurrent: 4,
            };
            let agent = LibraryAgentClient::new(&config).expect("agent");
            agent.initialize();
            agent
        }

        #[tokio::test]
        async fn test_minority_tracks_updated() {
            let dir = tempfile::tempdir().expect("tempdir");
            let agent = agent_in(dir.path());
            let config = GenreUpdateConfig::default();
            let manager = GenreManager::new(&config, &agent, false);

            let mut tracks = vec![
                track_with_genre("1", "Artist", "Metal", "2020-01-01 00:00:00"),
                track_with_genre("2", "Artist", "Metal", "2020-01-02 00:00:00"),
                track_with_genre("3", "Artist", "Rock", "2021-01-01 00:00:00"),
            ];

            let changes = manager.update_genres(&mut tracks, None, true).await;
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].track_id, "3");
            assert_eq!(changes[0].old_value, "Rock");
            assert_eq!(changes[0].new_value, "Metal");
            assert_eq!(tracks[2].genre, "Metal");
        }

        #[tokio::test]
        async fn test_incremental_scope_limits_writes_but_not_dominance() {
            let dir = tempfile::tempdir().expect("tempdir");
            let agent = agent_in(dir.path());
            let config = GenreUpdateConfig::default();
            let manager = GenreManager::new(&config, &agent, false);

            let last_run = chrono::NaiveDate::from_ymd_opt(2021, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
            let mut tracks = vec![
                // Old tracks establish dominance but are out of scope.
                track_with_genre("1", "Artist", "Metal", "2019-01-01 00:00:00"),
                track_with_genre("2", "Artist", "Metal", "2019-06-01 00:00:00"),
                track_with_genre("3", "Artist", "Rock", "2019-07-01 00:00:00"),
                // New track in scope gets aligned.
                track_with_genre("4", "Artist", "Pop", "2021-02-01 00:00:00"),
            ];

            let changes = manager.update_genres(&mut tracks, Some(last_run), false).await;
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].track_id, "4");
            // The out-of-scope minority track is untouched.
            assert_eq!(tracks[2].genre, "Rock");
        }

        #[tokio::test]
        async fn test_disabled_manager_is_a_noop() {
            let dir = tempfile::tempdir().expect("tempdir");
            let agent = agent_in(dir.path());
            let config = GenreUpdateConfig { enabled: false };
            let manager = GenreManager::new(&config, &agent, false);

            let mut tracks = vec![track_with_genre("1", "Artist", "Rock", "2020-01-01 00:00:00")];
            assert!(manager.update_genres(&mut tracks, None, true).await.is_empty());
        }
    }
}
