use std::collections::HashMap;
use std::path::PathBuf;

use super::{write_bytes_atomic, RepositoryError};
use crate::domain::track::Track;

pub const TRACK_FIELDNAMES: [&str; 11] = [
    "id",
    "name",
    "artist",
    "album",
    "genre",
    "year",
    "date_added",
    "last_modified",
    "track_status",
    "year_before_mgu",
    "year_set_by_mgu",
];

/// The CSV projection of the library. Reading tolerates missing columns and
/// legacy column names; writing is atomic and sorted by id.
pub struct TrackListRepository {
    csv_path: PathBuf,
}

impl TrackListRepository {
    pub fn new(csv_path: PathBuf) -> Self {
        Self { csv_path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.csv_path
    }

    /// Loads the projection into an id-keyed map. Rows with an empty id are
    /// skipped; a file that does not exist yet is an empty projection.
    pub fn load(&self) -> Result<HashMap<String, Track>, RepositoryError> {
        let mut track_map = HashMap::new();
        if !self.csv_path.exists() {
            return Ok(track_map);
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.csv_path)?;

        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let missing: Vec<&str> = TRACK_FIELDNAMES
            .iter()
            .copied()
            .filter(|field| !headers.iter().any(|h| h == field))
            .collect();
        if !missing.is_empty() {
            log::warn!(
                "CSV header in {} is missing columns {:?}; loading with available fields",
                self.csv_path.display(),
                missing
            );
        }

        let index_of = |name: &str| headers.iter().position(|h| h == name);
        let column_indices: HashMap<&str, usize> = TRACK_FIELDNAMES
            .iter()
            .copied()
            .chain(["old_year", "new_year"])
            .filter_map(|field| index_of(field).map(|idx| (field, idx)))
            .collect();

        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(row_err) => {
                    log::warn!("Skipping unreadable CSV row: {row_err}");
                    continue;
                }
            };

            let field = |name: &str| -> String {
                column_indices
                    .get(name)
                    .and_then(|idx| record.get(*idx))
                    .map(|value| value.trim().to_string())
                    .unwrap_or_default()
            };

            let id = field("id");
            if id.is_empty() {
                continue;
            }

            let mut track = Track::new(id)?;
            track.name = field("name");
            track.artist = field("artist");
            track.album = field("album");
            track.genre = field("genre");
            track.year = field("year");
            track.date_added = field("date_added");
            track.last_modified = field("last_modified");
            track.track_status = field("track_status");

            // Auto-migration of the legacy column names.
            track.year_before_mgu = non_empty_or(field("year_before_mgu"), field("old_year"));
            track.year_set_by_mgu = non_empty_or(field("year_set_by_mgu"), field("new_year"));

            track_map.insert(track.id.clone(), track);
        }

        log::info!("Loaded {} tracks from {}", track_map.len(), self.csv_path.display());
        Ok(track_map)
    }

    /// Writes the projection atomically, rows sorted by id for stable diffs.
    pub fn save(&self, track_map: &HashMap<String, Track>) -> Result<(), RepositoryError> {
        let mut sorted: Vec<&Track> = track_map.values().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(TRACK_FIELDNAMES)?;
        for track in sorted {
            writer.write_record([
                track.id.as_str(),
                track.name.as_str(),
                track.artist.as_str(),
                track.album.as_str(),
                track.genre.as_str(),
                track.year.as_str(),
                track.date_added.as_str(),
                track.last_modified.as_str(),
                track.track_status.as_str(),
                track.year_before_mgu.as_str(),
                track.year_set_by_mgu.as_str(),
            ])?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|flush_err| std::io::Error::other(flush_err.to_string()))?;
        write_bytes_atomic(&self.csv_path, &bytes)?;

        log::info!("Tracks saved to {} ({} entries)", self.csv_path.display(), track_map.len());
        Ok(())
    }
}

fn non_empty_or(primary: String, fallback: String) -> String {
    if primary.is_empty() { fallback } else { primary }
}
