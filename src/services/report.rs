use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::domain::changelog::ChangeLogEntry;
use crate::repository::{write_bytes_atomic, RepositoryError};
use crate::utils::timeutil;

pub const CHANGE_FIELDNAMES: [&str; 9] = [
    "timestamp",
    "change_type",
    "track_id",
    "artist",
    "album_name",
    "track_name",
    "old_value",
    "new_value",
    "field",
];

/// Writes the audit report. Zero-change runs still log a summary but do
/// not touch the file. With `timestamped` the report goes to a fresh
/// `<stem>_<timestamp>.csv` instead of overwriting.
pub fn save_changes_report(
    changes: &[ChangeLogEntry],
    report_path: &Path,
    timestamped: bool,
) -> Result<Option<PathBuf>, RepositoryError> {
    log_summary(changes);

    if changes.is_empty() {
        return Ok(None);
    }

    let target = if timestamped {
        timestamped_path(report_path)
    } else {
        report_path.to_path_buf()
    };

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CHANGE_FIELDNAMES)?;
    for change in changes {
        writer.write_record([
            change.timestamp.as_str(),
            change.change_type.as_str(),
            change.track_id.as_str(),
            change.artist.as_str(),
            change.album_name.as_str(),
            change.track_name.as_str(),
            change.old_value.as_str(),
            change.new_value.as_str(),
            change.field.as_deref().unwrap_or(""),
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|flush_err| std::io::Error::other(flush_err.to_string()))?;
    write_bytes_atomic(&target, &bytes)?;

    log::info!("Changes report saved to {} ({} entries)", target.display(), changes.len());
    Ok(Some(target))
}

fn log_summary(changes: &[ChangeLogEntry]) {
    if changes.is_empty() {
        log::info!("No changes made during this run");
        return;
    }

    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for change in changes {
        *by_type.entry(change.change_type.as_str()).or_insert(0) += 1;
    }

    let breakdown: Vec<String> = by_type.iter().map(|(kind, count)| format!("{kind}: {count}")).collect();
    log::info!("Change breakdown: {}", breakdown.join(", "));
}

fn timestamped_path(report_path: &Path) -> PathBuf {
    let stamp = timeutil::utc_now_naive().format("%Y%m%d_%H%M%S");
    let stem = report_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "changes_report".to_string());
    let extension = report_path.extension().map(|e| e.to_string_lossy().to_string()).unwrap_or_else(|| "csv".to_string());
    report_path.with_file_name(format!("{stem}_{stamp}.{extension}"))
}

/// Reads a report back; used by the revert command.
pub fn load_changes_report(report_path: &Path) -> Result<Vec<ChangeLogEntry>, RepositoryError> {
    use crate::domain::changelog::ChangeType;

    if !report_path.exists() {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(report_path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let index_of = |name: &str| headers.iter().position(|h| h == name);

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(row_err) => {
                log::warn!("Skipping unreadable report row: {row_err}");
                continue;
            }
        };
        let field = |name: &str| -> String {
            index_of(name)
                .and_then(|idx| record.get(idx))
                .map(|v| v.to_string())
                .unwrap_or_default()
        };

        let change_type = match field("change_type").as_str() {
            "genre_update" => ChangeType::GenreUpdate,
            "year_update" => ChangeType::YearUpdate,
            "year_update_error" => ChangeType::YearUpdateError,
            "name_change" => ChangeType::NameChange,
            "metadata_cleaning" => ChangeType::MetadataCleaning,
            "year_restored_from_release_year" => ChangeType::YearRestoredFromReleaseYear,
            "artist_rename" => ChangeType::ArtistRename,
            other => {
                log::warn!("Unknown change_type '{other}' in report; skipping row");
                continue;
            }
        };

        let field_value = field("field");
        entries.push(ChangeLogEntry {
            timestamp: field("timestamp"),
            change_type,
            track_id: field("track_id"),
            artist: field("artist"),
            album_name: field("album_name"),
            track_name: field("track_name"),
            old_value: field("old_value"),
            new_value: field("new_value"),
            field: (!field_value.is_empty()).then_some(field_value),
        });
    }

    Ok(entries)
}
