use serde::{Deserialize, Serialize};

use crate::utils::timeutil;

/// What kind of mutation an audit row documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    GenreUpdate,
    YearUpdate,
    YearUpdateError,
    NameChange,
    MetadataCleaning,
    YearRestoredFromReleaseYear,
    ArtistRename,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::GenreUpdate => "genre_update",
            ChangeType::YearUpdate => "year_update",
            ChangeType::YearUpdateError => "year_update_error",
            ChangeType::NameChange => "name_change",
            ChangeType::MetadataCleaning => "metadata_cleaning",
            ChangeType::YearRestoredFromReleaseYear => "year_restored_from_release_year",
            ChangeType::ArtistRename => "artist_rename",
        }
    }
}

/// One row of the audit report. Tracks are referenced by id string only,
/// never by pointer, so report rows cannot keep track records alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub timestamp: String,
    pub change_type: ChangeType,
    pub track_id: String,
    pub artist: String,
    pub album_name: String,
    pub track_name: String,
    pub old_value: String,
    pub new_value: String,
    #[serde(default)]
    pub field: Option<String>,
}

impl ChangeLogEntry {
    pub fn new(change_type: ChangeType, track_id: impl Into<String>) -> Self {
        Self {
            timestamp: timeutil::format_timestamp(timeutil::utc_now_naive()),
            change_type,
            track_id: track_id.into(),
            artist: String::new(),
            album_name: String::new(),
            track_name: String::new(),
            old_value: String::new(),
            new_value: String::new(),
            field: None,
        }
    }

    pub fn with_context(mut self, artist: impl Into<String>, album: impl Into<String>, track_name: impl Into<String>) -> Self {
        self.artist = artist.into();
        self.album_name = album.into();
        self.track_name = track_name.into();
        self
    }

    pub fn with_values(mut self, old_value: impl Into<String>, new_value: impl Into<String>) -> Self {
        self.old_value = old_value.into();
        self.new_value = new_value.into();
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}
