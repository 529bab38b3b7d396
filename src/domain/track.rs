use serde::{Deserialize, Serialize};

use super::ValidationError;

/// Availability of a track as reported by the library agent.
///
/// Anything the agent reports that we do not recognise is kept verbatim in
/// `Unknown` and treated as available-but-editable-unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TrackStatus {
    Subscription,
    Prerelease,
    Purchased,
    Matched,
    Unknown(String),
}

impl From<String> for TrackStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "subscription" => TrackStatus::Subscription,
            "prerelease" => TrackStatus::Prerelease,
            "purchased" => TrackStatus::Purchased,
            "matched" => TrackStatus::Matched,
            _ => TrackStatus::Unknown(raw),
        }
    }
}

impl From<TrackStatus> for String {
    fn from(status: TrackStatus) -> Self {
        status.as_str().to_string()
    }
}

impl TrackStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TrackStatus::Subscription => "subscription",
            TrackStatus::Prerelease => "prerelease",
            TrackStatus::Purchased => "purchased",
            TrackStatus::Matched => "matched",
            TrackStatus::Unknown(raw) => raw,
        }
    }
}

/// A single library track as this tool sees it.
///
/// `year_before_mgu` and `year_set_by_mgu` are tracking fields owned by the
/// year pipeline; a plain sync from the agent never overwrites them. The
/// rest mirrors the agent's scan output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub artist: String,
    #[serde(default)]
    pub album_artist: String,
    pub album: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub year: String,
    #[serde(default)]
    pub release_year: String,
    #[serde(default)]
    pub date_added: String,
    #[serde(default)]
    pub last_modified: String,
    #[serde(default)]
    pub track_status: String,
    #[serde(default)]
    pub year_before_mgu: String,
    #[serde(default)]
    pub year_set_by_mgu: String,
}

impl Track {
    pub fn new<S: Into<String>>(id: S) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::TrackIdIsEmpty);
        }

        Ok(Self {
            id,
            name: String::new(),
            artist: String::new(),
            album_artist: String::new(),
            album: String::new(),
            genre: String::new(),
            year: String::new(),
            release_year: String::new(),
            date_added: String::new(),
            last_modified: String::new(),
            track_status: String::new(),
            year_before_mgu: String::new(),
            year_set_by_mgu: String::new(),
        })
    }

    pub fn status(&self) -> TrackStatus {
        TrackStatus::from(self.track_status.clone())
    }

    pub fn is_prerelease(&self) -> bool {
        self.status() == TrackStatus::Prerelease
    }

    /// Whether a write through the library agent is expected to stick.
    pub fn is_editable(&self) -> bool {
        !self.is_prerelease()
    }

    /// Parsed library year, if present and numeric.
    pub fn year_value(&self) -> Option<i32> {
        parse_year(&self.year)
    }

    pub fn release_year_value(&self) -> Option<i32> {
        parse_year(&self.release_year)
    }

    /// Year portion of `date_added`, tolerant of the agent's date formats.
    pub fn date_added_year(&self) -> Option<i32> {
        let prefix: String = self.date_added.chars().take(4).collect();
        if prefix.len() == 4 && prefix.chars().all(|c| c.is_ascii_digit()) {
            prefix.parse().ok()
        } else {
            None
        }
    }
}

fn parse_year(raw: &str) -> Option<i32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<i32>().ok().filter(|y| (0..=9999).contains(y))
}
