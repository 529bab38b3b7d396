use serde::Deserialize;

use super::scoring::ReleaseCandidate;
use crate::services::ApiError;

pub const SOURCE_NAME: &str = "musicbrainz";
pub const DEFAULT_BASE_URL: &str = "https://musicbrainz.org";

/* Serde types for the release search endpoint */

#[derive(Debug, Clone, Deserialize)]
struct MbArtistCredit {
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MbReleaseGroupRef {
    id: Option<String>,
    #[serde(rename = "primary-type")]
    primary_type: Option<String>,
    #[serde(rename = "secondary-types", default)]
    secondary_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MbSearchRelease {
    title: Option<String>,
    date: Option<String>,
    country: Option<String>,
    status: Option<String>,
    #[serde(rename = "artist-credit", default)]
    artist_credit: Vec<MbArtistCredit>,
    #[serde(rename = "release-group")]
    release_group: Option<MbReleaseGroupRef>,
}

#[derive(Debug, Clone, Deserialize)]
struct MbSearchResponse {
    #[serde(default)]
    releases: Vec<MbSearchRelease>,
    error: Option<String>,
}

impl MbSearchRelease {
    fn to_candidate(&self) -> Option<ReleaseCandidate> {
        let title = self.title.clone()?;
        let artist = self
            .artist_credit
            .first()
            .and_then(|credit| credit.name.clone())
            .unwrap_or_default();

        // Secondary types override the primary one for scoring: a
        // compilation of albums is still a compilation.
        let release_type = self
            .release_group
            .as_ref()
            .and_then(|group| {
                group
                    .secondary_types
                    .iter()
                    .find(|t| {
                        t.eq_ignore_ascii_case("compilation") || t.eq_ignore_ascii_case("live")
                    })
                    .cloned()
                    .or_else(|| group.primary_type.clone())
            });

        Some(ReleaseCandidate {
            source: SOURCE_NAME,
            title,
            artist,
            year: self.date.as_deref().and_then(parse_year_prefix),
            country: self.country.clone(),
            release_type,
            status: self.status.clone(),
            release_group_id: self.release_group.as_ref().and_then(|group| group.id.clone()),
            master_id: None,
        })
    }
}

fn parse_year_prefix(date: &str) -> Option<i32> {
    let prefix: String = date.chars().take(4).collect();
    if prefix.len() == 4 && prefix.chars().all(|c| c.is_ascii_digit()) {
        prefix.parse().ok()
    } else {
        None
    }
}

/// Search client for the MusicBrainz release endpoint. The caller is
/// responsible for rate limiting; this type only speaks the wire format.
pub struct MusicBrainzClient {
    http: reqwest::Client,
    base_url: String,
}

impl MusicBrainzClient {
    pub fn new(app_name: &str, contact_email: &str) -> Result<Self, ApiError> {
        let app = if app_name.is_empty() { "tunekeeper/0.1" } else { app_name };
        let user_agent = if contact_email.is_empty() {
            app.to_string()
        } else {
            format!("{app} ( {contact_email} )")
        };

        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|build_err| ApiError::Transient {
                source_name: SOURCE_NAME.to_string(),
                reason: build_err.to_string(),
            })?;

        Ok(Self { http, base_url: DEFAULT_BASE_URL.to_string() })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Searches releases. `title_only` is the relaxed fallback query used
    /// for soundtracks and various-artists compilations.
    pub async fn search_releases(
        &self,
        artist: &str,
        album: &str,
        title_only: bool,
    ) -> Result<Vec<ReleaseCandidate>, ApiError> {
        let query = if title_only {
            format!("release:\"{}\"", escape_lucene(album))
        } else {
            format!("artist:\"{}\" AND release:\"{}\"", escape_lucene(artist), escape_lucene(album))
        };

        let url = format!("{}/ws/2/release/", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("query", query.as_str()), ("fmt", "json"), ("limit", "25")])
            .send()
            .await
            .map_err(|send_err| ApiError::Transient {
                source_name: SOURCE_NAME.to_string(),
                reason: send_err.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 503 || status.as_u16() == 429 {
            return Err(ApiError::QuotaExhausted { source_name: SOURCE_NAME.to_string() });
        }
        if status.is_server_error() {
            return Err(ApiError::Transient {
                source_name: SOURCE_NAME.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(ApiError::Malformed {
                source_name: SOURCE_NAME.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        let parsed: MbSearchResponse = response.json().await.map_err(|parse_err| ApiError::Malformed {
            source_name: SOURCE_NAME.to_string(),
            reason: parse_err.to_string(),
        })?;

        if let Some(api_error) = parsed.error {
            return Err(ApiError::Malformed { source_name: SOURCE_NAME.to_string(), reason: api_error });
        }

        log::debug!("MusicBrainz returned {} release(s) for {artist} - {album}", parsed.releases.len());
        Ok(parsed.releases.iter().filter_map(MbSearchRelease::to_candidate).collect())
    }
}

fn escape_lucene(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if "\\+-!():^[]\"{}~*?|&/".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
