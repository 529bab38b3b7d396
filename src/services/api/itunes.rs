use serde::Deserialize;

use super::scoring::ReleaseCandidate;
use crate::services::ApiError;

pub const SOURCE_NAME: &str = "itunes";
pub const DEFAULT_BASE_URL: &str = "https://itunes.apple.com";

#[derive(Debug, Clone, Deserialize)]
struct ItunesResult {
    #[serde(rename = "collectionName")]
    collection_name: Option<String>,
    #[serde(rename = "artistName")]
    artist_name: Option<String>,
    #[serde(rename = "releaseDate")]
    release_date: Option<String>,
    country: Option<String>,
    #[serde(rename = "collectionType")]
    collection_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ItunesResponse {
    #[serde(default)]
    results: Vec<ItunesResult>,
}

impl ItunesResult {
    fn to_candidate(&self) -> Option<ReleaseCandidate> {
        let title = self.collection_name.clone()?;
        let year = self.release_date.as_deref().and_then(|date| {
            let prefix: String = date.chars().take(4).collect();
            prefix.parse().ok()
        });

        Some(ReleaseCandidate {
            source: SOURCE_NAME,
            title,
            artist: self.artist_name.clone().unwrap_or_default(),
            year,
            country: self.country.clone(),
            release_type: self.collection_type.as_deref().map(|t| t.to_lowercase()),
            status: None,
            release_group_id: None,
            master_id: None,
        })
    }
}

/// Search client for the iTunes lookup API. Optional source; no auth.
pub struct ItunesClient {
    http: reqwest::Client,
    base_url: String,
}

impl ItunesClient {
    pub fn new() -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent("tunekeeper/0.1")
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

    pub async fn search_releases(
        &self,
        artist: &str,
        album: &str,
        title_only: bool,
    ) -> Result<Vec<ReleaseCandidate>, ApiError> {
        let term = if title_only || artist.is_empty() {
            album.to_string()
        } else {
            format!("{artist} {album}")
        };

        let url = format!("{}/search", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("term", term.as_str()), ("entity", "album"), ("limit", "25")])
            .send()
            .await
            .map_err(|send_err| ApiError::Transient {
                source_name: SOURCE_NAME.to_string(),
                reason: send_err.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 403 {
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

        let parsed: ItunesResponse = response.json().await.map_err(|parse_err| ApiError::Malformed {
            source_name: SOURCE_NAME.to_string(),
            reason: parse_err.to_string(),
        })?;

        Ok(parsed.results.iter().filter_map(ItunesResult::to_candidate).collect())
    }
}
