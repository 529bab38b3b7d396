use serde::Deserialize;

use super::scoring::ReleaseCandidate;
use crate::services::ApiError;

pub const SOURCE_NAME: &str = "discogs";
pub const DEFAULT_BASE_URL: &str = "https://api.discogs.com";

#[derive(Debug, Clone, Deserialize)]
struct DiscogsSearchResult {
    // Discogs search titles come as "Artist - Album".
    title: String,
    year: Option<String>,
    country: Option<String>,
    #[serde(default)]
    format: Vec<String>,
    master_id: Option<u64>,
    #[serde(rename = "type")]
    result_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DiscogsSearchResponse {
    #[serde(default)]
    results: Vec<DiscogsSearchResult>,
}

impl DiscogsSearchResult {
    fn to_candidate(&self) -> ReleaseCandidate {
        let (artist, album) = match self.title.split_once(" - ") {
            Some((artist, album)) => (artist.trim().to_string(), album.trim().to_string()),
            None => (String::new(), self.title.trim().to_string()),
        };

        // Discogs encodes compilations and bootlegs as format descriptors
        // rather than a release type.
        let lowered: Vec<String> = self.format.iter().map(|f| f.to_lowercase()).collect();
        let release_type = if lowered.iter().any(|f| f == "compilation") {
            Some("compilation".to_string())
        } else if lowered.iter().any(|f| f == "ep" || f == "single") {
            Some("ep".to_string())
        } else if lowered.iter().any(|f| f == "album" || f == "lp") {
            Some("album".to_string())
        } else {
            None
        };
        let status = lowered.iter().any(|f| f.contains("unofficial")).then(|| "bootleg".to_string());

        ReleaseCandidate {
            source: SOURCE_NAME,
            title: album,
            artist,
            year: self.year.as_deref().and_then(|y| y.trim().parse().ok()),
            country: self.country.clone(),
            release_type,
            status,
            release_group_id: None,
            master_id: self.master_id.map(|id| id.to_string()),
        }
    }
}

/// Search client for the Discogs database API, authenticated with a
/// personal token.
pub struct DiscogsClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl DiscogsClient {
    pub fn new(token: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent("tunekeeper/0.1")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|build_err| ApiError::Transient {
                source_name: SOURCE_NAME.to_string(),
                reason: build_err.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    pub async fn search_releases(
        &self,
        artist: &str,
        album: &str,
        title_only: bool,
    ) -> Result<Vec<ReleaseCandidate>, ApiError> {
        let url = format!("{}/database/search", self.base_url);
        let mut params: Vec<(&str, &str)> = vec![("type", "release"), ("token", &self.token)];
        if !title_only && !artist.is_empty() {
            params.push(("artist", artist));
        }
        params.push(("release_title", album));

        let response = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|send_err| ApiError::Transient {
                source_name: SOURCE_NAME.to_string(),
                reason: send_err.to_string(),
            })?;

        let status = response.status();
        match status.as_u16() {
            429 => return Err(ApiError::QuotaExhausted { source_name: SOURCE_NAME.to_string() }),
            401 | 403 => return Err(ApiError::Auth { source_name: SOURCE_NAME.to_string() }),
            code if status.is_server_error() => {
                return Err(ApiError::Transient {
                    source_name: SOURCE_NAME.to_string(),
                    reason: format!("HTTP {code}"),
                });
            }
            code if !status.is_success() => {
                return Err(ApiError::Malformed {
                    source_name: SOURCE_NAME.to_string(),
                    reason: format!("HTTP {code}"),
                });
            }
            _ => {}
        }

        let parsed: DiscogsSearchResponse = response.json().await.map_err(|parse_err| ApiError::Malformed {
            source_name: SOURCE_NAME.to_string(),
            reason: parse_err.to_string(),
        })?;

        let releases: Vec<ReleaseCandidate> = parsed
            .results
            .iter()
            .filter(|result| result.result_type == "release")
            .map(DiscogsSearchResult::to_candidate)
            .collect();

        log::debug!("Discogs returned {} release(s) for {artist} - {album}", releases.len());
        Ok(releases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> DiscogsClient {
        DiscogsClient::new("test_token").expect("client").with_base_url(&server.base_url())
    }

    #[tokio::test]
    async fn test_search_parses_and_filters_results() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/database/search")
                .query_param("token", "test_token")
                .query_param("artist", "Fear Factory")
                .query_param("release_title", "Demanufacture");
            then.status(200).json_body(serde_json::json!({
                "results": [
                    {
                        "id": 1,
                        "title": "Fear Factory - Demanufacture",
                        "year": "1995",
                        "country": "US",
                        "format": ["CD", "Album"],
                        "master_id": 7777,
                        "type": "release"
                    },
                    {
                        "id": 2,
                        "title": "Fear Factory - Demanufacture",
                        "year": "1995",
                        "type": "master"
                    }
                ]
            }));
        });

        let candidates = client(&server)
            .search_releases("Fear Factory", "Demanufacture", false)
            .await
            .expect("search");
        mock.assert();

        // The master entry is filtered out.
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert_eq!(candidate.artist, "Fear Factory");
        assert_eq!(candidate.title, "Demanufacture");
        assert_eq!(candidate.year, Some(1995));
        assert_eq!(candidate.master_id.as_deref(), Some("7777"));
        assert_eq!(candidate.release_type.as_deref(), Some("album"));
    }

    #[tokio::test]
    async fn test_quota_and_auth_mapping() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/database/search");
            then.status(429);
        });
        let err = client(&server).search_releases("A", "B", false).await.unwrap_err();
        assert!(matches!(err, ApiError::QuotaExhausted { .. }));

        let server2 = MockServer::start();
        server2.mock(|when, then| {
            when.method(GET).path("/database/search");
            then.status(401);
        });
        let err = client(&server2).search_releases("A", "B", false).await.unwrap_err();
        assert!(matches!(err, ApiError::Auth { .. }));
    }

    #[tokio::test]
    async fn test_compilation_format_detected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/database/search");
            then.status(200).json_body(serde_json::json!({
                "results": [{
                    "id": 3,
                    "title": "Various - Now 50",
                    "year": "2015",
                    "format": ["CD", "Compilation"],
                    "type": "release"
                }]
            }));
        });

        let candidates = client(&server).search_releases("", "Now 50", true).await.expect("search");
        assert_eq!(candidates[0].release_type.as_deref(), Some("compilation"));
    }
}
