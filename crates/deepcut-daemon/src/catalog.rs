//! Audius catalog client

use std::collections::HashMap;

use deepcut_proto::config::CatalogConfig;
use deepcut_proto::protocol::Track;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Preferred artwork sizes, smallest first.
const ARTWORK_SIZES: [&str; 3] = ["150x150", "480x480", "1000x1000"];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("catalog returned status {0}")]
    Status(u16),
    #[error("catalog response could not be decoded: {0}")]
    Decode(String),
}

/// Response envelope shared by the track list endpoints
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Vec<ApiTrack>>,
}

#[derive(Debug, Deserialize)]
struct ApiTrack {
    #[serde(default)]
    id: Value,
    title: Option<String>,
    user: Option<ApiUser>,
    artwork: Option<HashMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    name: Option<String>,
    handle: Option<String>,
}

impl ApiTrack {
    fn into_track(self, base_url: &str) -> Option<Track> {
        let id = match self.id {
            Value::Null => return None,
            Value::String(s) => s,
            other => other.to_string(),
        };
        let title = non_empty(self.title).unwrap_or_else(|| "Unknown".to_string());
        let artist = self
            .user
            .and_then(|u| non_empty(u.name).or_else(|| non_empty(u.handle)))
            .unwrap_or_else(|| "Unknown".to_string());
        let artwork_url = self.artwork.and_then(|art| {
            ARTWORK_SIZES.iter().find_map(|size| {
                non_empty(art.get(*size).and_then(Value::as_str).map(str::to_string))
            })
        });
        let stream_url = format!("{}/tracks/{}/stream", base_url, id);

        Some(Track {
            id,
            title,
            artist,
            artwork_url,
            stream_url,
        })
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

/// Turn a raw catalog response body into tracks.  A missing `data` list is
/// an empty result, not an error.
pub fn parse_tracks(body: &[u8], base_url: &str) -> Result<Vec<Track>, FetchError> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    let raw = envelope.data.unwrap_or_default();
    let total = raw.len();
    let tracks: Vec<Track> = raw
        .into_iter()
        .filter_map(|t| t.into_track(base_url))
        .collect();
    if tracks.len() < total {
        debug!("catalog: skipped {} entries without id", total - tracks.len());
    }
    Ok(tracks)
}

#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
    default_limit: u32,
}

impl CatalogClient {
    pub fn new(config: &CatalogConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_limit: config.default_limit,
        }
    }

    pub async fn fetch_trending(&self, limit: Option<u32>) -> Result<Vec<Track>, FetchError> {
        let limit = limit.unwrap_or(self.default_limit);
        let url = format!("{}/tracks/trending/underground", self.base_url);
        self.get_tracks(&url, &[("limit", limit.to_string())]).await
    }

    pub async fn search(&self, query: &str, limit: Option<u32>) -> Result<Vec<Track>, FetchError> {
        let limit = limit.unwrap_or(self.default_limit);
        let url = format!("{}/tracks/search", self.base_url);
        self.get_tracks(
            &url,
            &[("query", query.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    async fn get_tracks(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<Track>, FetchError> {
        debug!("catalog: GET {} {:?}", url, params);
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .query(params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let body = response.bytes().await?;
        parse_tracks(&body, &self.base_url)
    }
}
