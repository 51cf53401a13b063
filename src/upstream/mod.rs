//! Typed facade over the remote media server HTTP API.
//!
//! Stateless apart from the sticky API key. Errors are classified so the
//! download manager can tell permanent failures from transient ones.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::store::{MediaKind, MediaMetadata};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream rejected credentials (HTTP {0})")]
    AuthFailed(u16),
    #[error("item not found on upstream (HTTP {0})")]
    NotFound(u16),
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("upstream request failed: {0}")]
    Other(String),
}

impl UpstreamError {
    /// Map an HTTP status to an error class.
    pub fn from_status(status: StatusCode) -> Option<Self> {
        let code = status.as_u16();
        match code {
            200..=299 => None,
            401 | 403 => Some(UpstreamError::AuthFailed(code)),
            404 | 410 => Some(UpstreamError::NotFound(code)),
            429 => Some(UpstreamError::Transient(format!("HTTP {}", code))),
            500..=599 => Some(UpstreamError::Transient(format!("HTTP {}", code))),
            _ => Some(UpstreamError::Other(format!("HTTP {}", code))),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        UpstreamError::Transient(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemInfo {
    #[serde(rename = "ServerName", default)]
    pub server_name: String,
    #[serde(rename = "Version", default)]
    pub version: String,
}

/// Wire shape of an upstream catalogue item.
#[derive(Debug, Clone, Deserialize)]
struct ItemDto {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Type", default)]
    item_type: String,
    #[serde(rename = "SeriesId")]
    series_id: Option<String>,
    #[serde(rename = "ParentIndexNumber")]
    season: Option<u32>,
    #[serde(rename = "IndexNumber")]
    episode: Option<u32>,
    #[serde(rename = "Container")]
    container: Option<String>,
    #[serde(rename = "Size")]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ItemsPage {
    #[serde(rename = "Items", default)]
    items: Vec<ItemDto>,
}

impl ItemDto {
    fn into_metadata(self) -> MediaMetadata {
        let kind = match self.item_type.as_str() {
            "Movie" => MediaKind::Movie,
            "Episode" => MediaKind::Episode,
            "Series" => MediaKind::Series,
            _ => MediaKind::Movie,
        };
        MediaMetadata {
            media_id: self.id,
            name: self.name,
            kind,
            series_id: self.series_id,
            season: self.season,
            episode: self.episode,
            container: self.container,
            byte_size: self.size.unwrap_or(0),
        }
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn test_connection(&self) -> Result<(), UpstreamError>;

    async fn get_system_info(&self) -> Result<SystemInfo, UpstreamError>;

    async fn get_item(&self, media_id: &str) -> Result<MediaMetadata, UpstreamError>;

    /// Episodes of a series season, ordered by episode number.
    async fn list_season(
        &self,
        series_id: &str,
        season: u32,
    ) -> Result<Vec<MediaMetadata>, UpstreamError>;

    /// Direct-stream URL for a media id, api key embedded for the proxy path.
    fn stream_url(&self, media_id: &str) -> String;
}

pub struct HttpUpstreamClient {
    base_url: String,
    api_key: String,
    user_id: String,
    http: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.server_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            user_id: config.user_id.clone(),
            http,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<T, UpstreamError> {
        debug!("Upstream request: {}", url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;
        if let Some(err) = UpstreamError::from_status(response.status()) {
            return Err(err);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| UpstreamError::Other(format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn test_connection(&self) -> Result<(), UpstreamError> {
        self.get_system_info().await.map(|_| ())
    }

    async fn get_system_info(&self) -> Result<SystemInfo, UpstreamError> {
        self.get_json(format!(
            "{}/System/Info?api_key={}",
            self.base_url, self.api_key
        ))
        .await
    }

    async fn get_item(&self, media_id: &str) -> Result<MediaMetadata, UpstreamError> {
        let dto: ItemDto = self
            .get_json(format!(
                "{}/Users/{}/Items/{}?api_key={}",
                self.base_url, self.user_id, media_id, self.api_key
            ))
            .await?;
        Ok(dto.into_metadata())
    }

    async fn list_season(
        &self,
        series_id: &str,
        season: u32,
    ) -> Result<Vec<MediaMetadata>, UpstreamError> {
        let page: ItemsPage = self
            .get_json(format!(
                "{}/Shows/{}/Episodes?seasonNumber={}&userId={}&api_key={}",
                self.base_url, series_id, season, self.user_id, self.api_key
            ))
            .await?;
        let mut episodes: Vec<MediaMetadata> =
            page.items.into_iter().map(ItemDto::into_metadata).collect();
        episodes.sort_by_key(|e| e.episode.unwrap_or(0));
        Ok(episodes)
    }

    fn stream_url(&self, media_id: &str) -> String {
        format!(
            "{}/Videos/{}/stream?static=true&api_key={}",
            self.base_url, media_id, self.api_key
        )
    }
}
