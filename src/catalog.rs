//! External book catalog.
//!
//! [`CatalogProvider`] is the seam between the search cache and whatever
//! answers free-text book queries. [`GoogleBooksProvider`] is the production
//! implementation; tests plug in their own.
//!
//! Provider records are mapped into [`BookSearchResult`] with these rules:
//!
//! - id: provider id, else the first non-empty industry identifier, else a
//!   fresh UUID
//! - title: defaults to `"Untitled"` when absent or blank
//! - thumbnail: the full thumbnail over the small one
//! - info link: the direct link over the canonical volume link

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::CatalogConfig;
use crate::models::{BookSearchResult, UNTITLED};

/// Provenance tag stamped on every Google Books result.
pub const GOOGLE_BOOKS_SOURCE: &str = "google-books";

/// A free-text book lookup service.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Short provider name used in logs.
    fn name(&self) -> &str;

    /// Looks up `query`, returning at most `max_results` canonical results.
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<BookSearchResult>>;
}

/// Calls the Google Books volumes endpoint.
pub struct GoogleBooksProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl GoogleBooksProvider {
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl CatalogProvider for GoogleBooksProvider {
    fn name(&self) -> &str {
        GOOGLE_BOOKS_SOURCE
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<BookSearchResult>> {
        let max = max_results.to_string();
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("printType", "books"), ("maxResults", max.as_str())])
            .send()
            .await
            .context("catalog request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            bail!("catalog returned {}", status);
        }

        let payload: VolumesResponse = resp
            .json()
            .await
            .context("catalog returned an unreadable payload")?;

        Ok(payload.items.iter().map(map_volume).collect())
    }
}

#[derive(Debug, Default, Deserialize)]
struct VolumesResponse {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

/// A Google Books volume. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub volume_info: Option<VolumeInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_links: Option<ImageLinks>,
    #[serde(default)]
    pub info_link: Option<String>,
    #[serde(default)]
    pub canonical_volume_link: Option<String>,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub industry_identifiers: Option<Vec<IndustryIdentifier>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageLinks {
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub small_thumbnail: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IndustryIdentifier {
    #[serde(default)]
    pub identifier: Option<String>,
}

/// Maps one raw provider record. Records that do not even parse as a
/// volume still produce a result with a generated id.
pub fn map_volume(raw: &serde_json::Value) -> BookSearchResult {
    let volume: Volume = serde_json::from_value(raw.clone()).unwrap_or_default();
    volume_to_result(volume)
}

pub fn volume_to_result(volume: Volume) -> BookSearchResult {
    let info = volume.volume_info.unwrap_or_default();

    let from_identifiers = info
        .industry_identifiers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|i| i.identifier.as_deref())
        .map(str::trim)
        .find(|i| !i.is_empty())
        .map(str::to_string);

    let id = volume
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or(from_identifiers)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let title = info
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    let authors = info
        .authors
        .unwrap_or_default()
        .iter()
        .filter_map(|a| a.as_str())
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();

    let links = info.image_links.unwrap_or_default();

    BookSearchResult {
        id,
        title,
        authors,
        description: info.description.unwrap_or_default(),
        thumbnail: links.thumbnail.or(links.small_thumbnail),
        info_link: info.info_link.or(info.canonical_volume_link),
        published_date: info.published_date.unwrap_or_default(),
        source: GOOGLE_BOOKS_SOURCE.to_string(),
    }
}
