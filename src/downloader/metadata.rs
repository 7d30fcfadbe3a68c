//! Metadata API backend.
//!
//! The public video API only exposes metadata, never media. Depending on
//! [`MetadataFallback`] this backend refuses outright, looks the video up and
//! reports it as unsupported, or stores a text placeholder describing it.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::MetadataFallback;
use crate::error::BackendFailure;

use super::backend::{ArtifactPayload, AttemptRequest, BackendKind, DownloadBackend, until_cancelled};
use super::identifier::{Identifier, watch_url};

const KIND: BackendKind = BackendKind::MetadataApi;

const VIDEO_PARTS: &str = "snippet,contentDetails";

/// Thumbnail keys from best to worst.
const THUMBNAIL_PREFERENCE: [&str; 4] = ["high", "standard", "medium", "default"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    pub description: String,
    pub channel_title: String,
    pub published_at: String,
    /// Parsed from the ISO-8601 `contentDetails.duration`.
    pub duration_secs: Option<u64>,
    /// `(size key, url)` pairs in response order.
    pub thumbnails: Vec<(String, String)>,
}

impl VideoMetadata {
    pub fn best_thumbnail(&self) -> Option<&str> {
        THUMBNAIL_PREFERENCE.iter().find_map(|key| {
            self.thumbnails
                .iter()
                .find(|(size, _)| size == key)
                .map(|(_, url)| url.as_str())
        })
    }

    /// Text body written in place of media.
    pub fn placeholder_text(&self, identifier: &Identifier) -> String {
        let mut text = format!(
            "Title: {}\nChannel: {}\nPublished: {}\n",
            self.title, self.channel_title, self.published_at
        );
        if let Some(secs) = self.duration_secs {
            text.push_str(&format!("Duration: {}:{:02}\n", secs / 60, secs % 60));
        }
        text.push_str(&format!("Source: {}\n", watch_url(identifier)));
        if !self.description.is_empty() {
            text.push('\n');
            text.push_str(&self.description);
            text.push('\n');
        }
        text
    }
}

/// Parse `PT#H#M#S` (optionally with a `#D` day part). Returns None on anything else.
pub fn parse_iso8601_duration(raw: &str) -> Option<u64> {
    let rest = raw.strip_prefix('P')?;
    let (date, time) = match rest.split_once('T') {
        Some((date, time)) => (date, time),
        None => (rest, ""),
    };

    fn sum_units(part: &str, units: &[(char, u64)]) -> Option<u64> {
        let mut total = 0u64;
        let mut digits = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let (_, scale) = units.iter().find(|(unit, _)| *unit == c)?;
            let value: u64 = digits.parse().ok()?;
            total = total.checked_add(value.checked_mul(*scale)?)?;
            digits.clear();
        }
        digits.is_empty().then_some(total)
    }

    let days = sum_units(date, &[('D', 86_400)])?;
    let time = sum_units(time, &[('H', 3600), ('M', 60), ('S', 1)])?;
    Some(days + time)
}

/// Extract the first item of a `videos.list` response.
pub fn parse_video_metadata(v: &Value) -> Option<VideoMetadata> {
    let item = v.get("items")?.as_array()?.first()?;
    let snippet = item.get("snippet")?;
    let text = |key: &str, fallback: &str| {
        snippet
            .get(key)
            .and_then(|s| s.as_str())
            .unwrap_or(fallback)
            .to_string()
    };

    let thumbnails = snippet
        .get("thumbnails")
        .and_then(|t| t.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(size, thumb)| {
                    thumb
                        .get("url")
                        .and_then(|u| u.as_str())
                        .map(|url| (size.clone(), url.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Some(VideoMetadata {
        id: item.get("id").and_then(|i| i.as_str()).unwrap_or_default().to_string(),
        title: text("title", "Unknown Title"),
        description: text("description", ""),
        channel_title: text("channelTitle", "Unknown Channel"),
        published_at: text("publishedAt", ""),
        duration_secs: item
            .get("contentDetails")
            .and_then(|c| c.get("duration"))
            .and_then(|d| d.as_str())
            .and_then(parse_iso8601_duration),
        thumbnails,
    })
}

pub struct MetadataApiBackend {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    mode: MetadataFallback,
}

impl MetadataApiBackend {
    pub fn new(client: Client, api_base: impl Into<String>, api_key: Option<String>, mode: MetadataFallback) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            mode,
        }
    }

    pub fn mode(&self) -> MetadataFallback {
        self.mode
    }

    pub async fn fetch_metadata(&self, identifier: &Identifier) -> Result<VideoMetadata, BackendFailure> {
        let Some(key) = &self.api_key else {
            return Err(BackendFailure::rejected(KIND, "metadata API key is not configured"));
        };

        let resp = self
            .client
            .get(format!("{}/videos", self.api_base))
            .query(&[("part", VIDEO_PARTS), ("id", identifier.as_str()), ("key", key.as_str())])
            .send()
            .await
            .map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::FORBIDDEN => return Err(BackendFailure::rejected(KIND, "metadata API quota exceeded")),
            other => return Err(BackendFailure::rejected(KIND, format!("metadata API returned {other}"))),
        }

        let body: Value = resp.json().await.map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;
        parse_video_metadata(&body)
            .ok_or_else(|| BackendFailure::rejected(KIND, format!("no video found for id '{identifier}'")))
    }
}

#[async_trait]
impl DownloadBackend for MetadataApiBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn attempt(&self, request: &AttemptRequest<'_>) -> Result<ArtifactPayload, BackendFailure> {
        if self.mode == MetadataFallback::Disabled {
            return Err(BackendFailure::unsupported(KIND, "metadata fallback is disabled"));
        }

        request.progress.report(0.0);
        let metadata = until_cancelled(KIND, request.cancel, self.fetch_metadata(request.identifier)).await??;
        debug!(identifier = %request.identifier, title = %metadata.title, "metadata lookup succeeded");
        request.progress.report(1.0);

        match self.mode {
            MetadataFallback::Placeholder => Ok(ArtifactPayload::Placeholder(metadata.placeholder_text(request.identifier))),
            _ => Err(BackendFailure::unsupported(
                KIND,
                format!("'{}' has metadata but no downloadable media", metadata.title),
            )),
        }
    }

    async fn health(&self) -> Result<bool, BackendFailure> {
        Ok(self.mode == MetadataFallback::Disabled || self.api_key.is_some())
    }
}
