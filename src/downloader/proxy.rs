//! Cloud function backend: one POST, the response body is the video.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::BackendFailure;

use super::backend::{ArtifactPayload, AttemptRequest, BackendKind, DownloadBackend, error_message_from_body, until_cancelled};

const KIND: BackendKind = BackendKind::CloudFunction;

/// Progress reported before the request is sent.
const PROGRESS_REQUEST_SENT: f64 = 0.1;
/// Progress reported once response headers arrive.
const PROGRESS_HEADERS_RECEIVED: f64 = 0.5;

/// Video details from `GET /getVideoInfo`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteVideoInfo {
    #[serde(default)]
    pub title: String,
    /// Seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoInfoEnvelope {
    success: bool,
    #[serde(default)]
    data: Option<RemoteVideoInfo>,
    #[serde(default)]
    error: Option<String>,
}

pub struct ProxyBackend {
    client: Client,
    base_url: String,
    format: String,
}

impl ProxyBackend {
    pub fn new(client: Client, base_url: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            format: format.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Look up title, duration and thumbnail without downloading.
    pub async fn video_info(&self, source_url: &str) -> Result<RemoteVideoInfo, BackendFailure> {
        let resp = self
            .client
            .get(self.endpoint("getVideoInfo"))
            .query(&[("url", source_url)])
            .send()
            .await
            .map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;
        let envelope: VideoInfoEnvelope = serde_json::from_str(&body).map_err(|e| {
            BackendFailure::rejected(KIND, format!("unexpected getVideoInfo response ({status}): {e}"))
        })?;

        match envelope {
            VideoInfoEnvelope {
                success: true,
                data: Some(info),
                ..
            } => Ok(info),
            VideoInfoEnvelope { error, .. } => Err(BackendFailure::rejected(
                KIND,
                error.unwrap_or_else(|| format!("getVideoInfo returned {status}")),
            )),
        }
    }
}

#[async_trait]
impl DownloadBackend for ProxyBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn attempt(&self, request: &AttemptRequest<'_>) -> Result<ArtifactPayload, BackendFailure> {
        request.progress.report(PROGRESS_REQUEST_SENT);

        let send = self
            .client
            .post(self.endpoint("downloadVideo"))
            .json(&json!({ "url": request.source_url, "format": self.format }))
            .send();
        let resp = until_cancelled(KIND, request.cancel, send)
            .await?
            .map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = until_cancelled(KIND, request.cancel, resp.text()).await?.unwrap_or_default();
            let message = error_message_from_body(&body).unwrap_or_else(|| format!("HTTP {status}"));
            return Err(BackendFailure::rejected(KIND, message));
        }

        // A 2xx JSON body is an error envelope, never media.
        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        if is_json {
            let body = until_cancelled(KIND, request.cancel, resp.text())
                .await?
                .map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;
            let message = error_message_from_body(&body).unwrap_or_else(|| "proxy returned JSON instead of media".into());
            return Err(BackendFailure::rejected(KIND, message));
        }

        request.progress.report(PROGRESS_HEADERS_RECEIVED);

        let mut buf = BytesMut::with_capacity(resp.content_length().unwrap_or(0).min(64 * 1024 * 1024) as usize);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = until_cancelled(KIND, request.cancel, stream.next()).await? {
            let chunk = chunk.map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;
            buf.extend_from_slice(&chunk);
        }

        debug!(identifier = %request.identifier, bytes = buf.len(), "proxy download finished");
        Ok(ArtifactPayload::Bytes(buf.freeze()))
    }

    async fn health(&self) -> Result<bool, BackendFailure> {
        health_check(&self.client, &self.endpoint("health"), KIND).await
    }
}

/// `GET {base}/health` answering `{success: bool, ...}`.
pub(crate) async fn health_check(client: &Client, url: &str, backend: BackendKind) -> Result<bool, BackendFailure> {
    let resp = client.get(url).send().await.map_err(|e| BackendFailure::from_reqwest(backend, &e))?;
    if !resp.status().is_success() {
        return Ok(false);
    }
    let body: serde_json::Value = resp.json().await.map_err(|e| BackendFailure::from_reqwest(backend, &e))?;
    Ok(body.get("success").and_then(|s| s.as_bool()).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::Identifier;
    use crate::downloader::progress::{ProgressFn, ProgressForwarder};
    use crate::store::{ArtifactPolicy, ArtifactStore};
    use httpmock::prelude::*;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        store: ArtifactStore,
        identifier: Identifier,
        seen: Arc<Mutex<Vec<f64>>>,
        progress: ProgressForwarder,
        cancel: CancellationToken,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink_seen = seen.clone();
            let sink: ProgressFn = Arc::new(move |p| sink_seen.lock().unwrap().push(p));
            Self {
                store: ArtifactStore::new(dir.path().join("DownloadedVideos"), ArtifactPolicy::default()),
                identifier: Identifier::new("abc123").unwrap(),
                seen,
                progress: ProgressForwarder::new(sink),
                cancel: CancellationToken::new(),
                _dir: dir,
            }
        }

        fn request<'a>(&'a self, source_url: &'a str) -> AttemptRequest<'a> {
            AttemptRequest {
                source_url,
                identifier: &self.identifier,
                store: &self.store,
                progress: &self.progress,
                cancel: &self.cancel,
            }
        }
    }

    #[tokio::test]
    async fn test_success_returns_body_bytes() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/downloadVideo")
                    .json_body(json!({"url": "https://youtu.be/abc123", "format": "best[height<=720]"}));
                then.status(200).header("content-type", "video/mp4").body(vec![42u8; 4096]);
            })
            .await;

        let backend = ProxyBackend::new(Client::new(), server.base_url(), "best[height<=720]");
        let harness = Harness::new();
        let payload = backend.attempt(&harness.request("https://youtu.be/abc123")).await.unwrap();

        mock.assert_async().await;
        match payload {
            ArtifactPayload::Bytes(bytes) => assert_eq!(bytes.len(), 4096),
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(*harness.seen.lock().unwrap(), vec![0.1, 0.5]);
    }

    #[tokio::test]
    async fn test_error_envelope_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/downloadVideo");
                then.status(500)
                    .header("content-type", "application/json")
                    .json_body(json!({"success": false, "error": "video file not found"}));
            })
            .await;

        let backend = ProxyBackend::new(Client::new(), server.base_url(), "best");
        let harness = Harness::new();
        let err = backend.attempt(&harness.request("https://youtu.be/abc123")).await.unwrap_err();

        assert_eq!(err, BackendFailure::rejected(KIND, "video file not found"));
        assert_eq!(*harness.seen.lock().unwrap(), vec![0.1]);
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_failure() {
        let backend = ProxyBackend::new(Client::new(), "http://127.0.0.1:9", "best");
        let harness = Harness::new();
        let err = backend.attempt(&harness.request("https://youtu.be/abc123")).await.unwrap_err();
        assert!(matches!(err, BackendFailure::Network { .. } | BackendFailure::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let backend = ProxyBackend::new(Client::new(), "http://127.0.0.1:9", "best");
        let harness = Harness::new();
        harness.cancel.cancel();
        let err = backend.attempt(&harness.request("https://youtu.be/abc123")).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_video_info_and_health() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/getVideoInfo").query_param("url", "https://youtu.be/abc123");
                then.status(200).json_body(json!({
                    "success": true,
                    "data": {"title": "Mirage jungle smoke", "duration": 31, "thumbnail": "https://i.ytimg.com/x.jpg", "formats": []}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200).json_body(json!({"success": true, "status": "healthy"}));
            })
            .await;

        let backend = ProxyBackend::new(Client::new(), format!("{}/", server.base_url()), "best");
        let info = backend.video_info("https://youtu.be/abc123").await.unwrap();
        assert_eq!(info.title, "Mirage jungle smoke");
        assert_eq!(info.duration, Some(31.0));
        assert!(backend.health().await.unwrap());
    }
}
