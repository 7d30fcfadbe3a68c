//! Contract shared by every download backend.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::BackendFailure;
use crate::store::ArtifactStore;

use super::identifier::Identifier;
use super::progress::ProgressForwarder;

/// Which strategy produced (or failed to produce) an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    CloudFunction,
    LocalAgent,
    MetadataApi,
}

impl BackendKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CloudFunction => "cloud-function",
            Self::LocalAgent => "local-agent",
            Self::MetadataApi => "metadata-api",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful attempt hands to the artifact store.
#[derive(Debug)]
pub enum ArtifactPayload {
    /// Media bytes held in memory.
    Bytes(Bytes),
    /// Media already streamed into a staging file handed out by the store.
    TempFile(PathBuf),
    /// Text describing the video; not playable media.
    Placeholder(String),
}

/// Everything a backend needs for one attempt.
pub struct AttemptRequest<'a> {
    pub source_url: &'a str,
    pub identifier: &'a Identifier,
    /// Scratch space for backends that stream to disk.
    pub store: &'a ArtifactStore,
    pub progress: &'a ProgressForwarder,
    pub cancel: &'a CancellationToken,
}

/// One strategy for turning a source URL into an artifact.
#[async_trait]
pub trait DownloadBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Attempt acquisition. Progress goes through `request.progress`;
    /// the attempt must return `BackendFailure::Cancelled` promptly once
    /// `request.cancel` fires.
    async fn attempt(&self, request: &AttemptRequest<'_>) -> Result<ArtifactPayload, BackendFailure>;

    /// Whether the remote side answers its health endpoint.
    async fn health(&self) -> Result<bool, BackendFailure> {
        Ok(true)
    }
}

/// Race `fut` against cancellation.
pub async fn until_cancelled<F>(backend: BackendKind, cancel: &CancellationToken, fut: F) -> Result<F::Output, BackendFailure>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackendFailure::Cancelled { backend }),
        out = fut => Ok(out),
    }
}

/// Sleep that wakes early on cancellation.
pub async fn cancellable_sleep(
    backend: BackendKind,
    cancel: &CancellationToken,
    delay: Duration,
) -> Result<(), BackendFailure> {
    until_cancelled(backend, cancel, tokio::time::sleep(delay)).await
}

/// Pull a `{success:false, error}` message out of an error body, if it has one.
pub fn error_message_from_body(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_until_cancelled_returns_output() {
        let cancel = CancellationToken::new();
        let out = until_cancelled(BackendKind::LocalAgent, &cancel, async { 7 }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn test_until_cancelled_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = until_cancelled(BackendKind::LocalAgent, &cancel, async { 7 }).await;
        assert_eq!(out, Err(BackendFailure::Cancelled { backend: BackendKind::LocalAgent }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellable_sleep_wakes_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let out = cancellable_sleep(BackendKind::LocalAgent, &cancel, Duration::from_secs(3600)).await;
        assert!(matches!(out, Err(BackendFailure::Cancelled { .. })));
    }

    #[test]
    fn test_error_message_from_body() {
        assert_eq!(
            error_message_from_body(r#"{"success":false,"error":"url is required"}"#),
            Some("url is required".to_string())
        );
        assert_eq!(error_message_from_body(r#"{"success":false}"#), None);
        assert_eq!(error_message_from_body("<html>"), None);
    }

    #[test]
    fn test_backend_kind_names() {
        assert_eq!(BackendKind::CloudFunction.to_string(), "cloud-function");
        assert_eq!(serde_json::to_string(&BackendKind::MetadataApi).unwrap(), "\"metadata-api\"");
    }
}
