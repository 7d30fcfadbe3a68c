//! Download orchestrator.
//!
//! Runs the backends in priority order until one produces media, then hands
//! the payload to the artifact store:
//!
//! ```text
//! Idle -> TryingBackend(0) -> TryingBackend(1) -> ... -> Persisting -> Done
//!                  \__________________\_______________________\-> Failed
//! ```
//!
//! Backend failures are logged and swallowed; only exhaustion, cancellation
//! and store failures reach the caller.

use std::sync::Arc;

use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AcquisitionSettings, validate_source_url};
use crate::error::{AcquisitionError, BackendFailure};
use crate::store::{Artifact, ArtifactSource, ArtifactStore};

use super::agent::{HttpAgentTransport, LocalAgentBackend};
use super::backend::{ArtifactPayload, AttemptRequest, BackendKind, DownloadBackend};
use super::identifier::{Identifier, extract_identifier};
use super::metadata::MetadataApiBackend;
use super::progress::{ProgressFn, ProgressForwarder};
use super::proxy::ProxyBackend;

/// Where a job is in the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "backend", rename_all = "camelCase")]
pub enum JobState {
    Idle,
    TryingBackend(usize),
    Persisting,
    Done,
    Failed,
}

/// One in-flight acquisition. Lives only for the duration of `acquire`.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: Uuid,
    pub source_url: String,
    pub identifier: Identifier,
    pub state: JobState,
}

impl DownloadJob {
    fn new(source_url: &str, identifier: Identifier) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_url: source_url.to_string(),
            identifier,
            state: JobState::Idle,
        }
    }

    fn transition(&mut self, next: JobState) {
        debug!(job_id = %self.id, identifier = %self.identifier, from = ?self.state, to = ?next, "job state");
        self.state = next;
    }
}

/// Health of one configured backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendHealth {
    pub backend: BackendKind,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Orchestrator {
    backends: Vec<Arc<dyn DownloadBackend>>,
    store: Arc<ArtifactStore>,
}

impl Orchestrator {
    /// Backends are tried in the order given.
    pub fn new(backends: Vec<Arc<dyn DownloadBackend>>, store: Arc<ArtifactStore>) -> Self {
        Self { backends, store }
    }

    /// Proxy, then local agent, then metadata API. Backends without a base URL are skipped.
    pub fn from_settings(settings: &AcquisitionSettings, client: Client) -> Self {
        let mut backends: Vec<Arc<dyn DownloadBackend>> = Vec::new();

        if let Some(base) = &settings.proxy_base_url {
            backends.push(Arc::new(ProxyBackend::new(client.clone(), base, &settings.format)));
        }
        if let Some(base) = &settings.agent_base_url {
            let transport = HttpAgentTransport::new(client.clone(), base, &settings.format, &settings.output_template);
            backends.push(Arc::new(LocalAgentBackend::new(transport, settings.poll.clone())));
        }
        backends.push(Arc::new(MetadataApiBackend::new(
            client,
            &settings.metadata_api_base,
            settings.metadata_api_key.clone(),
            settings.metadata_fallback,
        )));

        Self::new(backends, Arc::new(ArtifactStore::from_settings(settings)))
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn backend_kinds(&self) -> Vec<BackendKind> {
        self.backends.iter().map(|b| b.kind()).collect()
    }

    /// Acquire `source_url` and return the stored artifact.
    ///
    /// `on_progress` sees non-decreasing values within one backend attempt and
    /// restarts when the cascade moves to the next backend.
    pub async fn acquire(
        &self,
        source_url: &str,
        on_progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<Artifact, AcquisitionError> {
        validate_source_url(source_url)?;
        let identifier = extract_identifier(source_url)
            .ok_or_else(|| AcquisitionError::InvalidSource(format!("no video identifier in '{source_url}'")))?;

        let mut job = DownloadJob::new(source_url, identifier);
        info!(job_id = %job.id, identifier = %job.identifier, "acquisition started");

        let mut last_failure: Option<BackendFailure> = None;
        let mut payload = None;

        for (index, backend) in self.backends.iter().enumerate() {
            if cancel.is_cancelled() {
                job.transition(JobState::Failed);
                return Err(AcquisitionError::Cancelled);
            }
            job.transition(JobState::TryingBackend(index));

            let progress = ProgressForwarder::new(on_progress.clone());
            let request = AttemptRequest {
                source_url: &job.source_url,
                identifier: &job.identifier,
                store: &self.store,
                progress: &progress,
                cancel,
            };

            match backend.attempt(&request).await {
                Ok(result) => {
                    payload = Some(result);
                    break;
                }
                Err(failure) if failure.is_cancelled() => {
                    job.transition(JobState::Failed);
                    info!(job_id = %job.id, backend = %backend.kind(), "acquisition cancelled");
                    return Err(AcquisitionError::Cancelled);
                }
                Err(failure) => {
                    warn!(job_id = %job.id, identifier = %job.identifier, backend = %backend.kind(), error = %failure, "backend failed, trying next");
                    last_failure = Some(failure);
                }
            }
        }

        let Some(payload) = payload else {
            job.transition(JobState::Failed);
            let last = last_failure.ok_or_else(|| AcquisitionError::Internal("no download backends configured".into()))?;
            return Err(AcquisitionError::AllBackendsFailed { last });
        };

        job.transition(JobState::Persisting);
        let stored = match payload {
            ArtifactPayload::Bytes(bytes) => self.store.persist(&job.identifier, ArtifactSource::Bytes(bytes)).await,
            ArtifactPayload::TempFile(path) => self.store.persist(&job.identifier, ArtifactSource::TempFile(path)).await,
            ArtifactPayload::Placeholder(text) => self.store.persist_placeholder(&job.identifier, &text).await,
        };

        match stored {
            Ok(artifact) => {
                job.transition(JobState::Done);
                info!(job_id = %job.id, identifier = %job.identifier, path = %artifact.path.display(), "acquisition finished");
                Ok(artifact)
            }
            Err(e) => {
                job.transition(JobState::Failed);
                Err(e.into())
            }
        }
    }

    /// Ask every backend whether its remote side is reachable.
    pub async fn health(&self) -> Vec<BackendHealth> {
        let mut report = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let entry = match backend.health().await {
                Ok(healthy) => BackendHealth {
                    backend: backend.kind(),
                    healthy,
                    error: None,
                },
                Err(e) => BackendHealth {
                    backend: backend.kind(),
                    healthy: false,
                    error: Some(e.to_string()),
                },
            };
            report.push(entry);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationFailure;
    use crate::store::{ArtifactKind, ArtifactPolicy};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Script {
        Fail(BackendFailure),
        Succeed(usize),
        Placeholder,
        WaitForCancel,
    }

    struct FakeBackend {
        kind: BackendKind,
        progress: Vec<f64>,
        script: Script,
        calls: AtomicUsize,
    }

    impl FakeBackend {
        fn new(kind: BackendKind, progress: Vec<f64>, script: Script) -> Arc<Self> {
            Arc::new(Self {
                kind,
                progress,
                script,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DownloadBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn attempt(&self, request: &AttemptRequest<'_>) -> Result<ArtifactPayload, BackendFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for p in &self.progress {
                request.progress.report(*p);
            }
            match &self.script {
                Script::Fail(failure) => Err(failure.clone()),
                Script::Succeed(len) => Ok(ArtifactPayload::Bytes(Bytes::from(vec![3u8; *len]))),
                Script::Placeholder => Ok(ArtifactPayload::Placeholder("Title: x\n".into())),
                Script::WaitForCancel => {
                    request.cancel.cancelled().await;
                    Err(BackendFailure::Cancelled { backend: self.kind })
                }
            }
        }
    }

    fn dyn_backends(list: Vec<Arc<FakeBackend>>) -> Vec<Arc<dyn DownloadBackend>> {
        list.into_iter().map(|b| b as Arc<dyn DownloadBackend>).collect()
    }

    fn recording() -> (ProgressFn, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        (Arc::new(move |p| sink_seen.lock().unwrap().push(p)), seen)
    }

    fn store(dir: &tempfile::TempDir) -> Arc<ArtifactStore> {
        Arc::new(ArtifactStore::new(dir.path().join("DownloadedVideos"), ArtifactPolicy::default()))
    }

    fn network(kind: BackendKind) -> Script {
        Script::Fail(BackendFailure::Network {
            backend: kind,
            message: "connection refused".into(),
        })
    }

    #[tokio::test]
    async fn test_falls_through_to_second_backend() {
        let dir = tempfile::tempdir().unwrap();
        let a = FakeBackend::new(BackendKind::CloudFunction, vec![0.1], network(BackendKind::CloudFunction));
        let b = FakeBackend::new(BackendKind::LocalAgent, vec![0.0, 0.3, 0.7], Script::Succeed(4096));
        let c = FakeBackend::new(BackendKind::MetadataApi, vec![], Script::Placeholder);
        let orchestrator = Orchestrator::new(dyn_backends(vec![a.clone(), b.clone(), c.clone()]), store(&dir));
        let (sink, seen) = recording();

        let artifact = orchestrator
            .acquire("https://youtu.be/abc123", sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(artifact.path, orchestrator.store().root().join("abc123.mp4"));
        assert_eq!(artifact.kind, ArtifactKind::Media);
        assert_eq!(*seen.lock().unwrap(), vec![0.1, 0.0, 0.3, 0.7]);
        assert_eq!(c.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_backends_fail_with_last_reason() {
        let dir = tempfile::tempdir().unwrap();
        let last = BackendFailure::unsupported(BackendKind::MetadataApi, "metadata fallback is disabled");
        let orchestrator = Orchestrator::new(
            dyn_backends(vec![
                FakeBackend::new(BackendKind::CloudFunction, vec![], network(BackendKind::CloudFunction)),
                FakeBackend::new(BackendKind::LocalAgent, vec![], network(BackendKind::LocalAgent)),
                FakeBackend::new(BackendKind::MetadataApi, vec![], Script::Fail(last.clone())),
            ]),
            store(&dir),
        );
        let (sink, _) = recording();

        let err = orchestrator
            .acquire("https://youtu.be/abc123", sink, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            AcquisitionError::AllBackendsFailed { last: reason } => assert_eq!(reason, last),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!orchestrator.store().root().join("abc123.mp4").exists());
    }

    #[tokio::test]
    async fn test_invalid_source_fails_before_any_backend() {
        let dir = tempfile::tempdir().unwrap();
        let a = FakeBackend::new(BackendKind::CloudFunction, vec![], Script::Succeed(4096));
        let orchestrator = Orchestrator::new(dyn_backends(vec![a.clone()]), store(&dir));

        for source in ["", "not a url", "https://example.com/watch"] {
            let (sink, _) = recording();
            let err = orchestrator.acquire(source, sink, &CancellationToken::new()).await.unwrap_err();
            assert!(matches!(err, AcquisitionError::InvalidSource(_)), "source: {source:?}");
        }
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_corrupt_artifact_is_surfaced_not_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let a = FakeBackend::new(BackendKind::CloudFunction, vec![], Script::Succeed(500));
        let b = FakeBackend::new(BackendKind::LocalAgent, vec![], Script::Succeed(4096));
        let orchestrator = Orchestrator::new(dyn_backends(vec![a, b.clone()]), store(&dir));
        let (sink, _) = recording();

        let err = orchestrator
            .acquire("https://youtu.be/abc123", sink, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            AcquisitionError::CorruptArtifact { path, reason } => {
                assert!(!path.exists());
                assert_eq!(reason, ValidationFailure::TooSmall { size: 500, min: 1024 });
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let a = FakeBackend::new(BackendKind::CloudFunction, vec![0.1], Script::WaitForCancel);
        let b = FakeBackend::new(BackendKind::LocalAgent, vec![], Script::Succeed(4096));
        let orchestrator = Orchestrator::new(dyn_backends(vec![a, b.clone()]), store(&dir));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let (sink, _) = recording();
        let err = orchestrator.acquire("https://youtu.be/abc123", sink, &cancel).await.unwrap_err();

        assert!(matches!(err, AcquisitionError::Cancelled));
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_placeholder_is_stored_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            dyn_backends(vec![FakeBackend::new(BackendKind::MetadataApi, vec![], Script::Placeholder)]),
            store(&dir),
        );
        let (sink, _) = recording();

        let artifact = orchestrator
            .acquire("https://www.youtube.com/embed/abc123", sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(artifact.kind, ArtifactKind::Placeholder);
        assert_eq!(artifact.path.extension().and_then(|e| e.to_str()), Some("txt"));
        assert!(!orchestrator.store().validate(&artifact.path));
    }

    #[tokio::test]
    async fn test_no_backends_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(Vec::new(), store(&dir));
        let (sink, _) = recording();
        let err = orchestrator
            .acquire("https://youtu.be/abc123", sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Internal(_)));
    }

    #[test]
    fn test_from_settings_skips_unconfigured_backends() {
        let mut settings = AcquisitionSettings::default();
        let orchestrator = Orchestrator::from_settings(&settings, Client::new());
        assert_eq!(orchestrator.backend_kinds(), vec![BackendKind::MetadataApi]);

        settings.proxy_base_url = Some("https://proxy.example".into());
        settings.agent_base_url = Some("http://127.0.0.1:5001".into());
        let orchestrator = Orchestrator::from_settings(&settings, Client::new());
        assert_eq!(
            orchestrator.backend_kinds(),
            vec![BackendKind::CloudFunction, BackendKind::LocalAgent, BackendKind::MetadataApi]
        );
    }

    #[tokio::test]
    async fn test_health_reports_each_backend() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            dyn_backends(vec![FakeBackend::new(BackendKind::CloudFunction, vec![], Script::Placeholder)]),
            store(&dir),
        );
        let report = orchestrator.health().await;
        assert_eq!(
            report,
            vec![BackendHealth {
                backend: BackendKind::CloudFunction,
                healthy: true,
                error: None
            }]
        );
    }
}
