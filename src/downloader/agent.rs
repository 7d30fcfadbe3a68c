//! Local agent backend: start a job on the companion yt-dlp server, poll it,
//! then fetch the finished file.
//!
//! ```text
//! POST /download            -> {success, download_id}
//! GET  /status/{id}         -> {success, status: {status, progress?, filename?, error?}}
//! GET  /download/{id}       -> raw bytes
//! ```
//!
//! Polling is bounded by `poll.maxPolls` and `poll.timeoutSecs`, and every
//! request and delay is cancellable.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PollSettings;
use crate::error::BackendFailure;

use super::backend::{
    ArtifactPayload, AttemptRequest, BackendKind, DownloadBackend, cancellable_sleep, error_message_from_body,
    until_cancelled,
};
use super::progress::normalize_agent_progress;
use super::proxy::health_check;

const KIND: BackendKind = BackendKind::LocalAgent;

/// Server-assigned token for a started job. Only valid until a terminal status is seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteJobHandle(String);

impl RemoteJobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteJobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    download_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    status: Option<AgentStatus>,
    #[serde(default)]
    error: Option<String>,
}

/// Job status as reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgentStatus {
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Self::default()
        }
    }

    pub fn downloading(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::new("downloading")
        }
    }
}

/// What the poll loop does after one status response.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStep {
    /// Report `progress` (if any) and poll again after `delay`.
    Wait { progress: Option<f64>, delay: Duration },
    /// The job is done; fetch the file.
    Fetch,
    Fail(BackendFailure),
}

/// Map one status response onto the next poll-loop step.
pub fn interpret_status(status: &AgentStatus, poll: &PollSettings) -> PollStep {
    match status.status.as_str() {
        "starting" => PollStep::Wait {
            progress: Some(0.0),
            delay: poll.starting_delay(),
        },
        "downloading" => PollStep::Wait {
            progress: status.progress.and_then(normalize_agent_progress),
            delay: poll.downloading_delay(),
        },
        // Reported between the end of transfer and `completed`.
        "finished" => PollStep::Wait {
            progress: None,
            delay: poll.downloading_delay(),
        },
        "completed" => PollStep::Fetch,
        "error" => PollStep::Fail(BackendFailure::rejected(
            KIND,
            status.error.clone().unwrap_or_else(|| "agent reported an error".into()),
        )),
        other => PollStep::Fail(BackendFailure::UnknownStatus {
            backend: KIND,
            status: other.to_string(),
        }),
    }
}

/// Wire protocol of the companion server.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn start(&self, source_url: &str) -> Result<RemoteJobHandle, BackendFailure>;

    async fn status(&self, handle: &RemoteJobHandle) -> Result<AgentStatus, BackendFailure>;

    /// Stream the finished file into `dest`. Returns the number of bytes written.
    async fn fetch(&self, handle: &RemoteJobHandle, dest: &Path, cancel: &CancellationToken) -> Result<u64, BackendFailure>;

    async fn health(&self) -> Result<bool, BackendFailure> {
        Ok(true)
    }
}

/// [`AgentTransport`] over HTTP.
pub struct HttpAgentTransport {
    client: Client,
    base_url: String,
    format: String,
    output_template: String,
}

impl HttpAgentTransport {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        format: impl Into<String>,
        output_template: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            format: format.into(),
            output_template: output_template.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn start(&self, source_url: &str) -> Result<RemoteJobHandle, BackendFailure> {
        let resp = self
            .client
            .post(self.endpoint("download"))
            .json(&json!({
                "url": source_url,
                "format": self.format,
                "output": self.output_template,
            }))
            .send()
            .await
            .map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;
        let parsed: StartResponse = serde_json::from_str(&body)
            .map_err(|e| BackendFailure::rejected(KIND, format!("unexpected start response ({status}): {e}")))?;

        match parsed {
            StartResponse {
                success: true,
                download_id: Some(id),
                ..
            } if !id.is_empty() => Ok(RemoteJobHandle::new(id)),
            StartResponse { error, .. } => Err(BackendFailure::rejected(
                KIND,
                error.unwrap_or_else(|| format!("agent refused the job ({status})")),
            )),
        }
    }

    async fn status(&self, handle: &RemoteJobHandle) -> Result<AgentStatus, BackendFailure> {
        let resp = self
            .client
            .get(self.endpoint(&format!("status/{}", handle)))
            .send()
            .await
            .map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;
        let parsed: StatusEnvelope = serde_json::from_str(&body)
            .map_err(|e| BackendFailure::rejected(KIND, format!("unexpected status response ({status}): {e}")))?;

        match parsed {
            StatusEnvelope {
                success: true,
                status: Some(job),
                ..
            } => Ok(job),
            StatusEnvelope { error, .. } => Err(BackendFailure::rejected(
                KIND,
                error.unwrap_or_else(|| format!("status request failed ({status})")),
            )),
        }
    }

    async fn fetch(&self, handle: &RemoteJobHandle, dest: &Path, cancel: &CancellationToken) -> Result<u64, BackendFailure> {
        let send = self.client.get(self.endpoint(&format!("download/{}", handle))).send();
        let resp = until_cancelled(KIND, cancel, send)
            .await?
            .map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = until_cancelled(KIND, cancel, resp.text()).await?.unwrap_or_default();
            let message = error_message_from_body(&body).unwrap_or_else(|| format!("HTTP {status}"));
            return Err(BackendFailure::rejected(KIND, message));
        }

        let io_err = |e: std::io::Error| BackendFailure::Io {
            backend: KIND,
            message: format!("{}: {}", dest.display(), e),
        };

        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = until_cancelled(KIND, cancel, stream.next()).await? {
            let chunk = chunk.map_err(|e| BackendFailure::from_reqwest(KIND, &e))?;
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;

        Ok(written)
    }

    async fn health(&self) -> Result<bool, BackendFailure> {
        health_check(&self.client, &self.endpoint("health"), KIND).await
    }
}

pub struct LocalAgentBackend<T: AgentTransport> {
    transport: T,
    poll: PollSettings,
}

impl<T: AgentTransport> LocalAgentBackend<T> {
    pub fn new(transport: T, poll: PollSettings) -> Self {
        Self { transport, poll }
    }

    async fn poll_until_done(&self, request: &AttemptRequest<'_>, handle: &RemoteJobHandle) -> Result<(), BackendFailure> {
        let deadline = Instant::now() + self.poll.timeout();

        for attempt in 1..=self.poll.max_polls {
            let status = until_cancelled(KIND, request.cancel, self.transport.status(handle)).await??;
            debug!(job = %handle, attempt, status = %status.status, progress = ?status.progress, "agent poll");

            match interpret_status(&status, &self.poll) {
                PollStep::Fetch => return Ok(()),
                PollStep::Fail(failure) => return Err(failure),
                PollStep::Wait { progress, delay } => {
                    if let Some(progress) = progress {
                        request.progress.report(progress);
                    }
                    if Instant::now() + delay > deadline {
                        return Err(BackendFailure::Timeout {
                            backend: KIND,
                            message: format!("job {} still '{}' after {:?}", handle, status.status, self.poll.timeout()),
                        });
                    }
                    cancellable_sleep(KIND, request.cancel, delay).await?;
                }
            }
        }

        Err(BackendFailure::PollLimitReached {
            backend: KIND,
            attempts: self.poll.max_polls,
        })
    }

    async fn fetch_to_staging(&self, request: &AttemptRequest<'_>, handle: &RemoteJobHandle) -> Result<PathBuf, BackendFailure> {
        let staging = request.store.staging_path(request.identifier).await.map_err(|e| BackendFailure::Io {
            backend: KIND,
            message: e.to_string(),
        })?;

        match self.transport.fetch(handle, &staging, request.cancel).await {
            Ok(bytes) => {
                info!(identifier = %request.identifier, job = %handle, bytes, "agent download fetched");
                Ok(staging)
            }
            Err(failure) => {
                request.store.discard_staging(&staging).await;
                Err(failure)
            }
        }
    }
}

#[async_trait]
impl<T: AgentTransport> DownloadBackend for LocalAgentBackend<T> {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn attempt(&self, request: &AttemptRequest<'_>) -> Result<ArtifactPayload, BackendFailure> {
        let handle = until_cancelled(KIND, request.cancel, self.transport.start(request.source_url)).await??;
        debug!(identifier = %request.identifier, job = %handle, "agent accepted job");
        request.progress.report(0.0);

        self.poll_until_done(request, &handle).await?;
        let staging = self.fetch_to_staging(request, &handle).await?;
        Ok(ArtifactPayload::TempFile(staging))
    }

    async fn health(&self) -> Result<bool, BackendFailure> {
        self.transport.health().await
    }
}
