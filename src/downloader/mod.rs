//! Download orchestration and the queue pump.
//!
//! ## Module Structure
//! - `identifier` - Video identifier extraction and URL builders
//! - `backend` - Backend contract shared by every strategy
//! - `progress` - Progress normalization and per-attempt forwarding
//! - `proxy` - Cloud function backend
//! - `agent` - Local agent backend (polling)
//! - `metadata` - Metadata API backend
//! - `orchestrator` - Backend cascade and persistence
//! - `commands` - View-model wrapper consumed by the UI

pub mod commands;

mod agent;
mod backend;
mod identifier;
mod metadata;
mod orchestrator;
mod progress;
mod proxy;

pub use agent::{AgentStatus, AgentTransport, HttpAgentTransport, LocalAgentBackend, PollStep, RemoteJobHandle, interpret_status};
pub use backend::{ArtifactPayload, AttemptRequest, BackendKind, DownloadBackend, cancellable_sleep, until_cancelled};
pub use identifier::{Identifier, app_url, extract_identifier, thumbnail_url, watch_url};
pub use metadata::{MetadataApiBackend, VideoMetadata, parse_iso8601_duration, parse_video_metadata};
pub use orchestrator::{BackendHealth, DownloadJob, JobState, Orchestrator};
pub use progress::{ProgressFn, ProgressForwarder, noop_progress, normalize_agent_progress, normalize_fraction};
pub use proxy::{ProxyBackend, RemoteVideoInfo};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use reqwest::Client;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{AcquisitionSettings, validate_source_url};
use crate::download_queue::{DownloadQueue, DownloadStatus, QueueStatus, QueuedDownload};
use crate::error::AcquisitionError;
use crate::events::*;
use crate::logging::{ErrorCategory, log_error_simple, log_error_with_context, log_warning_with_context};

/// Shared HTTP client for every backend.
pub fn build_http_client(settings: &AcquisitionSettings) -> Result<Client, AcquisitionError> {
    Client::builder()
        .user_agent(settings.user_agent.as_str())
        .timeout(settings.request_timeout())
        .connect_timeout(settings.connect_timeout())
        .build()
        .map_err(|e| AcquisitionError::Internal(format!("failed to build HTTP client: {e}")))
}

/// Runs queued acquisitions with bounded concurrency and reports their
/// lifecycle through the event emitter.
pub struct DownloadManager {
    orchestrator: Arc<Orchestrator>,
    queue: Mutex<DownloadQueue>,
    cancel_tokens: Mutex<HashMap<Identifier, CancellationToken>>,
    emitter: EventEmitter,
    notify: Notify,
    pump_started: AtomicBool,
}

impl DownloadManager {
    pub fn new(orchestrator: Arc<Orchestrator>, max_concurrent: usize, emitter: EventEmitter) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            queue: Mutex::new(DownloadQueue::new(max_concurrent)),
            cancel_tokens: Mutex::new(HashMap::new()),
            emitter,
            notify: Notify::new(),
            pump_started: AtomicBool::new(false),
        })
    }

    pub fn from_settings(settings: &AcquisitionSettings, emitter: EventEmitter) -> Result<Arc<Self>, AcquisitionError> {
        let client = build_http_client(settings)?;
        let orchestrator = Arc::new(Orchestrator::from_settings(settings, client));
        Ok(Self::new(orchestrator, settings.max_concurrent, emitter))
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn with_queue<R>(&self, f: impl FnOnce(&mut DownloadQueue) -> R) -> R {
        let mut queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut queue)
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<Identifier, CancellationToken>> {
        self.cancel_tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: &str, payload: serde_json::Value) {
        (self.emitter)(event, payload);
    }

    /// Signal the queue pump to check for available work.
    pub fn notify_queue(&self) {
        self.notify.notify_one();
    }

    /// Queue `source_url` for acquisition. Returns the identifier that keys the job.
    pub fn enqueue(&self, source_url: &str) -> Result<Identifier, AcquisitionError> {
        validate_source_url(source_url)?;
        let identifier = extract_identifier(source_url)
            .ok_or_else(|| AcquisitionError::InvalidSource(format!("no video identifier in '{source_url}'")))?;

        self.with_queue(|queue| queue.enqueue(QueuedDownload::new(identifier.clone(), source_url)))?;
        self.emit(EVT_DOWNLOAD_QUEUED, json!({ "identifier": identifier }));
        self.notify_queue();
        Ok(identifier)
    }

    /// Start the queue pump. Must run inside a tokio runtime; only the first call has effect.
    pub fn start_pump(self: &Arc<Self>) -> Result<(), AcquisitionError> {
        if self.pump_started.swap(true, Ordering::SeqCst) {
            log_error_simple(ErrorCategory::System, "Queue pump initialization attempted more than once", None);
            return Err(AcquisitionError::Internal("Queue pump already initialized".into()));
        }

        // Supervisor task: spawn worker, watch for unexpected termination and attempt restarts
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            const MAX_RESTARTS: u32 = 5;
            const BASE_BACKOFF_MS: u64 = 1000;

            let mut restarts = 0u32;

            loop {
                let manager = Arc::clone(&supervisor);
                let worker = tokio::spawn(async move {
                    info!("Download queue pump running");
                    loop {
                        manager.notify.notified().await;
                        manager.pump_queue_once();
                    }
                });

                match worker.await {
                    Ok(()) => log_error_with_context(
                        ErrorCategory::System,
                        "Queue pump task exited unexpectedly (normal return)",
                        json!({ "restarts": restarts }),
                        None,
                    ),
                    Err(e) if e.is_cancelled() => return,
                    Err(e) => log_error_with_context(
                        ErrorCategory::System,
                        "Queue pump task terminated unexpectedly (panic/join error)",
                        json!({ "restarts": restarts }),
                        Some(&format!("{:?}", e)),
                    ),
                }

                if restarts >= MAX_RESTARTS {
                    log_error_with_context(
                        ErrorCategory::System,
                        "Queue pump exceeded maximum restart attempts and will not be restarted",
                        json!({ "restarts": restarts }),
                        None,
                    );
                    break;
                }

                let backoff = BASE_BACKOFF_MS.saturating_mul(1 << restarts.min(10));
                info!(backoff_ms = backoff, attempt = restarts + 1, "Restarting queue pump");
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                restarts += 1;
            }
        });

        // Work may have been queued before the pump existed.
        self.notify_queue();
        Ok(())
    }

    /// Start queued downloads until capacity is exhausted.
    fn pump_queue_once(self: &Arc<Self>) {
        loop {
            // The token is registered under the queue lock, so `cancel` always finds it.
            let started = self.with_queue(|queue| {
                let download = queue.next_to_start()?;
                let token = CancellationToken::new();
                self.tokens().insert(download.identifier.clone(), token.clone());
                Some((download, token))
            });
            let Some((download, token)) = started else {
                break;
            };
            self.emit(EVT_DOWNLOAD_STARTED, json!({ "identifier": download.identifier }));

            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.run_download(download, token).await });
        }
    }

    async fn run_download(self: Arc<Self>, download: QueuedDownload, cancel: CancellationToken) {
        let identifier = download.identifier.clone();

        let emitter = self.emitter.clone();
        let progress_id = identifier.clone();
        let on_progress: ProgressFn = Arc::new(move |progress| {
            emitter(EVT_DOWNLOAD_PROGRESS, json!({ "identifier": progress_id, "progress": progress }));
        });

        let result = self.orchestrator.acquire(&download.source_url, on_progress, &cancel).await;
        self.tokens().remove(&identifier);

        let finished = self.with_queue(|queue| match &result {
            Ok(_) => queue.complete(&identifier),
            Err(_) => queue.fail(&identifier),
        });
        let cancelled_in_queue = finished.is_none_or(|download| download.status == DownloadStatus::Cancelled);

        match result {
            Ok(artifact) if cancelled_in_queue => {
                info!(identifier = %identifier, path = %artifact.path.display(), "download finished after cancellation, keeping artifact");
                self.emit(EVT_DOWNLOAD_CANCELLED, json!({ "identifier": identifier }));
            }
            Ok(artifact) => {
                self.emit(EVT_DOWNLOAD_COMPLETE, json!(artifact));
            }
            Err(AcquisitionError::Cancelled) => {
                self.emit(EVT_DOWNLOAD_CANCELLED, json!({ "identifier": identifier }));
            }
            Err(err) => {
                let category = match &err {
                    AcquisitionError::AllBackendsFailed { .. } => ErrorCategory::Network,
                    AcquisitionError::CorruptArtifact { .. } => ErrorCategory::Download,
                    AcquisitionError::Store(_) => ErrorCategory::Storage,
                    AcquisitionError::InvalidSource(_) => ErrorCategory::Validation,
                    _ => ErrorCategory::Unknown,
                };
                log_error_with_context(
                    category,
                    "Acquisition failed",
                    json!({ "identifier": identifier, "source_url": download.source_url, "code": err.code().as_str() }),
                    Some(&err.to_string()),
                );
                self.emit(EVT_DOWNLOAD_ERROR, json!({ "identifier": identifier }));
                self.emit(
                    EVT_DOWNLOAD_ERROR_DETAIL,
                    json!({ "identifier": identifier, "error": err.to_frontend_error() }),
                );
            }
        }

        self.notify_queue();
    }

    /// Cancel a queued or running download.
    pub fn cancel(&self, identifier: &Identifier) -> Result<(), AcquisitionError> {
        let previous = self.with_queue(|queue| queue.cancel(identifier))?;
        match previous {
            DownloadStatus::Queued => self.emit(EVT_DOWNLOAD_CANCELLED, json!({ "identifier": identifier })),
            DownloadStatus::Cancelled => debug!(identifier = %identifier, "download already cancelling"),
            _ => match self.tokens().get(identifier) {
                // The running job emits its own cancellation event.
                Some(token) => token.cancel(),
                None => log_warning_with_context(
                    ErrorCategory::Download,
                    "Cancelled download had no cancellation token",
                    json!({ "identifier": identifier }),
                ),
            },
        }
        self.notify_queue();
        Ok(())
    }

    /// Cancel everything. Returns the identifiers that were queued or running.
    pub fn cancel_all(&self) -> Vec<Identifier> {
        let running: Vec<Identifier> = {
            let tokens = self.tokens();
            tokens.values().for_each(CancellationToken::cancel);
            tokens.keys().cloned().collect()
        };
        let cancelled = self.with_queue(|queue| queue.cancel_all());
        for identifier in cancelled.iter().filter(|id| !running.contains(id)) {
            self.emit(EVT_DOWNLOAD_CANCELLED, json!({ "identifier": identifier }));
        }
        cancelled
    }

    pub fn status(&self) -> QueueStatus {
        self.with_queue(|queue| queue.status())
    }

    pub async fn health(&self) -> Vec<BackendHealth> {
        self.orchestrator.health().await
    }
}
