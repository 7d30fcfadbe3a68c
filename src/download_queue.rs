//! Download Queue Manager
//!
//! Limits the number of simultaneous acquisitions and queues additional
//! requests. One entry per identifier: a video that is already queued or
//! downloading cannot be enqueued again, so two jobs never write the same
//! artifact at once.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::downloader::Identifier;
use crate::error::AcquisitionError;

/// Download status for queue management
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

/// Download item in the queue
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedDownload {
    pub identifier: Identifier,
    pub source_url: String,
    pub status: DownloadStatus,
}

impl QueuedDownload {
    pub fn new(identifier: Identifier, source_url: impl Into<String>) -> Self {
        Self {
            identifier,
            source_url: source_url.into(),
            status: DownloadStatus::Queued,
        }
    }
}

pub struct DownloadQueue {
    max_concurrent: usize,
    queue: VecDeque<QueuedDownload>,
    active: HashMap<Identifier, QueuedDownload>,
}

impl DownloadQueue {
    /// Create a new download queue with max concurrency
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1), // At least 1
            queue: VecDeque::new(),
            active: HashMap::new(),
        }
    }

    /// Add a download to the queue
    pub fn enqueue(&mut self, download: QueuedDownload) -> Result<(), AcquisitionError> {
        if self.queue.iter().any(|d| d.identifier == download.identifier) {
            return Err(AcquisitionError::queue_duplicate(format!(
                "Download {} already queued",
                download.identifier
            )));
        }
        if self.active.contains_key(&download.identifier) {
            return Err(AcquisitionError::queue_duplicate(format!(
                "Download {} already active",
                download.identifier
            )));
        }

        self.queue.push_back(download);
        Ok(())
    }

    /// Get next download to start (if slots available)
    pub fn next_to_start(&mut self) -> Option<QueuedDownload> {
        if self.active.len() >= self.max_concurrent {
            return None;
        }
        let mut download = self.queue.pop_front()?;
        download.status = DownloadStatus::Downloading;
        self.active.insert(download.identifier.clone(), download.clone());
        Some(download)
    }

    /// Mark download as completed, freeing its slot.
    pub fn complete(&mut self, identifier: &Identifier) -> Option<QueuedDownload> {
        self.finish(identifier, DownloadStatus::Completed)
    }

    /// Mark download as failed, freeing its slot.
    pub fn fail(&mut self, identifier: &Identifier) -> Option<QueuedDownload> {
        self.finish(identifier, DownloadStatus::Failed)
    }

    /// A job cancelled while running keeps its `Cancelled` status.
    fn finish(&mut self, identifier: &Identifier, status: DownloadStatus) -> Option<QueuedDownload> {
        let mut download = self.active.remove(identifier)?;
        if download.status != DownloadStatus::Cancelled {
            download.status = status;
        }
        Some(download)
    }

    /// Cancel a specific download. Returns the status it had before cancellation.
    ///
    /// A queued job is dropped at once. A running job is marked `Cancelled` and
    /// keeps its slot until its worker reports back through `complete` or `fail`.
    pub fn cancel(&mut self, identifier: &Identifier) -> Result<DownloadStatus, AcquisitionError> {
        if let Some(pos) = self.queue.iter().position(|d| &d.identifier == identifier) {
            self.queue.remove(pos);
            return Ok(DownloadStatus::Queued);
        }

        if let Some(download) = self.active.get_mut(identifier) {
            let previous = download.status;
            download.status = DownloadStatus::Cancelled;
            return Ok(previous);
        }

        Err(AcquisitionError::queue_not_found(format!(
            "Download {} is neither queued nor active",
            identifier
        )))
    }

    /// Cancel all downloads. Queued jobs are dropped, running jobs are marked
    /// `Cancelled`. Returns every affected identifier.
    pub fn cancel_all(&mut self) -> Vec<Identifier> {
        let mut cancelled: Vec<Identifier> = self.queue.drain(..).map(|d| d.identifier).collect();
        for download in self.active.values_mut() {
            download.status = DownloadStatus::Cancelled;
            cancelled.push(download.identifier.clone());
        }
        cancelled
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, identifier: &Identifier) -> bool {
        self.active.contains_key(identifier)
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.is_active(identifier) || self.queue.iter().any(|d| &d.identifier == identifier)
    }

    pub fn set_max_concurrent(&mut self, max: usize) {
        self.max_concurrent = max.max(1);
    }

    /// Get queue status summary
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.queue.len(),
            active: self.active.len(),
            max_concurrent: self.max_concurrent,
        }
    }
}

/// Queue status for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
}
