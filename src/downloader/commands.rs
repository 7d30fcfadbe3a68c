//! View-model wrapper for the video player screen.
//!
//! Owns the player's download state and publishes it through a `watch`
//! channel, so the UI thread only ever reads snapshots.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AcquisitionSettings;
use crate::error::{AcquisitionError, FrontendError};
use crate::events::{EVT_ARTIFACT_EVICTED, EventEmitter};
use crate::playback::{LocalVideoRecord, LineupVideo, PlaybackTracker};
use crate::store::ArtifactKind;

use super::orchestrator::Orchestrator;
use super::progress::ProgressFn;

/// Snapshot of the player's download state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerDownloadState {
    pub is_downloading: bool,
    pub download_progress: f64,
    pub download_error: Option<FrontendError>,
    pub can_play_local_video: bool,
}

pub struct VideoDownloadModel {
    orchestrator: Arc<Orchestrator>,
    tracker: PlaybackTracker,
    downloads_enabled: bool,
    show_thumbnails: bool,
    emitter: EventEmitter,
    state: Arc<watch::Sender<PlayerDownloadState>>,
}

impl VideoDownloadModel {
    pub fn new(orchestrator: Arc<Orchestrator>, settings: &AcquisitionSettings, emitter: EventEmitter) -> Self {
        let tracker = PlaybackTracker::new(orchestrator.store().clone());
        let (state, _) = watch::channel(PlayerDownloadState::default());
        Self {
            orchestrator,
            tracker,
            downloads_enabled: settings.downloads_enabled,
            show_thumbnails: settings.show_thumbnails,
            emitter,
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerDownloadState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PlayerDownloadState {
        self.state.borrow().clone()
    }

    /// Thumbnail for the record's row, unless thumbnails are switched off.
    pub fn thumbnail_url(&self, record: &LineupVideo) -> Option<String> {
        if !self.show_thumbnails {
            return None;
        }
        record.thumbnail_url()
    }

    fn fail(&self, err: &AcquisitionError) {
        let error = err.to_frontend_error();
        self.state.send_modify(|s| {
            s.is_downloading = false;
            s.download_error = Some(error);
        });
    }

    /// Acquire the record's video and point the record at the stored file.
    pub async fn download(&self, record: &mut LineupVideo, cancel: &CancellationToken) -> Result<(), AcquisitionError> {
        if !self.downloads_enabled {
            let err = AcquisitionError::DownloadsDisabled;
            self.fail(&err);
            return Err(err);
        }

        self.state.send_modify(|s| {
            s.is_downloading = true;
            s.download_progress = 0.0;
            s.download_error = None;
        });

        let state = self.state.clone();
        let on_progress: ProgressFn = Arc::new(move |progress| {
            state.send_modify(|s| s.download_progress = progress);
        });

        match self.orchestrator.acquire(&record.youtube_url, on_progress, cancel).await {
            Ok(artifact) if artifact.kind == ArtifactKind::Media => {
                record.set_local_video_path(Some(artifact.path.to_string_lossy().into_owned()));
                self.state.send_modify(|s| s.is_downloading = false);
                self.check_local_status(record);
                Ok(())
            }
            Ok(artifact) => {
                info!(path = %artifact.path.display(), "stored placeholder, nothing to play");
                self.state.send_modify(|s| s.is_downloading = false);
                self.check_local_status(record);
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Delete the downloaded file and clear the record's path.
    pub async fn delete_download(&self, record: &mut LineupVideo) -> Result<(), AcquisitionError> {
        let Some(path) = record.local_video_path().filter(|p| !p.trim().is_empty()).map(str::to_string) else {
            return Ok(());
        };

        if let Err(e) = self.orchestrator.store().delete(Path::new(&path)).await {
            warn!(path = %path, error = %e, "failed to delete local video");
            let err = AcquisitionError::from(e);
            self.state.send_modify(|s| s.download_error = Some(err.to_frontend_error()));
            return Err(err);
        }

        record.set_local_video_path(None);
        self.check_local_status(record);
        Ok(())
    }

    /// Re-derive `can_play_local_video`, clearing stale paths on the record.
    pub fn check_local_status(&self, record: &mut LineupVideo) -> bool {
        let path = record.local_video_path().map(str::to_string);
        let (playable, evicted) = self.tracker.check(record);
        if evicted {
            (self.emitter)(EVT_ARTIFACT_EVICTED, json!({ "videoId": record.id, "path": path }));
        }
        self.state.send_modify(|s| s.can_play_local_video = playable);
        playable
    }
}
