//! Playback status: is a record's downloaded file playable right now?

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::downloader::{Identifier, extract_identifier, thumbnail_url};
use crate::store::ArtifactStore;

/// A persisted record that can point at a downloaded file.
///
/// The acquisition core only ever reads and writes this one field; the rest
/// of the record belongs to the host's persistence layer.
pub trait LocalVideoRecord {
    fn local_video_path(&self) -> Option<&str>;
    fn set_local_video_path(&mut self, path: Option<String>);
}

/// Lineup video as stored by the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineupVideo {
    pub id: Uuid,
    pub title: String,
    #[serde(rename = "youtubeURL")]
    pub youtube_url: String,
    pub map_name: String,
    #[serde(rename = "utilityTypeRawValue")]
    pub utility_type: String,
    #[serde(default)]
    pub category: Option<String>,
    /// RFC 3339 timestamp.
    pub uploaded_date: String,
    #[serde(default, rename = "uploaderID")]
    pub uploader_id: Option<String>,
    #[serde(default)]
    pub local_video_path: Option<String>,
}

impl LineupVideo {
    pub fn new(title: impl Into<String>, youtube_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            youtube_url: youtube_url.into(),
            map_name: String::new(),
            utility_type: "Smoke".to_string(),
            category: None,
            uploaded_date: String::new(),
            uploader_id: None,
            local_video_path: None,
        }
    }

    pub fn identifier(&self) -> Option<Identifier> {
        extract_identifier(&self.youtube_url)
    }

    pub fn thumbnail_url(&self) -> Option<String> {
        self.identifier().map(|id| thumbnail_url(&id))
    }
}

impl LocalVideoRecord for LineupVideo {
    fn local_video_path(&self) -> Option<&str> {
        self.local_video_path.as_deref()
    }

    fn set_local_video_path(&mut self, path: Option<String>) {
        self.local_video_path = path;
    }
}

/// Derives playability from the artifact store on every call. Nothing is cached.
#[derive(Clone)]
pub struct PlaybackTracker {
    store: Arc<ArtifactStore>,
}

impl PlaybackTracker {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self { store }
    }

    /// True iff the record has a non-empty path and the file validates.
    pub fn is_playable(&self, record: &impl LocalVideoRecord) -> bool {
        match record.local_video_path() {
            Some(path) if !path.trim().is_empty() => self.store.validate(Path::new(path)),
            _ => false,
        }
    }

    /// Like [`is_playable`](Self::is_playable), but repairs the record when the
    /// file has gone missing or shrunk: the path is cleared and an undersized
    /// file inside the artifact directory is evicted.
    ///
    /// Returns `(playable, evicted)`.
    pub fn check(&self, record: &mut impl LocalVideoRecord) -> (bool, bool) {
        let Some(path) = record.local_video_path().map(str::to_string) else {
            return (false, false);
        };
        if path.trim().is_empty() {
            record.set_local_video_path(None);
            return (false, false);
        }

        if self.store.validate(Path::new(&path)) {
            return (true, false);
        }

        debug!(path = %path, "recorded artifact no longer valid, clearing path");
        let evicted = self.store.evict(Path::new(&path));
        record.set_local_video_path(None);
        (false, evicted)
    }
}
