//! Offline video acquisition core for csUtility.
//!
//! Fetches lineup videos through a cascade of remote backends (cloud
//! function, local yt-dlp agent, metadata API), stores them under
//! `DownloadedVideos/{identifier}.mp4`, and tells the UI whether a record's
//! file is playable.

pub mod config;
pub mod download_queue;
pub mod downloader;
pub mod error;
pub mod events;
pub mod logging;
pub mod playback;
pub mod store;

pub use config::{AcquisitionSettings, MetadataFallback, PollSettings};
pub use downloader::commands::{PlayerDownloadState, VideoDownloadModel};
pub use downloader::{DownloadManager, Identifier, Orchestrator, build_http_client, extract_identifier};
pub use error::{AcquisitionError, BackendFailure, ErrorCode, FrontendError, StoreError};
pub use playback::{LineupVideo, LocalVideoRecord, PlaybackTracker};
pub use store::{Artifact, ArtifactKind, ArtifactStore};
