use std::sync::{Arc, Mutex};

use httpmock::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use csutility_lib::downloader::ProgressFn;
use csutility_lib::{
    AcquisitionError, AcquisitionSettings, ArtifactKind, BackendFailure, LineupVideo, LocalVideoRecord,
    MetadataFallback, Orchestrator, PlaybackTracker, PollSettings, build_http_client,
};

fn settings(dir: &tempfile::TempDir) -> AcquisitionSettings {
    AcquisitionSettings {
        app_data_dir: dir.path().to_path_buf(),
        poll: PollSettings {
            starting_delay_ms: 10,
            downloading_delay_ms: 10,
            max_polls: 50,
            timeout_secs: 30,
        },
        request_timeout_secs: 10,
        connect_timeout_secs: 2,
        ..AcquisitionSettings::default()
    }
}

fn recording() -> (ProgressFn, Arc<Mutex<Vec<f64>>>) {
    let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    let sink: ProgressFn = Arc::new(move |p: f64| sink_seen.lock().unwrap().push(p));
    (sink, seen)
}

#[tokio::test]
async fn proxy_failure_falls_through_to_agent() {
    let proxy = MockServer::start_async().await;
    let proxy_mock = proxy
        .mock_async(|when, then| {
            when.method(POST).path("/downloadVideo");
            then.status(500)
                .header("content-type", "application/json")
                .json_body(json!({"success": false, "error": "yt-dlp exited with status 1"}));
        })
        .await;

    let agent = MockServer::start_async().await;
    agent
        .mock_async(|when, then| {
            when.method(POST).path("/download");
            then.status(200).json_body(json!({"success": true, "download_id": "job-9"}));
        })
        .await;
    agent
        .mock_async(|when, then| {
            when.method(GET).path("/status/job-9");
            then.status(200)
                .json_body(json!({"success": true, "status": {"status": "completed", "filename": "downloads/abc123.mp4"}}));
        })
        .await;
    agent
        .mock_async(|when, then| {
            when.method(GET).path("/download/job-9");
            then.status(200).header("content-type", "video/mp4").body(vec![7u8; 8192]);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&dir);
    settings.proxy_base_url = Some(proxy.base_url());
    settings.agent_base_url = Some(agent.base_url());

    let orchestrator = Orchestrator::from_settings(&settings, build_http_client(&settings).unwrap());
    let (sink, seen) = recording();

    let artifact = orchestrator
        .acquire("https://www.youtube.com/watch?v=abc123", sink, &CancellationToken::new())
        .await
        .unwrap();

    proxy_mock.assert_async().await;
    assert_eq!(artifact.kind, ArtifactKind::Media);
    assert_eq!(artifact.size_bytes, 8192);
    assert_eq!(artifact.path, settings.artifact_dir().join("abc123.mp4"));

    // Proxy reported before failing, then progress restarts with the agent job.
    assert_eq!(*seen.lock().unwrap(), vec![0.1, 0.0]);

    let tracker = PlaybackTracker::new(orchestrator.store().clone());
    let mut record = LineupVideo::new("Dust2 xbox smoke", "https://youtu.be/abc123");
    record.set_local_video_path(Some(artifact.path.to_string_lossy().into_owned()));
    assert!(tracker.is_playable(&record));

    std::fs::remove_file(&artifact.path).unwrap();
    assert!(!tracker.is_playable(&record));
    assert_eq!(tracker.check(&mut record), (false, false));
    assert_eq!(record.local_video_path(), None);
}

#[tokio::test]
async fn every_backend_failing_reports_the_metadata_reason() {
    let proxy = MockServer::start_async().await;
    proxy
        .mock_async(|when, then| {
            when.method(POST).path("/downloadVideo");
            then.status(502).body("bad gateway");
        })
        .await;

    let agent = MockServer::start_async().await;
    agent
        .mock_async(|when, then| {
            when.method(POST).path("/download");
            then.status(200).json_body(json!({"success": true, "download_id": "job-1"}));
        })
        .await;
    agent
        .mock_async(|when, then| {
            when.method(GET).path("/status/job-1");
            then.status(200)
                .json_body(json!({"success": true, "status": {"status": "error", "error": "Video unavailable"}}));
        })
        .await;

    let metadata = MockServer::start_async().await;
    metadata
        .mock_async(|when, then| {
            when.method(GET).path("/videos").query_param("id", "abc123");
            then.status(403).json_body(json!({"error": {"code": 403, "message": "quotaExceeded"}}));
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&dir);
    settings.proxy_base_url = Some(proxy.base_url());
    settings.agent_base_url = Some(agent.base_url());
    settings.metadata_api_base = metadata.base_url();
    settings.metadata_api_key = Some("test-key".into());
    settings.metadata_fallback = MetadataFallback::Placeholder;

    let orchestrator = Orchestrator::from_settings(&settings, build_http_client(&settings).unwrap());
    let (sink, _) = recording();

    let err = orchestrator
        .acquire("https://youtu.be/abc123", sink, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        AcquisitionError::AllBackendsFailed {
            last: BackendFailure::Rejected { backend, message },
        } => {
            assert_eq!(backend.as_str(), "metadata-api");
            assert_eq!(message, "metadata API quota exceeded");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(orchestrator.store().list().await.unwrap().is_empty());
    assert!(!settings.artifact_dir().join("abc123.mp4").exists());
}

#[tokio::test]
async fn placeholder_fallback_is_never_playable() {
    let metadata = MockServer::start_async().await;
    metadata
        .mock_async(|when, then| {
            when.method(GET).path("/videos");
            then.status(200).json_body(json!({
                "items": [{
                    "id": "abc123",
                    "snippet": {"title": "Nuke outside smoke", "description": "", "channelTitle": "csUtility", "publishedAt": "2025-01-01T00:00:00Z"},
                    "contentDetails": {"duration": "PT45S"}
                }]
            }));
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&dir);
    settings.metadata_api_base = metadata.base_url();
    settings.metadata_api_key = Some("test-key".into());
    settings.metadata_fallback = MetadataFallback::Placeholder;

    let orchestrator = Orchestrator::from_settings(&settings, build_http_client(&settings).unwrap());
    let (sink, _) = recording();
    let artifact = orchestrator
        .acquire("https://youtu.be/abc123", sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(artifact.kind, ArtifactKind::Placeholder);
    let text = std::fs::read_to_string(&artifact.path).unwrap();
    assert!(text.contains("Nuke outside smoke"));

    let tracker = PlaybackTracker::new(orchestrator.store().clone());
    let mut record = LineupVideo::new("Nuke outside smoke", "https://youtu.be/abc123");
    record.set_local_video_path(Some(artifact.path.to_string_lossy().into_owned()));
    assert!(!tracker.is_playable(&record));
}
