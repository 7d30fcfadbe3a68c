//! Centralized event names emitted toward the UI layer.
//! Keep these in sync with the app's event listeners.

use std::sync::Arc;

use serde_json::Value;

pub const EVT_DOWNLOAD_QUEUED: &str = "download-queued";
pub const EVT_DOWNLOAD_STARTED: &str = "download-started";
pub const EVT_DOWNLOAD_PROGRESS: &str = "download-progress";
pub const EVT_DOWNLOAD_COMPLETE: &str = "download-complete";
pub const EVT_DOWNLOAD_ERROR: &str = "download-error";
pub const EVT_DOWNLOAD_ERROR_DETAIL: &str = "download-error-detail";
pub const EVT_DOWNLOAD_CANCELLED: &str = "download-cancelled";
pub const EVT_ARTIFACT_EVICTED: &str = "artifact-evicted";

/// Sink for `(event name, JSON payload)` pairs. The host marshals these onto its UI thread.
pub type EventEmitter = Arc<dyn Fn(&str, Value) + Send + Sync + 'static>;

/// Emitter that drops everything, for headless use.
pub fn discard_events() -> EventEmitter {
    Arc::new(|_event: &str, _payload: Value| {})
}
