//! Acquisition settings: loading, environment overrides and validation.
//!
//! Everything the download pipeline needs is injected through
//! [`AcquisitionSettings`]; nothing reads ambient global state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AcquisitionError;
use crate::store::ARTIFACT_EXTENSION;

/// Maximum URL length to prevent abuse
pub const MAX_URL_LENGTH: usize = 4096;

/// Directory under the app data dir that holds downloaded artifacts.
pub const ARTIFACT_DIR_NAME: &str = "DownloadedVideos";

pub const ENV_PROXY_URL: &str = "CSUTILITY_PROXY_URL";
pub const ENV_AGENT_URL: &str = "CSUTILITY_AGENT_URL";
pub const ENV_YOUTUBE_API_KEY: &str = "CSUTILITY_YOUTUBE_API_KEY";
pub const ENV_APP_DATA_DIR: &str = "CSUTILITY_APP_DATA_DIR";
pub const ENV_DOWNLOADS_ENABLED: &str = "CSUTILITY_DOWNLOADS_ENABLED";

/// What the metadata-API backend does once the real media backends have failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataFallback {
    /// Fail immediately without any network call.
    #[default]
    Disabled,
    /// Look the video up, then report that media acquisition is unsupported.
    Unsupported,
    /// Look the video up and store a text placeholder describing it.
    Placeholder,
}

/// Status polling limits for the local agent backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollSettings {
    /// Delay before re-polling a job that is still `starting`.
    pub starting_delay_ms: u64,
    /// Delay before re-polling a job that is `downloading`.
    pub downloading_delay_ms: u64,
    pub max_polls: u32,
    /// Overall budget for one agent attempt, polling included.
    pub timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            starting_delay_ms: 2000,
            downloading_delay_ms: 1000,
            max_polls: 900,
            timeout_secs: 1800,
        }
    }
}

impl PollSettings {
    pub fn starting_delay(&self) -> Duration {
        Duration::from_millis(self.starting_delay_ms)
    }

    pub fn downloading_delay(&self) -> Duration {
        Duration::from_millis(self.downloading_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Acquisition settings supplied by the host application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AcquisitionSettings {
    pub proxy_base_url: Option<String>,
    pub agent_base_url: Option<String>,
    pub metadata_api_base: String,
    pub metadata_api_key: Option<String>,
    pub metadata_fallback: MetadataFallback,
    pub format: String,          // yt-dlp format selector, e.g. "best[height<=720]"
    pub output_template: String, // yt-dlp output template used by the agent
    pub downloads_enabled: bool,
    pub show_thumbnails: bool,
    pub app_data_dir: PathBuf,
    pub min_artifact_bytes: u64,
    pub allowed_extensions: Vec<String>,
    pub poll: PollSettings,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_concurrent: usize,
    pub user_agent: String,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            proxy_base_url: None,
            agent_base_url: None,
            metadata_api_base: "https://www.googleapis.com/youtube/v3".to_string(),
            metadata_api_key: None,
            metadata_fallback: MetadataFallback::default(),
            format: "best[height<=720]".to_string(),
            output_template: "%(id)s.%(ext)s".to_string(),
            downloads_enabled: false,
            show_thumbnails: true,
            app_data_dir: PathBuf::from("."),
            min_artifact_bytes: 1024,
            allowed_extensions: vec!["mp4".to_string(), "mov".to_string(), "m4v".to_string()],
            poll: PollSettings::default(),
            request_timeout_secs: 300,
            connect_timeout_secs: 10,
            max_concurrent: 2,
            user_agent: concat!("csutility/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl AcquisitionSettings {
    /// Load settings from an optional JSON file, then apply environment overrides.
    /// A missing file is not an error; the defaults are used instead.
    pub fn load(path: Option<&Path>) -> Result<Self, AcquisitionError> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    AcquisitionError::InvalidSettings(format!("reading {}: {}", path.display(), e))
                })?;
                serde_json::from_str::<Self>(&raw).map_err(|e| {
                    AcquisitionError::InvalidSettings(format!("parsing {}: {}", path.display(), e))
                })?
            }
            _ => Self::default(),
        };

        settings.apply_overrides(|key| std::env::var(key).ok());
        validate_settings(&settings)?;
        Ok(settings)
    }

    /// Apply overrides from a key lookup. Blank values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = lookup(ENV_PROXY_URL) {
            self.proxy_base_url = Some(url);
        }
        if let Some(url) = lookup(ENV_AGENT_URL) {
            self.agent_base_url = Some(url);
        }
        if let Some(key) = lookup(ENV_YOUTUBE_API_KEY) {
            self.metadata_api_key = Some(key);
        }
        if let Some(dir) = lookup(ENV_APP_DATA_DIR) {
            self.app_data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup(ENV_DOWNLOADS_ENABLED) {
            self.downloads_enabled = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }

    /// Directory holding `{identifier}.mp4` artifacts.
    pub fn artifact_dir(&self) -> PathBuf {
        self.app_data_dir.join(ARTIFACT_DIR_NAME)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Restore the user-facing toggles to their first-launch values.
    pub fn reset_toggles(&mut self) {
        self.downloads_enabled = false;
        self.show_thumbnails = true;
    }
}

fn invalid(message: String) -> AcquisitionError {
    AcquisitionError::InvalidSettings(message)
}

fn validate_base_url(name: &str, url: &str) -> Result<(), AcquisitionError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(invalid(format!("{name} must start with http:// or https://: {url}")));
    }
    if url.len() > MAX_URL_LENGTH {
        return Err(invalid(format!("{name} is too long (max {MAX_URL_LENGTH} characters)")));
    }
    Ok(())
}

/// Validate settings fields
pub fn validate_settings(settings: &AcquisitionSettings) -> Result<(), AcquisitionError> {
    if let Some(url) = &settings.proxy_base_url {
        validate_base_url("proxyBaseUrl", url)?;
    }
    if let Some(url) = &settings.agent_base_url {
        validate_base_url("agentBaseUrl", url)?;
    }
    validate_base_url("metadataApiBase", &settings.metadata_api_base)?;

    if settings.format.trim().is_empty() {
        return Err(invalid("format cannot be empty".into()));
    }
    if settings.output_template.trim().is_empty() {
        return Err(invalid("outputTemplate cannot be empty".into()));
    }

    if settings.poll.max_polls == 0 {
        return Err(invalid("poll.maxPolls must be at least 1".into()));
    }
    if settings.poll.timeout_secs == 0 {
        return Err(invalid("poll.timeoutSecs must be at least 1".into()));
    }
    if settings.request_timeout_secs == 0 || settings.connect_timeout_secs == 0 {
        return Err(invalid("request and connect timeouts must be at least 1 second".into()));
    }
    if settings.max_concurrent == 0 {
        return Err(invalid("maxConcurrent must be at least 1".into()));
    }

    if settings.allowed_extensions.is_empty() {
        return Err(invalid("allowedExtensions cannot be empty".into()));
    }
    if let Some(bad) = settings.allowed_extensions.iter().find(|ext| ext.is_empty() || ext.contains(['.', '/', '\\'])) {
        return Err(invalid(format!("Invalid extension in allowedExtensions: '{bad}'")));
    }
    if !settings.allowed_extensions.iter().any(|ext| ext.eq_ignore_ascii_case(ARTIFACT_EXTENSION)) {
        return Err(invalid(format!(
            "allowedExtensions must include '{ARTIFACT_EXTENSION}', the extension downloads are stored with"
        )));
    }

    Ok(())
}

/// Validate a source URL before identifier extraction.
pub fn validate_source_url(url: &str) -> Result<(), AcquisitionError> {
    if url.trim().is_empty() {
        return Err(AcquisitionError::InvalidSource("URL cannot be empty".to_string()));
    }

    // Length check to prevent abuse
    if url.len() > MAX_URL_LENGTH {
        return Err(AcquisitionError::InvalidSource(format!(
            "URL is too long (max {} characters)",
            MAX_URL_LENGTH
        )));
    }

    Ok(())
}
