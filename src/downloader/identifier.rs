//! Video identifier extraction from share, embed and watch URLs.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Host marker of the short-link domain (`youtu.be/{id}`).
const SHORT_LINK_HOST: &str = "youtu.be";

/// Path marker of embeddable player URLs (`/embed/{id}`).
const EMBED_SEGMENT: &str = "/embed/";

/// Query parameter carrying the identifier on watch pages.
const WATCH_QUERY_PARAM: &str = "v";

/// Short token naming one video on the source platform.
/// Used as the artifact cache key and file name stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    /// Wrap a raw token. Returns `None` for blank input.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the token can be used verbatim as a file name stem.
    pub fn is_filename_safe(&self) -> bool {
        !matches!(self.0.as_str(), "." | "..")
            && !self.0.chars().any(|c| matches!(c, '/' | '\\' | '\0' | ':') || c.is_control())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Last non-empty path segment, so `youtu.be/abc/` still yields `abc`.
fn last_path_segment(url: &Url) -> Option<Identifier> {
    url.path_segments()?.filter(|s| !s.is_empty()).last().and_then(Identifier::new)
}

/// Extract the canonical identifier from a source reference.
///
/// First match wins: short-link host, then `/embed/` path, then the `v`
/// query parameter. Total: malformed input yields `None`, never a panic.
pub fn extract_identifier(source_reference: &str) -> Option<Identifier> {
    let url = Url::parse(source_reference.trim()).ok()?;

    if url.host_str().is_some_and(|host| host.contains(SHORT_LINK_HOST)) {
        return last_path_segment(&url);
    }

    if url.path().contains(EMBED_SEGMENT) {
        return last_path_segment(&url);
    }

    url.query_pairs()
        .find(|(key, _)| key == WATCH_QUERY_PARAM)
        .and_then(|(_, value)| Identifier::new(value.into_owned()))
}

/// High-quality thumbnail for list rows.
pub fn thumbnail_url(identifier: &Identifier) -> String {
    format!("https://img.youtube.com/vi/{}/hqdefault.jpg", identifier)
}

/// Canonical watch page.
pub fn watch_url(identifier: &Identifier) -> String {
    format!("https://www.youtube.com/watch?v={}", identifier)
}

/// Deep link into the native app.
pub fn app_url(identifier: &Identifier) -> String {
    format!("youtube://{}", identifier)
}
