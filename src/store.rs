//! Local artifact store.
//!
//! Owns the `DownloadedVideos` directory: every write, rename and delete of
//! downloaded media goes through here. Artifacts are keyed by identifier and
//! named `{identifier}.mp4`; writes are last-write-wins, serialized per
//! identifier.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AcquisitionSettings;
use crate::downloader::Identifier;
use crate::error::{StoreError, ValidationFailure};

/// Extension of media artifacts written by the store.
pub const ARTIFACT_EXTENSION: &str = "mp4";

/// Extension of placeholder artifacts.
pub const PLACEHOLDER_EXTENSION: &str = "txt";

const STAGING_DIR_NAME: &str = ".staging";

/// Validity rules applied to stored media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPolicy {
    /// Files must be strictly larger than this.
    pub min_bytes: u64,
    /// Lowercase extensions without the dot.
    pub allowed_extensions: Vec<String>,
}

impl Default for ArtifactPolicy {
    fn default() -> Self {
        Self {
            min_bytes: 1024,
            allowed_extensions: vec!["mp4".into(), "mov".into(), "m4v".into()],
        }
    }
}

impl ArtifactPolicy {
    pub fn from_settings(settings: &AcquisitionSettings) -> Self {
        Self {
            min_bytes: settings.min_artifact_bytes,
            allowed_extensions: settings.allowed_extensions.iter().map(|e| e.to_lowercase()).collect(),
        }
    }
}

/// Kind of file a successful acquisition produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Media,
    Placeholder,
}

/// A persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub identifier: Identifier,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub kind: ArtifactKind,
}

/// Input accepted by [`ArtifactStore::persist`].
#[derive(Debug)]
pub enum ArtifactSource {
    Bytes(Bytes),
    /// A staging file previously handed out by [`ArtifactStore::staging_path`].
    TempFile(PathBuf),
}

/// Directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredArtifact {
    pub identifier: Identifier,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub valid: bool,
}

pub struct ArtifactStore {
    root: PathBuf,
    policy: ArtifactPolicy,
    write_locks: Mutex<HashMap<Identifier, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, policy: ArtifactPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &AcquisitionSettings) -> Self {
        Self::new(settings.artifact_dir(), ArtifactPolicy::from_settings(settings))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &ArtifactPolicy {
        &self.policy
    }

    fn checked(&self, identifier: &Identifier) -> Result<(), StoreError> {
        if identifier.is_filename_safe() {
            Ok(())
        } else {
            Err(StoreError::InvalidIdentifier(identifier.to_string()))
        }
    }

    /// Final location of the media artifact for `identifier`.
    pub fn artifact_path(&self, identifier: &Identifier) -> Result<PathBuf, StoreError> {
        self.checked(identifier)?;
        Ok(self.root.join(format!("{}.{}", identifier, ARTIFACT_EXTENSION)))
    }

    fn placeholder_path(&self, identifier: &Identifier) -> Result<PathBuf, StoreError> {
        self.checked(identifier)?;
        Ok(self.root.join(format!("{}.{}", identifier, PLACEHOLDER_EXTENSION)))
    }

    /// Whether `path` names an artifact file directly inside the root:
    /// `{identifier}.{ext}` with a media or placeholder extension.
    ///
    /// The check is lexical. `..` never resolves, so `{root}/../x` is rejected.
    fn owns(&self, path: &Path) -> bool {
        let Ok(rest) = path.strip_prefix(&self.root) else {
            return false;
        };
        let mut components = rest.components();
        let (Some(Component::Normal(name)), None) = (components.next(), components.next()) else {
            return false;
        };

        let name = Path::new(name);
        let stem_ok = name
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|stem| Identifier::new(stem).filter(|id| id.as_str() == stem))
            .is_some_and(|id| id.is_filename_safe());
        let extension_ok = name.extension().and_then(|e| e.to_str()).is_some_and(|ext| {
            ext.eq_ignore_ascii_case(PLACEHOLDER_EXTENSION)
                || self.policy.allowed_extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext))
        });
        stem_ok && extension_ok
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR_NAME)
    }

    /// Fresh scratch file for a backend that streams media to disk.
    /// The directory is created; the file itself is not.
    pub async fn staging_path(&self, identifier: &Identifier) -> Result<PathBuf, StoreError> {
        self.checked(identifier)?;
        let dir = self.staging_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(format!("creating {}", dir.display()), e))?;
        Ok(dir.join(format!("{}.{}.part", identifier, uuid::Uuid::new_v4())))
    }

    /// Remove a staging file after a failed attempt. Missing files are fine.
    pub async fn discard_staging(&self, path: &Path) {
        let in_staging = path
            .strip_prefix(self.staging_dir())
            .is_ok_and(|rest| matches!(rest.components().collect::<Vec<_>>().as_slice(), [Component::Normal(_)]));
        if !in_staging {
            warn!(path = %path.display(), "refusing to discard file outside the staging area");
            return;
        }
        if let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to discard staging file");
        }
    }

    /// Create the artifact directory if absent. Idempotent.
    pub async fn ensure_dir(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(format!("creating {}", self.root.display()), e))
    }

    fn write_lock(&self, identifier: &Identifier) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(identifier.clone()).or_default().clone()
    }

    /// Persist media for `identifier`, replacing any previous artifact.
    ///
    /// The written file is validated; on failure it is deleted and
    /// `StoreError::CorruptArtifact` is returned.
    pub async fn persist(&self, identifier: &Identifier, source: ArtifactSource) -> Result<Artifact, StoreError> {
        let target = self.artifact_path(identifier)?;
        let lock = self.write_lock(identifier);
        let _guard = lock.lock().await;

        self.ensure_dir().await?;

        let staged = match source {
            ArtifactSource::Bytes(bytes) => {
                let staged = self.staging_path(identifier).await?;
                if let Err(e) = tokio::fs::write(&staged, &bytes).await {
                    self.discard_staging(&staged).await;
                    return Err(StoreError::io(format!("writing {}", staged.display()), e));
                }
                staged
            }
            ArtifactSource::TempFile(path) => path,
        };

        if let Err(e) = replace_file(&staged, &target).await {
            self.discard_staging(&staged).await;
            return Err(e);
        }

        match self.inspect(&target) {
            Ok(size_bytes) => {
                info!(identifier = %identifier, path = %target.display(), size_bytes, "artifact stored");
                Ok(Artifact {
                    identifier: identifier.clone(),
                    path: target,
                    size_bytes,
                    kind: ArtifactKind::Media,
                })
            }
            Err(reason) => {
                warn!(identifier = %identifier, path = %target.display(), %reason, "evicting corrupt artifact");
                if let Err(e) = tokio::fs::remove_file(&target).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    return Err(StoreError::io(format!("removing corrupt {}", target.display()), e));
                }
                Err(StoreError::CorruptArtifact { path: target, reason })
            }
        }
    }

    /// Write a text placeholder next to the media artifacts. Never counts as playable.
    pub async fn persist_placeholder(&self, identifier: &Identifier, text: &str) -> Result<Artifact, StoreError> {
        let target = self.placeholder_path(identifier)?;
        let lock = self.write_lock(identifier);
        let _guard = lock.lock().await;

        self.ensure_dir().await?;
        tokio::fs::write(&target, text.as_bytes())
            .await
            .map_err(|e| StoreError::io(format!("writing {}", target.display()), e))?;

        Ok(Artifact {
            identifier: identifier.clone(),
            path: target,
            size_bytes: text.len() as u64,
            kind: ArtifactKind::Placeholder,
        })
    }

    /// Check existence, size and extension of a media file.
    pub fn inspect(&self, path: &Path) -> Result<u64, ValidationFailure> {
        let extension = path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).unwrap_or_default();
        if !self.policy.allowed_extensions.iter().any(|allowed| *allowed == extension) {
            return Err(ValidationFailure::DisallowedExtension { extension });
        }

        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(_) => return Err(ValidationFailure::Missing),
        };
        if !meta.is_file() {
            return Err(ValidationFailure::NotAFile);
        }
        if meta.len() <= self.policy.min_bytes {
            return Err(ValidationFailure::TooSmall {
                size: meta.len(),
                min: self.policy.min_bytes,
            });
        }
        Ok(meta.len())
    }

    /// Whether `path` is a playable artifact right now.
    pub fn validate(&self, path: &Path) -> bool {
        self.inspect(path).is_ok()
    }

    /// Synchronously remove an artifact found invalid at read time.
    /// Only artifact files directly inside the store root are touched. Returns whether a file was removed.
    pub fn evict(&self, path: &Path) -> bool {
        if !self.owns(path) {
            warn!(path = %path.display(), "not evicting file that is not a stored artifact");
            return false;
        }
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "evicted invalid artifact");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to evict invalid artifact");
                false
            }
        }
    }

    /// Delete an artifact on user request. Deleting a missing file succeeds.
    pub async fn delete(&self, path: &Path) -> Result<(), StoreError> {
        if !self.owns(path) {
            return Err(StoreError::OutsideStore(path.to_path_buf()));
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "deleted artifact");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "artifact already gone");
                Ok(())
            }
            Err(e) => Err(StoreError::io(format!("deleting {}", path.display()), e)),
        }
    }

    /// Every media file in the artifact directory, with its current validity.
    pub async fn list(&self) -> Result<Vec<StoredArtifact>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(format!("listing {}", self.root.display()), e)),
        };

        let mut artifacts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(format!("listing {}", self.root.display()), e))?
        {
            let path = entry.path();
            let is_media = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| self.policy.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(e)));
            if !is_media {
                continue;
            }
            let Some(identifier) = path.file_stem().and_then(|s| s.to_str()).and_then(Identifier::new) else {
                continue;
            };
            let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            artifacts.push(StoredArtifact {
                identifier,
                valid: self.validate(&path),
                path,
                size_bytes,
            });
        }

        artifacts.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(artifacts)
    }

    /// Total size of valid artifacts.
    pub async fn total_bytes(&self) -> Result<u64, StoreError> {
        Ok(self.list().await?.iter().filter(|a| a.valid).map(|a| a.size_bytes).sum())
    }

    /// Delete invalid media files and leftover staging files. Returns how many files were removed.
    pub async fn purge_invalid(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for artifact in self.list().await?.into_iter().filter(|a| !a.valid) {
            if self.evict(&artifact.path) {
                removed += 1;
            }
        }

        let staging = self.staging_dir();
        if let Ok(mut entries) = tokio::fs::read_dir(&staging).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    /// Delete every media artifact. Returns how many were removed.
    pub async fn delete_all(&self) -> Result<usize, StoreError> {
        let artifacts = self.list().await?;
        for artifact in &artifacts {
            self.delete(&artifact.path).await?;
        }
        Ok(artifacts.len())
    }
}

/// Move `from` over `to`, falling back to copy + remove across filesystems.
async fn replace_file(from: &Path, to: &Path) -> Result<(), StoreError> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(from = %from.display(), to = %to.display(), error = %rename_err, "rename failed, copying");
            // Windows refuses to rename over an existing file.
            let _ = tokio::fs::remove_file(to).await;
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| StoreError::io(format!("copying {} to {}", from.display(), to.display()), e))?;
            let _ = tokio::fs::remove_file(from).await;
            Ok(())
        }
    }
}
