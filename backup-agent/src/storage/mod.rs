//! Cloud storage destination: folder resolution and artifact upload.
//!
//! [`ObjectStore`] is the narrow surface the pipeline needs from the remote
//! store. [`DriveClient`] implements it against Google Drive.

pub mod auth;
pub mod drive;
pub mod folder;
pub mod upload;

#[cfg(test)]
pub(crate) mod memory;

use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;

pub use auth::DriveAuth;
pub use drive::DriveClient;
pub use folder::resolve_or_create_folder;
pub use upload::Uploader;

/// Content type used when the extension tells us nothing.
pub const FALLBACK_CONTENT_TYPE: &str = "text/plain";

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync>>;

/// Content of a new object.
pub enum UploadBody {
    Buffer(Bytes),
    Stream { stream: ByteStream, len: u64 },
}

impl UploadBody {
    pub fn len(&self) -> u64 {
        match self {
            UploadBody::Buffer(bytes) => bytes.len() as u64,
            UploadBody::Stream { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub id: String,
    pub name: String,
}

/// An object the store acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedArtifact {
    pub id: String,
    pub name: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Folders named exactly `name`, optionally restricted to children of `parent`.
    async fn find_folders(&self, name: &str, parent: Option<&str>) -> Result<Vec<RemoteFolder>>;

    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<RemoteFolder>;

    async fn create_file(
        &self,
        parent: &str,
        name: &str,
        content_type: &str,
        body: UploadBody,
    ) -> Result<UploadedArtifact>;
}

/// Where artifacts land beneath the root folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderLayout {
    /// `<root>/<site>/<artifact>`
    PerSite,
    /// `<root>/<artifact>`
    Flat,
}

impl FromStr for FolderLayout {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "per-site" | "per_site" | "site" => Ok(FolderLayout::PerSite),
            "flat" => Ok(FolderLayout::Flat),
            other => Err(BackupError::Configuration(format!(
                "unknown folder layout {:?} (expected per-site or flat)",
                other
            ))),
        }
    }
}

/// Infer a content type from the file extension.
pub fn content_type_for(name: &str) -> String {
    let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str()) else {
        return FALLBACK_CONTENT_TYPE.to_string();
    };

    match ext.to_ascii_lowercase().as_str() {
        "sql" => "application/sql".to_string(),
        "zip" => "application/zip".to_string(),
        "gz" => "application/gzip".to_string(),
        other => mime_guess::from_ext(other)
            .first_raw()
            .unwrap_or(FALLBACK_CONTENT_TYPE)
            .to_string(),
    }
}

/// Final path component of `name`, the way it is shown in the store.
pub fn display_name(name: &str) -> Option<String> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}
