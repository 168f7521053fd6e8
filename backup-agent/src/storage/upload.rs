//! Artifact uploads into the backup destination.

use super::{
    content_type_for, display_name, resolve_or_create_folder, ByteStream, FolderLayout,
    ObjectStore, UploadBody, UploadedArtifact,
};
use crate::transfer::{ProgressCallback, ProgressStream};
use crate::utils::{BackupError, Result};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Uploads files and buffers, either straight into a folder or into the
/// site folder beneath the configured root.
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    root_folder: String,
    layout: FolderLayout,
    progress: Option<ProgressCallback>,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, root_folder: impl Into<String>, layout: FolderLayout) -> Self {
        Self {
            store,
            root_folder: root_folder.into(),
            layout,
            progress: None,
        }
    }

    /// Report file upload progress to `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn root_folder(&self) -> &str {
        &self.root_folder
    }

    /// Folder that holds artifacts for `site` under the configured layout.
    pub async fn site_folder(&self, site: &str) -> Result<String> {
        let folder_id = match self.layout {
            FolderLayout::Flat => self.root_folder.clone(),
            FolderLayout::PerSite => {
                if site.is_empty() {
                    return Err(BackupError::Configuration(
                        "site name is required for per-site folders".into(),
                    ));
                }
                resolve_or_create_folder(self.store.as_ref(), site, Some(&self.root_folder)).await?
            }
        };
        debug!(site, folder_id = %folder_id, "Resolved site folder");
        Ok(folder_id)
    }

    /// Stream a local file into `folder_id`.
    pub async fn upload_file(&self, folder_id: &str, path: &Path) -> Result<UploadedArtifact> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                BackupError::Configuration(format!("{} has no file name", path.display()))
            })?;

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| BackupError::resource(format!("unable to open {}", path.display()), e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| BackupError::resource(format!("unable to stat {}", path.display()), e))?
            .len();

        let reader = ReaderStream::new(file);
        let stream: ByteStream = match &self.progress {
            Some(callback) => Box::pin(ProgressStream::new(reader, len, callback.clone())),
            None => Box::pin(reader),
        };

        let content_type = content_type_for(&name);
        debug!(folder_id, path = %path.display(), content_type = %content_type, "Uploading file");

        let artifact = self
            .store
            .create_file(folder_id, &name, &content_type, UploadBody::Stream { stream, len })
            .await?;
        info!(name = %artifact.name, id = %artifact.id, bytes = artifact.size, "File uploaded");
        Ok(artifact)
    }

    /// Upload an in-memory buffer as `filename` into `folder_id`.
    pub async fn upload_buffer(
        &self,
        folder_id: &str,
        filename: &str,
        data: Bytes,
    ) -> Result<UploadedArtifact> {
        let name = display_name(filename).ok_or_else(|| {
            BackupError::Configuration(format!("{:?} is not a valid file name", filename))
        })?;
        let content_type = content_type_for(&name);
        debug!(folder_id, name = %name, content_type = %content_type, bytes = data.len(), "Uploading buffer");

        let artifact = self
            .store
            .create_file(folder_id, &name, &content_type, UploadBody::Buffer(data))
            .await?;
        info!(name = %artifact.name, id = %artifact.id, bytes = artifact.size, "Buffer uploaded");
        Ok(artifact)
    }

    pub async fn upload_file_in_site_folder(&self, site: &str, path: &Path) -> Result<UploadedArtifact> {
        let folder_id = self.site_folder(site).await?;
        self.upload_file(&folder_id, path).await
    }

    pub async fn upload_buffer_in_site_folder(
        &self,
        site: &str,
        filename: &str,
        data: Bytes,
    ) -> Result<UploadedArtifact> {
        let folder_id = self.site_folder(site).await?;
        self.upload_buffer(&folder_id, filename, data).await
    }
}
