//! In-memory [`ObjectStore`] used by tests.

use super::{ObjectStore, RemoteFolder, UploadBody, UploadedArtifact};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct StoredFolder {
    pub id: String,
    pub name: String,
    pub parent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: String,
    pub parent: String,
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct MemoryStore {
    folders: Mutex<Vec<StoredFolder>>,
    files: Mutex<Vec<StoredFile>>,
    next_id: AtomicUsize,
    folder_creates: AtomicUsize,
    fail_queries: AtomicBool,
    fail_uploads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Seed a folder without counting it as a create.
    pub fn insert_folder(&self, name: &str, parent: Option<&str>) -> String {
        let id = self.next_id("folder");
        self.folders.lock().unwrap().push(StoredFolder {
            id: id.clone(),
            name: name.to_string(),
            parent: parent.map(String::from),
        });
        id
    }

    pub fn fail_queries(&self) {
        self.fail_queries.store(true, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self) {
        self.fail_uploads.store(true, Ordering::SeqCst);
    }

    pub fn folder_creates(&self) -> usize {
        self.folder_creates.load(Ordering::SeqCst)
    }

    pub fn folders(&self) -> Vec<StoredFolder> {
        self.folders.lock().unwrap().clone()
    }

    pub fn files(&self) -> Vec<StoredFile> {
        self.files.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn find_folders(&self, name: &str, parent: Option<&str>) -> Result<Vec<RemoteFolder>> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(BackupError::remote_api("query folder", "HTTP 500: backend error"));
        }
        Ok(self
            .folders
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.name == name)
            .filter(|f| parent.is_none() || f.parent.as_deref() == parent)
            .map(|f| RemoteFolder {
                id: f.id.clone(),
                name: f.name.clone(),
            })
            .collect())
    }

    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<RemoteFolder> {
        self.folder_creates.fetch_add(1, Ordering::SeqCst);
        let id = self.insert_folder(name, parent);
        Ok(RemoteFolder {
            id,
            name: name.to_string(),
        })
    }

    async fn create_file(
        &self,
        parent: &str,
        name: &str,
        content_type: &str,
        body: UploadBody,
    ) -> Result<UploadedArtifact> {
        let data = match body {
            UploadBody::Buffer(bytes) => bytes.to_vec(),
            UploadBody::Stream { mut stream, .. } => {
                let mut data = Vec::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| BackupError::remote_api("upload file", e))?;
                    data.extend_from_slice(&chunk);
                }
                data
            }
        };
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(BackupError::remote_api("upload file", "HTTP 403: quota exceeded"));
        }

        let id = self.next_id("file");
        let size = data.len() as u64;
        self.files.lock().unwrap().push(StoredFile {
            id: id.clone(),
            parent: parent.to_string(),
            name: name.to_string(),
            content_type: content_type.to_string(),
            data,
        });
        Ok(UploadedArtifact {
            id,
            name: name.to_string(),
            size,
        })
    }
}
