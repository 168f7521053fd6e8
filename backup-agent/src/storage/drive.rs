//! Google Drive v3 REST client.

use super::auth::{CachedToken, DriveAuth};
use super::{ObjectStore, RemoteFolder, UploadBody, UploadedArtifact};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
    /// Drive encodes int64 fields as strings.
    #[serde(default)]
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Drive client shared by every job. The access token is cached across calls.
pub struct DriveClient {
    http: reqwest::Client,
    auth: DriveAuth,
    token: Mutex<Option<CachedToken>>,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    pub fn new(auth: DriveAuth) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("wp-backup-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackupError::remote_api("connect", e))?;
        Ok(Self::with_http(http, auth))
    }

    pub fn with_http(http: reqwest::Client, auth: DriveAuth) -> Self {
        info!(strategy = auth.strategy(), "Google Drive client ready");
        Self {
            http,
            auth,
            token: Mutex::new(None),
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: DRIVE_UPLOAD_BASE.to_string(),
        }
    }

    /// Point the client at another endpoint (emulators, proxies).
    pub fn with_base_urls(mut self, api_base: impl Into<String>, upload_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.upload_base = upload_base.into();
        self
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn bearer(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.value().to_string());
        }

        debug!(strategy = self.auth.strategy(), "Fetching Drive access token");
        let token = self.auth.fetch_token(&self.http).await?;
        let value = token.value().to_string();
        *cached = Some(token);
        Ok(value)
    }
}

#[async_trait]
impl ObjectStore for DriveClient {
    async fn find_folders(&self, name: &str, parent: Option<&str>) -> Result<Vec<RemoteFolder>> {
        let token = self.bearer().await?;
        let query = folder_query(name, parent);
        let response = self
            .http
            .get(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id,name)"),
                ("spaces", "drive"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await
            .map_err(|e| BackupError::remote_api("query", e))?;

        let list: FileList = check(response, "query")
            .await?
            .json()
            .await
            .map_err(|e| BackupError::remote_api("query", e))?;

        Ok(list
            .files
            .into_iter()
            .map(|f| RemoteFolder { id: f.id, name: f.name })
            .collect())
    }

    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<RemoteFolder> {
        let token = self.bearer().await?;
        let mut metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
        });
        if let Some(parent) = parent {
            metadata["parents"] = serde_json::json!([parent]);
        }

        let response = self
            .http
            .post(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&[("supportsAllDrives", "true"), ("fields", "id,name")])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| BackupError::remote_api("create folder", e))?;

        let created: DriveFile = check(response, "create folder")
            .await?
            .json()
            .await
            .map_err(|e| BackupError::remote_api("create folder", e))?;

        Ok(RemoteFolder {
            id: created.id,
            name: created.name,
        })
    }

    async fn create_file(
        &self,
        parent: &str,
        name: &str,
        content_type: &str,
        body: UploadBody,
    ) -> Result<UploadedArtifact> {
        let token = self.bearer().await?;
        let len = body.len();
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent],
            "mimeType": content_type,
        });

        // Open a resumable session, then send the whole body in one PUT.
        let session = self
            .http
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(&token)
            .query(&[("uploadType", "resumable"), ("supportsAllDrives", "true")])
            .header("X-Upload-Content-Type", content_type)
            .header("X-Upload-Content-Length", len.to_string())
            .json(&metadata)
            .send()
            .await
            .map_err(|e| BackupError::remote_api("upload", e))?;
        let session = check(session, "upload").await?;
        let location = session
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BackupError::remote_api("upload", "no resumable session URL returned"))?;
        debug!(name, bytes = len, "Opened resumable upload session");

        let payload = match body {
            UploadBody::Buffer(bytes) => reqwest::Body::from(bytes),
            UploadBody::Stream { stream, .. } => reqwest::Body::wrap_stream(stream),
        };

        let response = self
            .http
            .put(location)
            .bearer_auth(&token)
            .query(&[("fields", "id,name,size")])
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, len)
            .body(payload)
            .send()
            .await
            .map_err(|e| BackupError::remote_api("upload", e))?;

        let file: DriveFile = check(response, "upload")
            .await?
            .json()
            .await
            .map_err(|e| BackupError::remote_api("upload", e))?;

        Ok(UploadedArtifact {
            size: file.size.and_then(|s| s.parse().ok()).unwrap_or(len),
            id: file.id,
            name: file.name,
        })
    }
}

/// Drive search query for a non-trashed folder called `name`.
pub fn folder_query(name: &str, parent: Option<&str>) -> String {
    let mut query = format!(
        "mimeType='{}' and name='{}' and trashed=false",
        FOLDER_MIME_TYPE,
        escape_query(name)
    );
    if let Some(parent) = parent {
        query.push_str(&format!(" and '{}' in parents", escape_query(parent)));
    }
    query
}

/// Escape a value for use inside a single-quoted query string.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

async fn check(response: Response, operation: &'static str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackupError::remote_api(operation, describe_failure(status, &body)))
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => format!("{}: {}", status, envelope.error.message),
        Err(_) if body.trim().is_empty() => status.to_string(),
        Err(_) => format!("{}: {}", status, body.trim()),
    }
}
