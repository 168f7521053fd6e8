//! WP Engine hosting API (v1) client.
//!
//! Used by the `sites` command to show which installs the account holds and
//! which of them are selected through `WPE_INSTALLS`.

use crate::config::{Secret, WpeConfig};
use crate::utils::{BackupError, Result};
use serde::Deserialize;
use tracing::{debug, info};

pub const WPE_API_BASE: &str = "https://api.wpengineapi.com/v1";

#[derive(Debug, Clone, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub installs: Vec<Install>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Install {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub cname: Option<String>,
    #[serde(default)]
    pub php_version: Option<String>,
    #[serde(default)]
    pub is_multisite: bool,
}

#[derive(Debug, Deserialize)]
struct SitesPage {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<Site>,
}

pub struct WpeClient {
    http: reqwest::Client,
    user_id: String,
    password: Secret,
    base_url: String,
}

impl WpeClient {
    pub fn from_config(config: &WpeConfig) -> Result<Self> {
        let (Some(user_id), Some(password)) = (&config.user_id, &config.password) else {
            return Err(BackupError::Configuration(
                "WPE_USER_ID and WPE_PASSWORD are required for the hosting API".into(),
            ));
        };
        Ok(Self {
            http: reqwest::Client::new(),
            user_id: user_id.clone(),
            password: password.clone(),
            base_url: WPE_API_BASE.to_string(),
        })
    }

    /// Every site on the account, following pagination.
    pub async fn list_sites(&self) -> Result<Vec<Site>> {
        let mut sites = Vec::new();
        let mut url = Some(format!("{}/sites", self.base_url));

        while let Some(current) = url {
            debug!(url = %current, "Fetching sites page");
            let page: SitesPage = self.get_json(&current, "list sites").await?;
            sites.extend(page.results);
            url = page.next.filter(|next| !next.is_empty());
        }

        info!(count = sites.len(), "Fetched WP Engine sites");
        Ok(sites)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, operation: &'static str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.user_id, Some(self.password.expose()))
            .send()
            .await
            .map_err(|e| BackupError::remote_api(operation, e))?;
        decode(response, operation).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackupError::remote_api(
            operation,
            format!("{}: {}", status, body.trim()),
        ));
    }
    response
        .json()
        .await
        .map_err(|e| BackupError::remote_api(operation, e))
}

/// Whether `install` is named in `selected`, ignoring ASCII case.
pub fn is_selected(install: &Install, selected: &[String]) -> bool {
    selected.iter().any(|name| name.eq_ignore_ascii_case(&install.name))
}
