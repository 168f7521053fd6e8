//! Google Drive credentials.
//!
//! Three ways to obtain a bearer token, checked in this order:
//! a static access token, a service-account key, and an OAuth client
//! secret paired with a saved refresh token.

use crate::config::{DriveConfig, Secret};
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Duration as TimeDelta, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_REDIRECT_URI: &str = "http://localhost";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

const SECRET_READ_ATTEMPTS: u32 = 5;
const SECRET_READ_DELAY: Duration = Duration::from_secs(2);

/// Tokens are refreshed this long before they actually expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Service-account assertions are valid for one hour.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// OAuth client registration from a Google client secret file.
#[derive(Clone, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

impl fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ClientSecretFile {
    installed: Option<OAuthClient>,
    web: Option<OAuthClient>,
}

impl OAuthClient {
    /// Parse a client secret document with an `installed` or `web` section.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let file: ClientSecretFile = serde_json::from_slice(raw).map_err(|e| {
            BackupError::Configuration(format!("unable to parse client secret file: {}", e))
        })?;
        file.installed.or(file.web).ok_or_else(|| {
            BackupError::Configuration(
                "client secret file has neither an `installed` nor a `web` section".into(),
            )
        })
    }

    /// Read and parse the client secret file, retrying while it is missing.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut attempt = 1;
        loop {
            match tokio::fs::read(path).await {
                Ok(raw) => return Self::parse(&raw),
                Err(e) if attempt < SECRET_READ_ATTEMPTS => {
                    warn!(
                        attempt,
                        path = %path.display(),
                        error = %e,
                        "Unable to read client secret file, retrying"
                    );
                    tokio::time::sleep(SECRET_READ_DELAY).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(BackupError::resource(
                        format!(
                            "unable to read client secret file {} after {} attempts",
                            path.display(),
                            attempt
                        ),
                        e,
                    ))
                }
            }
        }
    }

    pub fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_REDIRECT_URI)
    }

    /// URL the operator opens to grant offline Drive access.
    pub fn consent_url(&self) -> Result<String> {
        let url = reqwest::Url::parse_with_params(
            &self.auth_uri,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri()),
                ("response_type", "code"),
                ("scope", DRIVE_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", "state-token"),
            ],
        )
        .map_err(|e| BackupError::Configuration(format!("invalid auth_uri: {}", e)))?;
        Ok(url.into())
    }

    /// Trade an authorization code for a token pair.
    pub async fn exchange_code(&self, http: &reqwest::Client, code: &str) -> Result<StoredToken> {
        let response = request_token(
            http,
            &self.token_uri,
            &[
                ("grant_type", "authorization_code"),
                ("code", code.trim()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri()),
            ],
        )
        .await?;
        Ok(StoredToken::from_response(response, Utc::now()))
    }

    async fn refresh(&self, http: &reqwest::Client, refresh_token: &str) -> Result<TokenResponse> {
        request_token(
            http,
            &self.token_uri,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ],
        )
        .await
    }
}

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Token file contents. Field names match the token files written by
/// earlier releases so existing `auth/token.json` files keep working.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl fmt::Debug for StoredToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredToken")
            .field("token_type", &self.token_type)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl StoredToken {
    fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(default_token_type),
            refresh_token: response.refresh_token,
            expiry: response.expires_in.map(|secs| now + TimeDelta::seconds(secs)),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            BackupError::resource(format!("unable to read token file {}", path.display()), e)
        })?;
        serde_json::from_slice(&raw).map_err(|e| {
            BackupError::Configuration(format!(
                "unable to parse token file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Write the token file, creating its directory. Owner-only on unix.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                BackupError::resource(format!("unable to create {}", dir.display()), e)
            })?;
        }

        let json = serde_json::to_vec_pretty(self).map_err(|e| {
            BackupError::Configuration(format!("unable to encode token: {}", e))
        })?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        use std::io::Write;
        let mut file = options.open(path).map_err(|e| {
            BackupError::resource(format!("unable to open token file {}", path.display()), e)
        })?;
        // The creation mode does not apply to a file that already exists.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|e| {
                    BackupError::resource(
                        format!("unable to restrict token file {}", path.display()),
                        e,
                    )
                })?;
        }
        file.write_all(&json).map_err(|e| {
            BackupError::resource(format!("unable to write token file {}", path.display()), e)
        })?;

        info!(path = %path.display(), "Saved OAuth token");
        Ok(())
    }
}

/// Google service-account key file.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

impl ServiceAccountKey {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            BackupError::resource(
                format!("unable to read service account key {}", path.display()),
                e,
            )
        })?;
        serde_json::from_slice(&raw).map_err(|e| {
            BackupError::Configuration(format!(
                "unable to parse service account key {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// RS256-signed JWT asking for Drive scope.
    fn assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let claims = AssertionClaims {
            iss: self.client_email.clone(),
            scope: DRIVE_SCOPE.to_string(),
            aud: self.token_uri.clone(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes()).map_err(|e| {
            BackupError::Configuration(format!("invalid service account private key: {}", e))
        })?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| BackupError::remote_api("authenticate", e))
    }
}

/// An access token and the moment it stops being usable.
#[derive(Clone)]
pub struct CachedToken {
    value: Secret,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn new(value: String, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            value: Secret::new(value),
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        self.value.expose()
    }

    /// True until `EXPIRY_MARGIN_SECS` before expiry. Tokens without an expiry never go stale.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => now + TimeDelta::seconds(EXPIRY_MARGIN_SECS) < at,
            None => true,
        }
    }
}

/// How the Drive client authenticates.
#[derive(Debug, Clone)]
pub enum DriveAuth {
    AccessToken(Secret),
    ServiceAccount(ServiceAccountKey),
    OAuth {
        client: OAuthClient,
        refresh_token: Secret,
    },
}

impl DriveAuth {
    /// Pick the strategy the configuration provides.
    pub async fn from_config(config: &DriveConfig) -> Result<Self> {
        if let Some(token) = &config.access_token {
            return Ok(DriveAuth::AccessToken(token.clone()));
        }

        if let Some(path) = &config.service_account_key_file {
            return Ok(DriveAuth::ServiceAccount(ServiceAccountKey::load(path)?));
        }

        let secret_file = config.client_secret_file.as_ref().ok_or_else(|| {
            BackupError::Configuration(
                "no Google Drive credentials configured (set GOOGLE_DRIVE_ACCESS_TOKEN, \
                 GOOGLE_SERVICE_ACCOUNT_KEY_FILE or GOOGLE_CLIENT_SECRET_JSON_FILE)"
                    .into(),
            )
        })?;
        let client = OAuthClient::load(secret_file).await?;

        let stored = StoredToken::load(&config.token_file).map_err(|e| {
            BackupError::Configuration(format!(
                "{}; run `wp-backup-agent auth` to authorize Drive access",
                e
            ))
        })?;
        let refresh_token = stored.refresh_token.ok_or_else(|| {
            BackupError::Configuration(format!(
                "token file {} has no refresh token; run `wp-backup-agent auth`",
                config.token_file.display()
            ))
        })?;

        Ok(DriveAuth::OAuth {
            client,
            refresh_token: Secret::new(refresh_token),
        })
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            DriveAuth::AccessToken(_) => "access-token",
            DriveAuth::ServiceAccount(_) => "service-account",
            DriveAuth::OAuth { .. } => "oauth",
        }
    }

    /// Obtain a fresh access token.
    pub async fn fetch_token(&self, http: &reqwest::Client) -> Result<CachedToken> {
        let now = Utc::now();
        match self {
            DriveAuth::AccessToken(token) => {
                Ok(CachedToken::new(token.expose().to_string(), None))
            }
            DriveAuth::ServiceAccount(key) => {
                let assertion = key.assertion(now)?;
                let response = request_token(
                    http,
                    &key.token_uri,
                    &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
                )
                .await?;
                debug!(client_email = %key.client_email, "Obtained service account token");
                Ok(token_from_response(response, now))
            }
            DriveAuth::OAuth {
                client,
                refresh_token,
            } => {
                let response = client.refresh(http, refresh_token.expose()).await?;
                debug!(client_id = %client.client_id, "Refreshed OAuth access token");
                Ok(token_from_response(response, now))
            }
        }
    }
}

fn token_from_response(response: TokenResponse, now: DateTime<Utc>) -> CachedToken {
    let expires_at = response.expires_in.map(|secs| now + TimeDelta::seconds(secs));
    CachedToken::new(response.access_token, expires_at)
}

async fn request_token(
    http: &reqwest::Client,
    token_uri: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse> {
    let response = http
        .post(token_uri)
        .form(form)
        .send()
        .await
        .map_err(|e| BackupError::remote_api("authenticate", e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackupError::remote_api(
            "authenticate",
            format!("token endpoint returned {}: {}", status, body.trim()),
        ));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| BackupError::remote_api("authenticate", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveConfig;
    use crate::storage::FolderLayout;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const CLIENT_SECRET: &str = r#"{
        "installed": {
            "client_id": "123.apps.googleusercontent.com",
            "client_secret": "shh",
            "auth_uri": "https://accounts.google.com/o/oauth2/auth",
            "token_uri": "https://oauth2.googleapis.com/token",
            "redirect_uris": ["http://localhost"]
        }
    }"#;

    fn drive_config(dir: &Path) -> DriveConfig {
        DriveConfig {
            root_folder_id: Some("root".into()),
            layout: FolderLayout::PerSite,
            client_secret_file: None,
            token_file: dir.join("auth/token.json"),
            service_account_key_file: None,
            access_token: None,
        }
    }

    #[test]
    fn test_parse_installed_and_web_sections() {
        let client = OAuthClient::parse(CLIENT_SECRET.as_bytes()).unwrap();
        assert_eq!(client.client_id, "123.apps.googleusercontent.com");
        assert_eq!(client.redirect_uri(), "http://localhost");

        let web = OAuthClient::parse(br#"{"web": {"client_id": "w", "client_secret": "s"}}"#).unwrap();
        assert_eq!(web.client_id, "w");
        assert_eq!(web.token_uri, DEFAULT_TOKEN_URI);

        assert!(OAuthClient::parse(br#"{"other": {}}"#).is_err());
    }

    #[test]
    fn test_debug_hides_client_secret() {
        let client = OAuthClient::parse(CLIENT_SECRET.as_bytes()).unwrap();
        assert!(!format!("{:?}", client).contains("shh"));
    }

    #[test]
    fn test_consent_url_requests_offline_drive_access() {
        let client = OAuthClient::parse(CLIENT_SECRET.as_bytes()).unwrap();
        let url = reqwest::Url::parse(&client.consent_url().unwrap()).unwrap();
        let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();

        assert!(params.contains(&("access_type".into(), "offline".into())));
        assert!(params.contains(&("scope".into(), DRIVE_SCOPE.into())));
        assert!(params.contains(&("client_id".into(), "123.apps.googleusercontent.com".into())));
        assert!(params.contains(&("redirect_uri".into(), "http://localhost".into())));
    }

    #[test]
    fn test_token_file_round_trip_and_legacy_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth/token.json");
        let token = StoredToken {
            access_token: "ya29.a".into(),
            token_type: "Bearer".into(),
            refresh_token: Some("1//r".into()),
            expiry: None,
        };
        token.save(&path).unwrap();

        let loaded = StoredToken::load(&path).unwrap();
        assert_eq!(loaded.refresh_token.as_deref(), Some("1//r"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let legacy = r#"{"access_token":"ya29.b","token_type":"Bearer","refresh_token":"1//x","expiry":"2024-05-01T10:00:00.123456+02:00"}"#;
        std::fs::write(&path, legacy).unwrap();
        let loaded = StoredToken::load(&path).unwrap();
        assert_eq!(
            loaded.expiry.unwrap(),
            "2024-05-01T08:00:00.123456Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_save_tightens_existing_token_file() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let token = StoredToken {
            access_token: "ya29.a".into(),
            token_type: "Bearer".into(),
            refresh_token: None,
            expiry: None,
        };
        token.save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(StoredToken::load(&path).unwrap().access_token, "ya29.a");
    }

    #[test]
    fn test_cached_token_freshness() {
        let now = Utc::now();
        let token = CachedToken::new("t".into(), Some(now + TimeDelta::seconds(120)));
        assert!(token.is_fresh(now));
        assert!(!token.is_fresh(now + TimeDelta::seconds(61)));

        let static_token = CachedToken::new("t".into(), None);
        assert!(static_token.is_fresh(now + TimeDelta::days(365)));
    }

    #[tokio::test]
    async fn test_access_token_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let mut config = drive_config(dir.path());
        config.access_token = Some(Secret::new("static"));
        config.service_account_key_file = Some(PathBuf::from("/nonexistent.json"));

        let auth = DriveAuth::from_config(&config).await.unwrap();
        assert_eq!(auth.strategy(), "access-token");

        let token = auth.fetch_token(&reqwest::Client::new()).await.unwrap();
        assert_eq!(token.value(), "static");
    }

    #[tokio::test]
    async fn test_no_credentials_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let err = DriveAuth::from_config(&drive_config(dir.path())).await.unwrap_err();
        assert!(matches!(err, BackupError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_oauth_requires_saved_refresh_token() {
        let dir = TempDir::new().unwrap();
        let secret = dir.path().join("client_secret.json");
        std::fs::write(&secret, CLIENT_SECRET).unwrap();
        let mut config = drive_config(dir.path());
        config.client_secret_file = Some(secret);

        let err = DriveAuth::from_config(&config).await.unwrap_err();
        assert!(err.to_string().contains("wp-backup-agent auth"));

        StoredToken {
            access_token: "a".into(),
            token_type: "Bearer".into(),
            refresh_token: Some("r".into()),
            expiry: None,
        }
        .save(&config.token_file)
        .unwrap();
        let auth = DriveAuth::from_config(&config).await.unwrap();
        assert_eq!(auth.strategy(), "oauth");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_client_secret_is_retried_then_fails() {
        let dir = TempDir::new().unwrap();
        let started = tokio::time::Instant::now();

        let err = OAuthClient::load(&dir.path().join("missing.json")).await.unwrap_err();

        assert!(matches!(err, BackupError::Resource { .. }));
        assert_eq!(started.elapsed(), SECRET_READ_DELAY * (SECRET_READ_ATTEMPTS - 1));
    }
}
