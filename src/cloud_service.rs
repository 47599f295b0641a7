//! Cloud document-extraction service.
//!
//! The cloud stage drives one job per PDF through the [`ExtractionService`]
//! trait: upload the bytes as an asset, submit an extract job, poll its
//! location until it is done, then download the result archive (a zip with
//! `structuredData.json`, table CSVs and figure renditions).
//!
//! [`AdobeExtractService`] implements the trait against the Adobe PDF
//! Services REST API.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, ServiceError};
use crate::http::{build_client, send_with_retry, HttpFailure, RetryPolicy};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://pdf-services.adobe.io";

// ── Job model ────────────────────────────────────────────────────────────

/// An uploaded input document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHandle {
    pub asset_id: String,
}

/// Where a submitted job reports its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLocation(pub String);

/// The downloadable output of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultAsset {
    pub download_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    InProgress,
    Done(ResultAsset),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractElement {
    Text,
    Tables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Rendition {
    Figures,
    Tables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    Csv,
    Xlsx,
}

/// Parameters of one extract job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractJob {
    #[serde(rename = "assetID")]
    pub asset_id: String,
    pub elements_to_extract: Vec<ExtractElement>,
    pub elements_to_extract_renditions: Vec<Rendition>,
    pub table_output_format: TableFormat,
}

impl ExtractJob {
    /// Text and tables, figure renditions, tables as CSV.
    pub fn text_tables_figures(asset: &AssetHandle) -> Self {
        Self {
            asset_id: asset.asset_id.clone(),
            elements_to_extract: vec![ExtractElement::Text, ExtractElement::Tables],
            elements_to_extract_renditions: vec![Rendition::Figures],
            table_output_format: TableFormat::Csv,
        }
    }
}

#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Load credentials and obtain an access token. Failure is fatal for the
    /// stage.
    async fn authenticate(&self) -> Result<(), PipelineError>;

    async fn upload(&self, data: Vec<u8>, media_type: &str) -> Result<AssetHandle, ServiceError>;

    async fn submit(&self, job: &ExtractJob) -> Result<JobLocation, ServiceError>;

    async fn poll(&self, location: &JobLocation) -> Result<JobStatus, ServiceError>;

    /// Download the result archive.
    async fn get_content(&self, asset: &ResultAsset) -> Result<Vec<u8>, ServiceError>;
}

// ── Credentials ──────────────────────────────────────────────────────────

/// Service-principal credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl ServiceCredentials {
    /// Parse either the flat `CLIENT_ID` / `CLIENT_SECRETS` layout or the
    /// console download's `client_credentials` object.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let v: Value = serde_json::from_str(json).map_err(|e| e.to_string())?;

        let flat_id = v.get("CLIENT_ID").and_then(Value::as_str);
        let flat_secret = v
            .get("CLIENT_SECRETS")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str);
        if let (Some(id), Some(secret)) = (flat_id, flat_secret) {
            return Ok(Self {
                client_id: id.to_string(),
                client_secret: secret.to_string(),
            });
        }

        let nested = v.get("client_credentials");
        let id = nested.and_then(|c| c.get("client_id")).and_then(Value::as_str);
        let secret = nested
            .and_then(|c| c.get("client_secret"))
            .and_then(Value::as_str);
        match (id, secret) {
            (Some(id), Some(secret)) => Ok(Self {
                client_id: id.to_string(),
                client_secret: secret.to_string(),
            }),
            _ => Err("expected CLIENT_ID and CLIENT_SECRETS[0]".to_string()),
        }
    }

    pub async fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipelineError::Credentials {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        Self::from_json(&raw).map_err(|detail| PipelineError::Credentials {
            path: path.to_path_buf(),
            detail,
        })
    }
}

// ── Adobe PDF Services ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetResponse {
    upload_uri: String,
    #[serde(rename = "assetID")]
    asset_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    resource: Option<DownloadRef>,
    content: Option<DownloadRef>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRef {
    download_uri: String,
}

#[derive(Clone)]
struct Session {
    client_id: String,
    token: String,
}

impl Session {
    fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.token).header("X-API-Key", &self.client_id)
    }
}

pub struct AdobeExtractService {
    client: Client,
    base_url: String,
    credentials_path: PathBuf,
    retry: RetryPolicy,
    session: RwLock<Option<Session>>,
}

impl AdobeExtractService {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            client: build_client(config.request_timeout_secs)?,
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials_path: config.cloud_credentials_path.clone(),
            retry: config.retry_policy(),
            session: RwLock::new(None),
        })
    }

    /// Regional endpoint or proxy.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Snapshot of the current session, applied to every request attempt.
    async fn session_auth(&self) -> Result<Session, ServiceError> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| ServiceError::Sdk("not authenticated".into()))
    }
}

fn service_error(failure: HttpFailure) -> ServiceError {
    match failure.status {
        Some(429) => ServiceError::ServiceUsage {
            message: failure.message,
        },
        Some(status) => ServiceError::ServiceApi {
            status,
            message: failure.message,
        },
        None => ServiceError::Sdk(failure.message),
    }
}

fn sdk_error(e: impl std::fmt::Display) -> ServiceError {
    ServiceError::Sdk(e.to_string())
}

fn parse_status(body: StatusResponse) -> JobStatus {
    match body.status.to_ascii_lowercase().as_str() {
        "done" => match body.resource.or(body.content) {
            Some(r) => JobStatus::Done(ResultAsset {
                download_uri: r.download_uri,
            }),
            None => JobStatus::Failed("job done without a result asset".into()),
        },
        "failed" => JobStatus::Failed(
            body.error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "job failed".into()),
        ),
        _ => JobStatus::InProgress,
    }
}

#[async_trait]
impl ExtractionService for AdobeExtractService {
    async fn authenticate(&self) -> Result<(), PipelineError> {
        let creds = ServiceCredentials::load(&self.credentials_path).await?;
        let url = format!("{}/token", self.base_url);

        let resp = send_with_retry("adobe token", &self.retry, || {
            self.client.post(&url).form(&[
                ("client_id", creds.client_id.as_str()),
                ("client_secret", creds.client_secret.as_str()),
            ])
        })
        .await
        .map_err(|f| PipelineError::Credentials {
            path: self.credentials_path.clone(),
            detail: format!("token request failed: {f}"),
        })?;

        let token: TokenResponse = resp.json().await.map_err(|e| PipelineError::Credentials {
            path: self.credentials_path.clone(),
            detail: format!("invalid token response: {e}"),
        })?;

        *self.session.write().await = Some(Session {
            client_id: creds.client_id,
            token: token.access_token,
        });
        info!("Authenticated with the extraction service");
        Ok(())
    }

    async fn upload(&self, data: Vec<u8>, media_type: &str) -> Result<AssetHandle, ServiceError> {
        let url = format!("{}/assets", self.base_url);
        let body = serde_json::json!({ "mediaType": media_type });
        let auth = self.session_auth().await?;

        let resp = send_with_retry("adobe asset", &self.retry, || {
            auth.apply(self.client.post(&url).json(&body))
        })
        .await
        .map_err(service_error)?;
        let asset: AssetResponse = resp.json().await.map_err(sdk_error)?;

        send_with_retry("adobe asset upload", &self.retry, || {
            self.client
                .put(&asset.upload_uri)
                .header(reqwest::header::CONTENT_TYPE, media_type)
                .body(data.clone())
        })
        .await
        .map_err(service_error)?;

        debug!("Uploaded asset {}", asset.asset_id);
        Ok(AssetHandle {
            asset_id: asset.asset_id,
        })
    }

    async fn submit(&self, job: &ExtractJob) -> Result<JobLocation, ServiceError> {
        let url = format!("{}/operation/extractpdf", self.base_url);
        let auth = self.session_auth().await?;

        let resp = send_with_retry("adobe extract", &self.retry, || {
            auth.apply(self.client.post(&url).json(job))
        })
        .await
        .map_err(service_error)?;

        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServiceError::Sdk("submit response has no location header".into()))?;
        Ok(JobLocation(location.to_string()))
    }

    async fn poll(&self, location: &JobLocation) -> Result<JobStatus, ServiceError> {
        let auth = self.session_auth().await?;

        let resp = send_with_retry("adobe status", &self.retry, || {
            auth.apply(self.client.get(&location.0))
        })
        .await
        .map_err(service_error)?;
        let body: StatusResponse = resp.json().await.map_err(sdk_error)?;
        Ok(parse_status(body))
    }

    async fn get_content(&self, asset: &ResultAsset) -> Result<Vec<u8>, ServiceError> {
        let resp = send_with_retry("adobe download", &self.retry, || {
            self.client.get(&asset.download_uri)
        })
        .await
        .map_err(service_error)?;
        let bytes = resp.bytes().await.map_err(sdk_error)?;
        Ok(bytes.to_vec())
    }
}
