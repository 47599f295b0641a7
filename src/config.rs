//! Configuration types for the ingestion pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Client handles (storage, warehouse, hub,
//! extraction service) are constructed separately and passed to
//! [`crate::orchestrator::Pipeline`]; this struct only carries names, paths
//! and knobs.

use crate::error::PipelineError;
use crate::http::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Configuration for one pipeline run.
///
/// Built via [`PipelineConfig::builder()`].
///
/// # Example
/// ```rust
/// use docpipe::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .bucket("gaia_benchmark_data")
///     .output_dir("adobe_outputs")
///     .cloud_extracted_folder("adobe_extracted")
///     .build()
///     .unwrap();
/// assert_eq!(config.dataset_prefix, "2023/");
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Destination bucket for the staged dataset and every artifact. Required.
    pub bucket: String,

    /// Access token for the dataset hub. Required by the dataset stage only.
    pub hub_token: Option<String>,

    /// Dataset hub repository id, e.g. `gaia-benchmark/GAIA`. Required by the
    /// dataset stage only.
    pub repo_id: Option<String>,

    /// Dataset hub repository type. Default: [`RepoKind::Dataset`].
    pub repo_type: RepoKind,

    /// Only hub files whose path starts with this prefix are staged. Also the
    /// prefix listed when resolving `file_path` for the metadata table.
    /// Default: `2023/`.
    pub dataset_prefix: String,

    /// Line-delimited JSON metadata files to normalize.
    pub metadata_sources: Vec<MetadataSource>,

    /// Storage prefix for normalized metadata CSVs. Default: `cleaned_data/`.
    pub cleaned_prefix: String,

    /// Storage prefix for open-source extraction artifacts. Default: `extracted_data/`.
    pub extraction_prefix: String,

    /// Local scratch directory mirroring validated PDFs. Default: `downloaded_pdfs`.
    pub scratch_dir: PathBuf,

    /// Local directory for cloud-extraction archives and their unpacked
    /// contents. Required.
    pub output_dir: PathBuf,

    /// Storage folder receiving the unpacked cloud-extraction files. Required.
    pub cloud_extracted_folder: String,

    /// JSON file holding the extraction service's client id and secret.
    /// Default: `Adobe_Credentials.json`.
    pub cloud_credentials_path: PathBuf,

    /// Delay between cloud job status polls in milliseconds. Default: 2000.
    pub poll_interval_ms: u64,

    /// Upper bound on waiting for one cloud extraction job or warehouse load
    /// job, in seconds. Default: 600.
    pub poll_timeout_secs: u64,

    /// Retry attempts for transient HTTP failures (429, 5xx, timeouts). Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-request HTTP timeout in seconds. Default: 120.
    pub request_timeout_secs: u64,

    /// Warehouse table names.
    pub tables: TableNames,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            hub_token: None,
            repo_id: None,
            repo_type: RepoKind::default(),
            dataset_prefix: "2023/".to_string(),
            metadata_sources: MetadataSource::benchmark_defaults(),
            cleaned_prefix: "cleaned_data/".to_string(),
            extraction_prefix: "extracted_data/".to_string(),
            scratch_dir: PathBuf::from("downloaded_pdfs"),
            output_dir: PathBuf::new(),
            cloud_extracted_folder: String::new(),
            cloud_credentials_path: PathBuf::from("Adobe_Credentials.json"),
            poll_interval_ms: 2000,
            poll_timeout_secs: 600,
            max_retries: 3,
            retry_backoff_ms: 500,
            request_timeout_secs: 120,
            tables: TableNames::default(),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("bucket", &self.bucket)
            .field("hub_token", &self.hub_token.as_ref().map(|_| "<redacted>"))
            .field("repo_id", &self.repo_id)
            .field("repo_type", &self.repo_type)
            .field("dataset_prefix", &self.dataset_prefix)
            .field("metadata_sources", &self.metadata_sources)
            .field("scratch_dir", &self.scratch_dir)
            .field("output_dir", &self.output_dir)
            .field("cloud_extracted_folder", &self.cloud_extracted_folder)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("tables", &self.tables)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Retry policy shared by every HTTP client built from this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_ms: self.retry_backoff_ms,
        }
    }

    /// Hub token, or `MissingConfig` for the dataset stage.
    pub fn require_hub_token(&self) -> Result<&str, PipelineError> {
        require(self.hub_token.as_deref(), "HUGGINGFACE_TOKEN")
    }

    /// Hub repository id, or `MissingConfig` for the dataset stage.
    pub fn require_repo_id(&self) -> Result<&str, PipelineError> {
        require(self.repo_id.as_deref(), "REPO_ID")
    }
}

fn require<'a>(value: Option<&'a str>, key: &str) -> Result<&'a str, PipelineError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(PipelineError::MissingConfig {
            key: key.to_string(),
        }),
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.bucket = bucket.into();
        self
    }

    pub fn hub_token(mut self, token: impl Into<String>) -> Self {
        self.config.hub_token = Some(token.into());
        self
    }

    pub fn repo_id(mut self, id: impl Into<String>) -> Self {
        self.config.repo_id = Some(id.into());
        self
    }

    pub fn repo_type(mut self, kind: RepoKind) -> Self {
        self.config.repo_type = kind;
        self
    }

    pub fn dataset_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.dataset_prefix = prefix.into();
        self
    }

    pub fn metadata_sources(mut self, sources: Vec<MetadataSource>) -> Self {
        self.config.metadata_sources = sources;
        self
    }

    pub fn cleaned_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.cleaned_prefix = with_trailing_slash(prefix.into());
        self
    }

    pub fn extraction_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.extraction_prefix = with_trailing_slash(prefix.into());
        self
    }

    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = dir.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn cloud_extracted_folder(mut self, folder: impl Into<String>) -> Self {
        self.config.cloud_extracted_folder = folder.into().trim_end_matches('/').to_string();
        self
    }

    pub fn cloud_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cloud_credentials_path = path.into();
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn poll_timeout_secs(mut self, secs: u64) -> Self {
        self.config.poll_timeout_secs = secs.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs.max(1);
        self
    }

    pub fn tables(mut self, tables: TableNames) -> Self {
        self.config.tables = tables;
        self
    }

    /// Build the configuration, validating required values.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.bucket.trim().is_empty() {
            return Err(PipelineError::MissingConfig {
                key: "BUCKET_NAME".into(),
            });
        }
        if c.output_dir.as_os_str().is_empty() {
            return Err(PipelineError::MissingConfig {
                key: "OUTPUT_DIRECTORY".into(),
            });
        }
        if c.cloud_extracted_folder.trim().is_empty() {
            return Err(PipelineError::MissingConfig {
                key: "GCS_EXTRACTED_FOLDER".into(),
            });
        }
        if c.metadata_sources.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "At least one metadata source is required".into(),
            ));
        }
        if c.poll_interval_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "Poll interval must be ≥ 1ms".into(),
            ));
        }
        Ok(self.config)
    }
}

fn with_trailing_slash(mut prefix: String) -> String {
    if !prefix.is_empty() && !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

// ── Supporting types ─────────────────────────────────────────────────────

/// Dataset hub repository type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepoKind {
    #[default]
    Dataset,
    Model,
    Space,
}

impl FromStr for RepoKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dataset" | "datasets" => Ok(RepoKind::Dataset),
            "model" | "models" => Ok(RepoKind::Model),
            "space" | "spaces" => Ok(RepoKind::Space),
            other => Err(PipelineError::InvalidConfig(format!(
                "Unknown repository type '{other}' (expected dataset, model or space)"
            ))),
        }
    }
}

/// One line-delimited JSON metadata file and the label stamped on its rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSource {
    /// Object name of the JSONL file in the bucket.
    pub object: String,
    /// File name of the normalized CSV under the cleaned prefix.
    pub csv_name: String,
    /// Value written into every row's `dataset_source` column.
    pub label: String,
}

impl MetadataSource {
    pub fn new(object: impl Into<String>, label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            object: object.into(),
            csv_name: format!("{label}.csv"),
            label,
        }
    }

    /// The benchmark's test and validation splits.
    pub fn benchmark_defaults() -> Vec<Self> {
        vec![
            Self::new("2023/test/metadata.jsonl", "metadata_test"),
            Self::new("2023/validation/metadata.jsonl", "metadata_validation"),
        ]
    }
}

/// Warehouse table names, one per destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNames {
    pub metadata: String,
    pub opensource: String,
    pub cloud: String,
    pub users: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            metadata: "combined_metadata".to_string(),
            opensource: "opensource_extracted".to_string(),
            cloud: "cloud_extracted".to_string(),
            users: "users".to_string(),
        }
    }
}
