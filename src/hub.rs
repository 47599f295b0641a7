//! Dataset hub access.
//!
//! [`HfDatasetHub`] wraps the blocking `hf-hub` client. Downloads land in the
//! hub's local cache; the dataset stage reads them from there and uploads
//! them to the bucket.

use crate::config::RepoKind;
use crate::error::PipelineError;
use crate::pipeline::blocking;
use async_trait::async_trait;
use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use std::path::PathBuf;
use tracing::debug;

#[async_trait]
pub trait DatasetHub: Send + Sync {
    /// Every file path in the repository.
    async fn list_files(&self, repo_id: &str, kind: RepoKind)
        -> Result<Vec<String>, PipelineError>;

    /// Download one file and return its local path.
    async fn download(
        &self,
        repo_id: &str,
        kind: RepoKind,
        path: &str,
    ) -> Result<PathBuf, PipelineError>;
}

/// Hugging Face hub client.
#[derive(Clone)]
pub struct HfDatasetHub {
    token: String,
    cache_dir: Option<PathBuf>,
}

impl std::fmt::Debug for HfDatasetHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfDatasetHub")
            .field("token", &"<redacted>")
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

impl HfDatasetHub {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            cache_dir: None,
        }
    }

    /// Override the hub's default cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    fn api(&self, repo_id: &str) -> Result<Api, PipelineError> {
        let mut builder = ApiBuilder::new()
            .with_progress(false)
            .with_token(Some(self.token.clone()));
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        builder.build().map_err(|e| PipelineError::Hub {
            repo: repo_id.to_string(),
            detail: format!("failed building hf-hub client: {e}"),
        })
    }
}

fn repo_type(kind: RepoKind) -> RepoType {
    match kind {
        RepoKind::Dataset => RepoType::Dataset,
        RepoKind::Model => RepoType::Model,
        RepoKind::Space => RepoType::Space,
    }
}

#[async_trait]
impl DatasetHub for HfDatasetHub {
    async fn list_files(
        &self,
        repo_id: &str,
        kind: RepoKind,
    ) -> Result<Vec<String>, PipelineError> {
        let hub = self.clone();
        let repo_id = repo_id.to_string();

        blocking(move || {
            let api = hub.api(&repo_id)?;
            let info = api
                .repo(Repo::new(repo_id.clone(), repo_type(kind)))
                .info()
                .map_err(|e| PipelineError::Hub {
                    repo: repo_id.clone(),
                    detail: format!("failed reading repository info: {e}"),
                })?;
            let files: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();
            debug!("{}: {} files on hub", repo_id, files.len());
            Ok(files)
        })
        .await
    }

    async fn download(
        &self,
        repo_id: &str,
        kind: RepoKind,
        path: &str,
    ) -> Result<PathBuf, PipelineError> {
        let hub = self.clone();
        let repo_id = repo_id.to_string();
        let path = path.to_string();

        blocking(move || {
            let api = hub.api(&repo_id)?;
            api.repo(Repo::new(repo_id.clone(), repo_type(kind)))
                .get(&path)
                .map_err(|e| PipelineError::Hub {
                    repo: repo_id.clone(),
                    detail: format!("failed downloading '{path}': {e}"),
                })
        })
        .await
    }
}
