//! Local-directory object store.
//!
//! Object `a/b/c.pdf` lives at `<root>/a/b/c.pdf`. Used for offline runs and
//! by the integration tests.

use super::ObjectStore;
use crate::error::PipelineError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    bucket: String,
}

impl FsObjectStore {
    /// Store rooted at `root`, reporting URIs under `bucket`.
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, op: &'static str, name: &str) -> Result<PathBuf, PipelineError> {
        let rel = Path::new(name);
        let valid = !name.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(PipelineError::storage(op, name, "invalid object name"));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, PipelineError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<String>, PipelineError> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut names = Vec::new();
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.map_err(|e| PipelineError::storage("list", &prefix, e))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if name.starts_with(&prefix) {
                    names.push(name);
                }
            }
            names.sort();
            Ok(names)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("spawn_blocking panicked: {e}")))?
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.path_for("get", name)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::storage("get", name, e))
    }

    async fn put(
        &self,
        name: &str,
        data: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), PipelineError> {
        let path = self.path_for("put", name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::storage("put", name, e))?;
        }
        debug!("put {} ({} bytes)", name, data.len());
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| PipelineError::storage("put", name, e))
    }

    async fn delete(&self, name: &str) -> Result<(), PipelineError> {
        let path = self.path_for("delete", name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::storage("delete", name, e)),
        }
    }
}
